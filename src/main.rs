use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use arbiter::config::{ArbiterConfig, LoggingConfig};
use arbiter::decision::{EngineBuilder, RequestContext};
use arbiter::grpc::GrpcRemote;

/// Evaluate requests against a rule configuration and print the decisions.
#[derive(Debug, Parser)]
#[command(name = "arbiter", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Source address of the request
    #[arg(long)]
    ip: Option<IpAddr>,

    /// Request characteristic as name=value; may be repeated
    #[arg(short = 'c', long = "characteristic", value_parser = parse_characteristic)]
    characteristics: Vec<(String, String)>,

    /// Units the request consumes from rate limits
    #[arg(long, default_value_t = 1)]
    requested: u32,

    /// Evaluate the same request this many times
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

fn parse_characteristic(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected name=value, got {:?}", input)),
    }
}

fn init_tracing(logging: &LoggingConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ArbiterConfig::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    init_tracing(&config.logging, cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(site = %config.site.key, rules = config.rules.len(), "Configuration loaded");

    let mut builder = EngineBuilder::from_config(&config);
    if let Some(remote) = &config.remote {
        let client = GrpcRemote::connect_lazy(&remote.url, config.site.key.clone(), remote.timeout())
            .with_context(|| format!("invalid remote url {}", remote.url))?;
        info!(url = %remote.url, policy = ?remote.failure_policy, "Remote decisions enabled");
        builder = builder.remote(Arc::new(client), remote.timeout(), remote.failure_policy);
    }
    let engine = builder.build().context("building decision engine")?;

    let mut request = RequestContext::new().with_requested(cli.requested);
    if let Some(ip) = cli.ip {
        request = request.with_ip(ip);
    }
    for (name, value) in cli.characteristics {
        request = request.with_characteristic(name, value);
    }

    for _ in 0..cli.repeat.max(1) {
        let decision = engine.protect(&request).await;
        println!("{}", serde_json::to_string(&decision)?);
    }

    Ok(())
}
