//! Configuration management for Arbiter.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::decision::{compile_rules, FailurePolicy, RuleConfig};
use crate::error::{ArbiterError, Result};

/// Main configuration for the Arbiter engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Site identity
    #[serde(default)]
    pub site: SiteConfig,

    /// Remote decision service; local-only when absent
    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    /// Rules in evaluation order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Site configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site key, also used to salt fingerprints
    #[serde(default = "default_site_key")]
    pub key: String,

    /// Remember live denials until their reset time
    #[serde(default = "default_cache_denials")]
    pub cache_denials: bool,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            key: default_site_key(),
            cache_denials: default_cache_denials(),
        }
    }
}

fn default_site_key() -> String {
    "default".to_string()
}

fn default_cache_denials() -> bool {
    true
}

/// Remote decision service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// gRPC endpoint, e.g. `http://127.0.0.1:8081`
    pub url: String,

    /// Bound on a single remote call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    500
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ArbiterConfig {
    /// Load configuration from a file, with `ARBITER__`-prefixed environment
    /// variables layered on top (e.g. `ARBITER__SITE__KEY`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: ArbiterConfig = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("ARBITER").prefix_separator("__").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: ArbiterConfig =
            serde_yaml::from_str(contents).map_err(|e| ArbiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that could never produce a working engine.
    pub fn validate(&self) -> Result<()> {
        if self.site.key.trim().is_empty() {
            return Err(ArbiterError::Config("site.key must not be empty".to_string()));
        }
        if let Some(remote) = &self.remote {
            if remote.url.trim().is_empty() {
                return Err(ArbiterError::Config("remote.url must not be empty".to_string()));
            }
            if remote.timeout_ms == 0 {
                return Err(ArbiterError::Config(
                    "remote.timeout_ms must be positive".to_string(),
                ));
            }
        }
        compile_rules(&self.rules)?;
        Ok(())
    }
}
