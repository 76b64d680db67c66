use std::sync::Arc;
use std::time::Duration;

use arbiter::config::ArbiterConfig;
use arbiter::decision::{Conclusion, Engine, EngineBuilder, Mode, Reason, RequestContext, RuleState};
use arbiter::error::Result;
use arbiter::ratelimit::{Clock, ManualClock, MemoryStore, TtlStore};

const CONFIG: &str = r#"
site:
  key: integration
rules:
  - id: office
    type: filter
    mode: DRY_RUN
    action: ALLOW
    ips: ["10.0.0.0/8"]
  - id: burst
    type: token_bucket
    refill_rate: 1
    interval: 10s
    capacity: 2
  - id: hourly
    type: fixed_window
    characteristics: [userId]
    window: 1h
    max: 3
"#;

fn build(config: &ArbiterConfig, clock: &ManualClock) -> arbiter::decision::Engine {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    EngineBuilder::from_config(config)
        .clock(clock.clone())
        .store(Arc::new(MemoryStore::new(clock)))
        .build()
        .unwrap()
}

fn request(ip: &str, user: &str) -> RequestContext {
    RequestContext::new()
        .with_ip(ip.parse().unwrap())
        .with_characteristic("userId", user)
}

#[tokio::test]
async fn test_yaml_configuration_end_to_end() {
    let config = ArbiterConfig::from_yaml(CONFIG).unwrap();
    let clock = ManualClock::new(1_700_000_000_000);
    let engine = build(&config, &clock);

    // Outside the office range: the dry-run filter denies but does not block.
    let first = engine.protect(&request("8.8.8.8", "alice")).await;
    assert_eq!(first.conclusion, Conclusion::Allow);
    let office = first.result_for("office").unwrap();
    assert_eq!(office.mode, Mode::DryRun);
    assert_eq!(office.conclusion, Conclusion::Deny);
    assert_eq!(first.ip.as_ref().unwrap().version, 4);

    // Second request drains the bucket, third is denied by it.
    assert!(engine.protect(&request("8.8.8.8", "alice")).await.is_allowed());
    let denied = engine.protect(&request("8.8.8.8", "alice")).await;
    assert!(denied.is_denied());
    assert_eq!(denied.denied_by().unwrap().rule_id, "burst");
    assert_eq!(
        denied.result_for("hourly").unwrap().state,
        RuleState::NotRun
    );

    // One token back after an interval.
    clock.advance(Duration::from_secs(10));
    assert!(engine.protect(&request("8.8.8.8", "alice")).await.is_allowed());

    // Alice has now used her hourly allowance of three.
    clock.advance(Duration::from_secs(20));
    let hourly = engine.protect(&request("8.8.8.8", "alice")).await;
    assert!(hourly.is_denied());
    assert_eq!(hourly.denied_by().unwrap().rule_id, "hourly");
    match &hourly.reason {
        Some(Reason::RateLimit { max, remaining, .. }) => {
            assert_eq!(*max, 3);
            assert_eq!(*remaining, 0);
        }
        other => panic!("unexpected reason {:?}", other),
    }

    // Another address and user is unaffected.
    assert!(engine.protect(&request("9.9.9.9", "bob")).await.is_allowed());
}

#[tokio::test]
async fn test_decision_serializes_to_json() {
    let config = ArbiterConfig::from_yaml(CONFIG).unwrap();
    let clock = ManualClock::new(1_700_000_000_000);
    let engine = build(&config, &clock);

    let decision = engine.protect(&request("10.1.1.1", "carol")).await;
    let json = serde_json::to_value(&decision).unwrap();

    assert_eq!(json["conclusion"], "ALLOW");
    assert_eq!(json["results"][0]["rule_id"], "office");
    assert_eq!(json["results"][0]["reason"]["type"], "FILTER");
    assert_eq!(json["results"][1]["reason"]["type"], "RATE_LIMIT");
    assert!(json["id"].as_str().unwrap().starts_with("lreq_"));
}

#[tokio::test]
async fn test_engines_sharing_a_store_share_counters() {
    let config = ArbiterConfig::from_yaml(
        "rules:\n  - {id: shared, type: fixed_window, window: 1m, max: 1}\n",
    )
    .unwrap();
    let clock = ManualClock::new(1_700_000_040_000);
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(MemoryStore::new(shared_clock.clone()));

    let a = EngineBuilder::from_config(&config)
        .clock(shared_clock.clone())
        .store(store.clone())
        .build()
        .unwrap();
    let b = EngineBuilder::from_config(&config)
        .clock(shared_clock)
        .store(store)
        .build()
        .unwrap();

    let req = RequestContext::new().with_ip("192.0.2.7".parse().unwrap());
    assert!(a.protect(&req).await.is_allowed());
    assert!(b.protect(&req).await.is_denied());
}

/// Store that holds every update open for a while, widening the window in
/// which unsynchronized callers would interleave.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

impl TtlStore for SlowStore {
    fn get(&self, namespace: &str, key: &str) -> Result<(Option<String>, u32)> {
        self.inner.get(namespace, key)
    }

    fn set(&self, namespace: &str, key: &str, value: &str, ttl_secs: u32) -> Result<()> {
        self.inner.set(namespace, key, value, ttl_secs)
    }

    fn update(
        &self,
        namespace: &str,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<Option<(String, u32)>>,
    ) -> Result<()> {
        self.inner.update(namespace, key, &mut |current: Option<String>| {
            std::thread::sleep(self.delay);
            apply(current)
        })
    }
}

fn engines_on(config: &ArbiterConfig, store: Arc<dyn TtlStore>, clock: Arc<dyn Clock>, count: usize) -> Vec<Arc<Engine>> {
    (0..count)
        .map(|_| {
            let engine = EngineBuilder::from_config(config)
                .clock(clock.clone())
                .store(store.clone())
                .build()
                .unwrap();
            Arc::new(engine)
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_engines_sharing_a_store_admit_once() {
    let config = ArbiterConfig::from_yaml(
        "rules:\n  - {id: checkout, type: fixed_window, window: 1m, max: 1}\n",
    )
    .unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_000_040_000));
    let store: Arc<dyn TtlStore> = Arc::new(SlowStore {
        inner: MemoryStore::new(clock.clone()),
        delay: Duration::from_millis(20),
    });
    let engines = engines_on(&config, store, clock, 2);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let engine = engines[i % 2].clone();
            tokio::spawn(async move {
                let req = RequestContext::new().with_ip("198.51.100.4".parse().unwrap());
                engine.protect(&req).await
            })
        })
        .collect();

    let decisions = futures::future::join_all(tasks).await;
    let allowed = decisions
        .into_iter()
        .map(|d| d.unwrap())
        .filter(|d| d.is_allowed())
        .count();
    assert_eq!(allowed, 1);
}

#[tokio::test]
async fn test_cached_denials_depend_on_requested_units() {
    let config = ArbiterConfig::from_yaml(
        r#"
rules:
  - id: uploads
    type: token_bucket
    characteristics: [userId]
    refill_rate: 5
    interval: 10s
    capacity: 10
  - id: exports
    type: fixed_window
    characteristics: [userId]
    window: 1m
    max: 20
"#,
    )
    .unwrap();
    let clock = ManualClock::new(1_700_000_040_000);
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let engines = engines_on(
        &config,
        Arc::new(MemoryStore::new(shared_clock.clone())),
        shared_clock,
        2,
    );
    let dana = |units: u32| {
        RequestContext::new()
            .with_characteristic("userId", "dana")
            .with_requested(units)
    };

    // More than the bucket can ever hold is denied, and the denial is cached.
    let oversized = engines[0].protect(&dana(11)).await;
    assert_eq!(oversized.denied_by().unwrap().rule_id, "uploads");
    assert_eq!(
        engines[0].protect(&dana(11)).await.results[0].state,
        RuleState::Cached
    );

    // Smaller requests go through on either engine until the bucket is dry.
    assert!(engines[0].protect(&dana(1)).await.is_allowed());
    assert!(engines[1].protect(&dana(6)).await.is_allowed());
    let drained = engines[0].protect(&dana(4)).await;
    assert!(drained.is_denied());
    assert_eq!(drained.results[0].state, RuleState::Run);
    assert!(engines[1].protect(&dana(3)).await.is_allowed());

    // Five tokens arrive after one interval; the short-lived denial for four
    // units does not hold them back.
    clock.advance(Duration::from_secs(10));
    let refilled = engines[0].protect(&dana(4)).await;
    assert!(refilled.is_allowed());
    assert_eq!(refilled.results[0].state, RuleState::Run);
}
