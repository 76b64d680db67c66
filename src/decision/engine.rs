//! The decision engine.
//!
//! `Engine::protect` evaluates every configured rule for one request, in
//! declared order, and folds the results into a single [`Decision`].

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::remote::{self, FailurePolicy, RemoteDecider, RemoteRequest, RemoteSettings};
use super::rules::{check_unique_ids, rules_digest, FilterAction, Rule, RuleConfig, RuleKind};
use super::{Conclusion, Decision, IpDetails, Mode, Reason, RuleResult, RuleState};
use crate::config::ArbiterConfig;
use crate::error::{ArbiterError, Result};
use crate::ratelimit::duration::format_duration;
use crate::ratelimit::{
    Clock, Fingerprint, Fingerprinter, MemoryStore, RateLimiter, SystemClock, TtlStore,
};

/// Characteristic name under which the request's source address is exposed.
pub const IP_CHARACTERISTIC: &str = "ip.src";

const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything the engine knows about one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub ip: Option<IpAddr>,
    pub characteristics: BTreeMap<String, String>,
    /// Units this request consumes from rate limits
    pub requested: u32,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            ip: None,
            characteristics: BTreeMap::new(),
            requested: 1,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_characteristic(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.characteristics.insert(name.into(), value.into());
        self
    }

    pub fn with_requested(mut self, requested: u32) -> Self {
        self.requested = requested;
        self
    }

    /// Look up a characteristic. `ip.src` falls back to the request address
    /// when it was not supplied explicitly.
    pub fn characteristic(&self, name: &str) -> Option<String> {
        if let Some(value) = self.characteristics.get(name) {
            return Some(value.clone());
        }
        if name == IP_CHARACTERISTIC {
            return self.ip.map(|ip| ip.to_string());
        }
        None
    }

    fn source_ip(&self) -> Result<Option<IpAddr>> {
        match self.characteristics.get(IP_CHARACTERISTIC) {
            Some(value) => crate::ratelimit::ip::parse_ip(value).map(Some),
            None => Ok(self.ip),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Verdict produced by an external detector (bot, sensitive information,
/// email validation and the like).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorVerdict {
    pub conclusion: Conclusion,
    pub reason: Reason,
    /// Seconds the verdict may be reused
    pub ttl: u32,
}

/// An externally implemented analyzer whose verdict participates in the
/// decision like any other rule.
pub trait Detector: Send + Sync {
    fn detect(&self, request: &RequestContext) -> Result<DetectorVerdict>;
}

impl<F> Detector for F
where
    F: Fn(&RequestContext) -> Result<DetectorVerdict> + Send + Sync,
{
    fn detect(&self, request: &RequestContext) -> Result<DetectorVerdict> {
        self(request)
    }
}

enum PendingRule {
    Config(RuleConfig),
    Detector {
        id: String,
        mode: Mode,
        detector: Arc<dyn Detector>,
    },
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    site: String,
    rules: Vec<PendingRule>,
    store: Option<Arc<dyn TtlStore>>,
    clock: Option<Arc<dyn Clock>>,
    remote: Option<RemoteSettings>,
    cache_denials: bool,
}

impl EngineBuilder {
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            rules: Vec::new(),
            store: None,
            clock: None,
            remote: None,
            cache_denials: true,
        }
    }

    /// Start from a loaded configuration. The remote decider, if any, still
    /// has to be attached with [`EngineBuilder::remote`].
    pub fn from_config(config: &ArbiterConfig) -> Self {
        let mut builder = Self::new(config.site.key.clone()).rules(config.rules.iter().cloned());
        builder.cache_denials = config.site.cache_denials;
        builder
    }

    pub fn rule(mut self, rule: RuleConfig) -> Self {
        self.rules.push(PendingRule::Config(rule));
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = RuleConfig>) -> Self {
        self.rules.extend(rules.into_iter().map(PendingRule::Config));
        self
    }

    pub fn detector(mut self, id: impl Into<String>, mode: Mode, detector: Arc<dyn Detector>) -> Self {
        self.rules.push(PendingRule::Detector {
            id: id.into(),
            mode,
            detector,
        });
        self
    }

    pub fn store(mut self, store: Arc<dyn TtlStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn remote(
        mut self,
        decider: Arc<dyn RemoteDecider>,
        timeout: Duration,
        policy: FailurePolicy,
    ) -> Self {
        self.remote = Some(RemoteSettings {
            decider,
            timeout,
            policy,
        });
        self
    }

    /// Attach a remote decider with the default timeout and fail-open policy.
    pub fn remote_default(self, decider: Arc<dyn RemoteDecider>) -> Self {
        self.remote(decider, DEFAULT_REMOTE_TIMEOUT, FailurePolicy::FailOpen)
    }

    pub fn cache_denials(mut self, enabled: bool) -> Self {
        self.cache_denials = enabled;
        self
    }

    /// Validate every rule and build the engine.
    pub fn build(self) -> Result<Engine> {
        let mut rules = Vec::with_capacity(self.rules.len());
        for (position, pending) in self.rules.into_iter().enumerate() {
            let rule = match pending {
                PendingRule::Config(config) => config.compile(position)?,
                PendingRule::Detector { id, mode, detector } => {
                    if id.trim().is_empty() {
                        return Err(ArbiterError::Config(format!(
                            "detector at position {} has an empty id",
                            position
                        )));
                    }
                    Rule {
                        id,
                        mode,
                        kind: RuleKind::Detector(detector),
                    }
                }
            };
            rules.push(rule);
        }
        check_unique_ids(&rules)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(clock.clone())));
        let digest = rules_digest(&rules);

        for rule in &rules {
            if let RuleKind::RateLimit { algorithm, .. } = &rule.kind {
                debug!(
                    rule = %rule.id,
                    mode = ?rule.mode,
                    algorithm = algorithm.name(),
                    window = %format_duration(algorithm.window_secs()),
                    "Rate limit rule loaded"
                );
            }
        }

        info!(
            rules = rules.len(),
            remote = self.remote.is_some(),
            rules_digest = %digest,
            "Decision engine initialized"
        );

        Ok(Engine {
            limiter: RateLimiter::new(store.clone(), clock),
            store,
            rules,
            fingerprinter: Fingerprinter::new(self.site),
            remote: self.remote,
            rules_digest: digest,
            cache_denials: self.cache_denials,
        })
    }
}

/// Evaluates rules for requests. Shareable across tasks.
pub struct Engine {
    rules: Vec<Rule>,
    limiter: RateLimiter,
    store: Arc<dyn TtlStore>,
    fingerprinter: Fingerprinter,
    remote: Option<RemoteSettings>,
    rules_digest: String,
    cache_denials: bool,
}

impl Engine {
    pub fn builder(site: impl Into<String>) -> EngineBuilder {
        EngineBuilder::new(site)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rules_digest(&self) -> &str {
        &self.rules_digest
    }

    /// Decide whether a request may proceed.
    ///
    /// Never fails: problems with individual rules surface as `ERROR`
    /// results inside the decision.
    #[instrument(skip(self, request), fields(rules = self.rules.len(), requested = request.requested))]
    pub async fn protect(&self, request: &RequestContext) -> Decision {
        let ip = match request.source_ip() {
            Ok(ip) => ip.map(IpDetails::from_addr),
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable source address");
                None
            }
        };

        let mut results = self.evaluate_local(request);
        let locally_denied = results
            .iter()
            .any(|r| r.effective_conclusion() == Conclusion::Deny);

        let decision = match &self.remote {
            Some(settings) if !locally_denied => {
                match self.reconcile(settings, request, &mut results).await {
                    Some(remote) => remote.into_decision(results, ip),
                    None => Decision::from_results(results, ip),
                }
            }
            _ => Decision::from_results(results, ip),
        };

        debug!(
            id = %decision.id,
            conclusion = ?decision.conclusion,
            reason = decision.reason.as_ref().map(Reason::kind).unwrap_or("NONE"),
            "Decision made"
        );
        decision
    }

    fn evaluate_local(&self, request: &RequestContext) -> Vec<RuleResult> {
        let mut results = Vec::with_capacity(self.rules.len());
        let mut denied = false;

        for rule in &self.rules {
            if denied {
                results.push(RuleResult::not_run(&rule.id, rule.mode));
                continue;
            }

            let result = self.evaluate_rule(rule, request).unwrap_or_else(|e| {
                warn!(rule = %rule.id, error = %e, "Rule evaluation failed");
                RuleResult::error(&rule.id, rule.mode, e.to_string())
            });

            if result.effective_conclusion() == Conclusion::Deny {
                debug!(rule = %rule.id, "Live rule denied, skipping remaining rules");
                denied = true;
            }
            results.push(result);
        }

        results
    }

    fn evaluate_rule(&self, rule: &Rule, request: &RequestContext) -> Result<RuleResult> {
        match &rule.kind {
            RuleKind::RateLimit {
                algorithm,
                characteristics,
            } => {
                let fingerprint = self.fingerprint(characteristics, request)?;

                if let Some(cached) = self.cached_denial(rule, &fingerprint, request.requested)? {
                    return Ok(cached);
                }

                let outcome = self.limiter.check(
                    &rule.counter_namespace(),
                    algorithm,
                    &fingerprint,
                    request.requested,
                )?;

                let conclusion = if outcome.allowed {
                    Conclusion::Allow
                } else {
                    Conclusion::Deny
                };
                let mut result = RuleResult::new(&rule.id, rule.mode, conclusion, outcome.quota.into());
                if !outcome.allowed {
                    result.ttl = outcome.denied_for_secs.min(outcome.quota.window_secs);
                }
                result.fingerprint = Some(fingerprint);

                self.remember_denial(rule, &result, request.requested)?;
                Ok(result)
            }
            RuleKind::Filter { action, ips } => {
                let ip = request.source_ip()?.ok_or_else(|| {
                    ArbiterError::RuleEvaluation(format!(
                        "missing characteristic {:?}",
                        IP_CHARACTERISTIC
                    ))
                })?;
                let matched = ips.find(&ip).map(|target| target.to_string());
                let conclusion = match (action, matched.is_some()) {
                    (FilterAction::Deny, true) | (FilterAction::Allow, false) => Conclusion::Deny,
                    (FilterAction::Deny, false) | (FilterAction::Allow, true) => Conclusion::Allow,
                };
                Ok(RuleResult::new(
                    &rule.id,
                    rule.mode,
                    conclusion,
                    Reason::Filter { matched },
                ))
            }
            RuleKind::Detector(detector) => {
                let verdict = detector.detect(request)?;
                let mut result = RuleResult::new(&rule.id, rule.mode, verdict.conclusion, verdict.reason);
                result.ttl = verdict.ttl;
                Ok(result)
            }
        }
    }

    fn fingerprint(&self, characteristics: &[String], request: &RequestContext) -> Result<Fingerprint> {
        let mut values = Vec::with_capacity(characteristics.len());
        for name in characteristics {
            let value = request.characteristic(name).ok_or_else(|| {
                ArbiterError::RuleEvaluation(format!("missing characteristic {:?}", name))
            })?;
            values.push((name.as_str(), value));
        }
        Ok(self
            .fingerprinter
            .fingerprint(values.iter().map(|(name, value)| (*name, value.as_str()))))
    }

    fn request_fingerprint(&self, request: &RequestContext) -> Fingerprint {
        let mut values: Vec<(&str, String)> = request
            .characteristics
            .iter()
            .map(|(name, value)| (name.as_str(), value.clone()))
            .collect();
        if !request.characteristics.contains_key(IP_CHARACTERISTIC) {
            if let Some(ip) = request.ip {
                values.push((IP_CHARACTERISTIC, ip.to_string()));
            }
        }
        self.fingerprinter
            .fingerprint(values.iter().map(|(name, value)| (*name, value.as_str())))
    }

    /// Denials are cached per fingerprint and requested units: a smaller
    /// request may still fit where a larger one did not.
    fn denial_key(fingerprint: &Fingerprint, requested: u32) -> String {
        format!("{}#{}", fingerprint, requested)
    }

    fn cached_denial(
        &self,
        rule: &Rule,
        fingerprint: &Fingerprint,
        requested: u32,
    ) -> Result<Option<RuleResult>> {
        if !self.cache_denials || rule.mode != Mode::Live {
            return Ok(None);
        }
        let (cached, ttl) = self.store.get(
            &rule.cache_namespace(),
            &Self::denial_key(fingerprint, requested),
        )?;
        let Some(raw) = cached else {
            return Ok(None);
        };

        let mut result: RuleResult = serde_json::from_str(&raw).map_err(|e| {
            ArbiterError::StoreUnavailable(format!("corrupt cached result for {}: {}", rule.id, e))
        })?;
        result.state = RuleState::Cached;
        result.ttl = ttl;
        debug!(rule = %rule.id, ttl = ttl, "Serving cached denial");
        Ok(Some(result))
    }

    fn remember_denial(&self, rule: &Rule, result: &RuleResult, requested: u32) -> Result<()> {
        if !self.cache_denials
            || rule.mode != Mode::Live
            || result.conclusion != Conclusion::Deny
            || result.ttl == 0
        {
            return Ok(());
        }
        let Some(fingerprint) = &result.fingerprint else {
            return Ok(());
        };
        let encoded = serde_json::to_string(result)
            .map_err(|e| ArbiterError::StoreUnavailable(e.to_string()))?;
        self.store.set(
            &rule.cache_namespace(),
            &Self::denial_key(fingerprint, requested),
            &encoded,
            result.ttl,
        )
    }

    /// Ask the remote service to confirm the local results.
    ///
    /// On success the results are updated in place and the remote verdict is
    /// returned. On failure the results are degraded according to the
    /// failure policy and `None` is returned.
    async fn reconcile(
        &self,
        settings: &RemoteSettings,
        request: &RequestContext,
        results: &mut [RuleResult],
    ) -> Option<RemoteOutcome> {
        let rate_limits: Vec<bool> = self.rules.iter().map(Rule::is_rate_limit).collect();
        let remote_request = RemoteRequest {
            fingerprint: self.request_fingerprint(request).to_string(),
            rules_digest: self.rules_digest.clone(),
            requested: request.requested,
            results: results.to_vec(),
        };

        let outcome = tokio::time::timeout(settings.timeout, settings.decider.decide(remote_request)).await;
        let error = match outcome {
            Ok(Ok(response)) => {
                let replaced = remote::merge_remote(results, &rate_limits, &response.results);
                debug!(id = %response.id, replaced = replaced, "Remote decision received");

                for (rule, result) in self.rules.iter().zip(results.iter()) {
                    if let Err(e) = self.remember_denial(rule, result, request.requested) {
                        warn!(rule = %rule.id, error = %e, "Failed to cache remote denial");
                    }
                }
                return Some(RemoteOutcome {
                    id: response.id,
                    conclusion: response.conclusion,
                    country: response.country,
                });
            }
            Ok(Err(e)) => e,
            Err(_) => ArbiterError::RemoteTimeout(settings.timeout.as_millis() as u64),
        };

        warn!(error = %error, policy = ?settings.policy, "Remote decision unavailable, using local results");
        remote::degrade(results, &rate_limits, settings.policy, &error.to_string());
        None
    }
}

/// What the remote service added on top of the merged rule results.
struct RemoteOutcome {
    id: String,
    conclusion: Conclusion,
    country: Option<String>,
}

impl RemoteOutcome {
    fn into_decision(self, results: Vec<RuleResult>, ip: Option<IpDetails>) -> Decision {
        let ip = ip.map(|mut details| {
            details.country = self.country;
            details
        });
        let mut decision = if self.id.is_empty() {
            Decision::from_results(results, ip)
        } else {
            Decision::with_id(self.id, results, ip)
        };
        if self.conclusion.precedence() > decision.conclusion.precedence() {
            debug!(
                local = ?decision.conclusion,
                remote = ?self.conclusion,
                "Remote conclusion outranks rule results"
            );
            decision.conclusion = self.conclusion;
            decision.reason = None;
        }
        decision
    }
}
