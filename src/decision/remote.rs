//! Reconciliation of local verdicts with a remote decision service.
//!
//! The remote service owns globally consistent counters shared by every
//! engine instance. Its answers replace the local rate limit results they
//! name. When it cannot be reached in time the local results stand, adjusted
//! by the configured [`FailurePolicy`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Conclusion, Reason, RuleResult, RuleState};
use crate::error::Result;

/// Request sent to the remote decision service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    /// Fingerprint over every characteristic of the request
    pub fingerprint: String,
    /// Digest of the rule configuration that produced `results`
    pub rules_digest: String,
    pub requested: u32,
    /// Results of local evaluation
    pub results: Vec<RuleResult>,
}

/// Answer from the remote decision service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub id: String,
    pub conclusion: Conclusion,
    pub results: Vec<RuleResult>,
    pub country: Option<String>,
}

/// A remote service able to produce authoritative rule results.
#[async_trait]
pub trait RemoteDecider: Send + Sync {
    async fn decide(&self, request: RemoteRequest) -> Result<RemoteResponse>;
}

/// What to do with local rate limit results when the remote call fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep the local verdict, marked as degraded
    #[default]
    FailOpen,
    /// Deny, marked as degraded
    FailClosed,
}

/// A configured remote decider with its call bound and failure policy.
#[derive(Clone)]
pub(crate) struct RemoteSettings {
    pub decider: Arc<dyn RemoteDecider>,
    pub timeout: Duration,
    pub policy: FailurePolicy,
}

/// Replace local results with the remote results carrying the same rule id.
///
/// Only entries flagged in `replaceable` are touched; the local mode and
/// fingerprint are kept. Returns the number of results replaced.
pub(crate) fn merge_remote(
    results: &mut [RuleResult],
    replaceable: &[bool],
    remote: &[RuleResult],
) -> usize {
    let mut replaced = 0;
    for (result, can_replace) in results.iter_mut().zip(replaceable) {
        if !*can_replace || result.state != RuleState::Run {
            continue;
        }
        let Some(authoritative) = remote.iter().find(|r| r.rule_id == result.rule_id) else {
            continue;
        };
        result.conclusion = authoritative.conclusion;
        result.reason = authoritative.reason.clone();
        result.ttl = authoritative.ttl;
        replaced += 1;
    }
    replaced
}

/// Mark the affected results after a failed remote call.
pub(crate) fn degrade(
    results: &mut [RuleResult],
    affected: &[bool],
    policy: FailurePolicy,
    message: &str,
) {
    for (result, is_affected) in results.iter_mut().zip(affected) {
        if !*is_affected || result.state != RuleState::Run {
            continue;
        }
        result.state = RuleState::Degraded;
        match policy {
            FailurePolicy::FailOpen => {}
            FailurePolicy::FailClosed => {
                result.conclusion = Conclusion::Deny;
                result.reason = Some(Reason::error(message));
                result.ttl = 0;
            }
        }
    }
}
