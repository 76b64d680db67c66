//! Decisions, rule results and the aggregation of rule outcomes.

mod engine;
mod remote;
pub mod rules;

pub use engine::{Detector, DetectorVerdict, Engine, EngineBuilder, RequestContext, IP_CHARACTERISTIC};
pub use remote::{FailurePolicy, RemoteDecider, RemoteRequest, RemoteResponse};
pub use rules::{compile_rules, rules_digest, FilterAction, Rule, RuleConfig, RuleKind, RuleKindConfig};

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ratelimit::{Fingerprint, Quota};

/// Categorical outcome of a rule or of a whole decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conclusion {
    Allow,
    Deny,
    Challenge,
    Error,
    Skip,
}

impl Conclusion {
    /// Rank used when rules disagree: `DENY > CHALLENGE > ERROR > ALLOW`.
    /// `SKIP` never wins.
    pub fn precedence(self) -> u8 {
        match self {
            Conclusion::Deny => 4,
            Conclusion::Challenge => 3,
            Conclusion::Error => 2,
            Conclusion::Allow => 1,
            Conclusion::Skip => 0,
        }
    }
}

/// Rule execution mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// Enforce the rule's verdict
    #[default]
    Live,
    /// Evaluate and record, never block
    DryRun,
}

/// How a rule result came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleState {
    /// The rule was evaluated for this request
    Run,
    /// The result was served from an earlier cached denial
    Cached,
    /// The rule was not evaluated because an earlier rule already denied
    NotRun,
    /// The rule ran locally but the remote service could not confirm it
    Degraded,
}

/// Why a rule concluded what it did. Each rule kind carries its own payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    RateLimit {
        max: u32,
        remaining: u32,
        reset_secs: u32,
        window_secs: u32,
    },
    Filter {
        /// Address or range that matched, if any
        matched: Option<String>,
    },
    Bot {
        allowed: Vec<String>,
        denied: Vec<String>,
        verified: bool,
        spoofed: bool,
    },
    SensitiveInfo {
        allowed: Vec<String>,
        denied: Vec<String>,
    },
    Email {
        email_types: Vec<String>,
    },
    Error {
        message: String,
    },
}

impl Reason {
    pub fn kind(&self) -> &'static str {
        match self {
            Reason::RateLimit { .. } => "RATE_LIMIT",
            Reason::Filter { .. } => "FILTER",
            Reason::Bot { .. } => "BOT",
            Reason::SensitiveInfo { .. } => "SENSITIVE_INFO",
            Reason::Email { .. } => "EMAIL",
            Reason::Error { .. } => "ERROR",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reason::Error {
            message: message.into(),
        }
    }
}

impl From<Quota> for Reason {
    fn from(quota: Quota) -> Self {
        Reason::RateLimit {
            max: quota.max,
            remaining: quota.remaining,
            reset_secs: quota.reset_secs,
            window_secs: quota.window_secs,
        }
    }
}

/// Outcome of a single rule for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub mode: Mode,
    /// The rule's own verdict, kept even when the rule runs in dry-run mode
    pub conclusion: Conclusion,
    pub reason: Option<Reason>,
    /// Seconds this result may be reused for the same fingerprint
    pub ttl: u32,
    pub state: RuleState,
    pub fingerprint: Option<Fingerprint>,
}

impl RuleResult {
    pub fn new(rule_id: &str, mode: Mode, conclusion: Conclusion, reason: Reason) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            mode,
            conclusion,
            reason: Some(reason),
            ttl: 0,
            state: RuleState::Run,
            fingerprint: None,
        }
    }

    pub fn error(rule_id: &str, mode: Mode, message: impl Into<String>) -> Self {
        Self::new(rule_id, mode, Conclusion::Error, Reason::error(message))
    }

    pub fn not_run(rule_id: &str, mode: Mode) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            mode,
            conclusion: Conclusion::Skip,
            reason: None,
            ttl: 0,
            state: RuleState::NotRun,
            fingerprint: None,
        }
    }

    /// The conclusion this result contributes to the overall decision.
    /// Dry-run rules always contribute `ALLOW`.
    pub fn effective_conclusion(&self) -> Conclusion {
        match (self.mode, self.conclusion) {
            (_, Conclusion::Skip) => Conclusion::Skip,
            (Mode::DryRun, _) => Conclusion::Allow,
            (Mode::Live, conclusion) => conclusion,
        }
    }
}

/// Combine rule results into one conclusion and the reason of the rule that
/// produced it.
pub fn aggregate(results: &[RuleResult]) -> (Conclusion, Option<Reason>) {
    let mut winner: Option<&RuleResult> = None;
    for result in results {
        let conclusion = result.effective_conclusion();
        if conclusion == Conclusion::Skip {
            continue;
        }
        let better = match winner {
            None => true,
            Some(current) => {
                conclusion.precedence() > current.effective_conclusion().precedence()
            }
        };
        if better {
            winner = Some(result);
        }
    }

    match winner {
        Some(result) => {
            let conclusion = result.effective_conclusion();
            let reason = if conclusion == result.conclusion {
                result.reason.clone()
            } else {
                None
            };
            (conclusion, reason)
        }
        None => (Conclusion::Allow, None),
    }
}

/// Network details of the requesting address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpDetails {
    pub address: IpAddr,
    pub version: u8,
    pub is_loopback: bool,
    pub is_private: bool,
    /// Country code supplied by the remote service
    pub country: Option<String>,
}

impl IpDetails {
    pub fn from_addr(address: IpAddr) -> Self {
        let (version, is_private) = match address {
            IpAddr::V4(v4) => (4, v4.is_private() || v4.is_link_local()),
            // fc00::/7 unique local and fe80::/10 link local
            IpAddr::V6(v6) => {
                let first = v6.segments()[0];
                (6, (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80)
            }
        };
        Self {
            address,
            version,
            is_loopback: address.is_loopback(),
            is_private,
            country: None,
        }
    }
}

/// The aggregate outcome of one `protect` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub conclusion: Conclusion,
    pub reason: Option<Reason>,
    pub results: Vec<RuleResult>,
    pub ip: Option<IpDetails>,
}

impl Decision {
    /// Build a decision from rule results, with a fresh local id.
    pub fn from_results(results: Vec<RuleResult>, ip: Option<IpDetails>) -> Self {
        Self::with_id(local_decision_id(), results, ip)
    }

    pub fn with_id(id: String, results: Vec<RuleResult>, ip: Option<IpDetails>) -> Self {
        let (conclusion, reason) = aggregate(&results);
        Self {
            id,
            conclusion,
            reason,
            results,
            ip,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.conclusion == Conclusion::Allow
    }

    pub fn is_denied(&self) -> bool {
        self.conclusion == Conclusion::Deny
    }

    pub fn is_challenged(&self) -> bool {
        self.conclusion == Conclusion::Challenge
    }

    pub fn is_errored(&self) -> bool {
        self.conclusion == Conclusion::Error
    }

    /// The first live rule that denied the request.
    pub fn denied_by(&self) -> Option<&RuleResult> {
        self.results
            .iter()
            .find(|r| r.effective_conclusion() == Conclusion::Deny)
    }

    pub fn result_for(&self, rule_id: &str) -> Option<&RuleResult> {
        self.results.iter().find(|r| r.rule_id == rule_id)
    }
}

fn local_decision_id() -> String {
    format!("lreq_{}", Uuid::new_v4().simple())
}
