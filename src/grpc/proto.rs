//! Wire messages of the `arbiter.decide.v1.DecideService` protocol.

use crate::decision::{Conclusion, Mode, Reason, RuleResult, RuleState};
use crate::error::{ArbiterError, Result};
use crate::ratelimit::Fingerprint;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DecideRequest {
    #[prost(string, tag = "1")]
    pub fingerprint: String,
    #[prost(string, tag = "2")]
    pub rules_digest: String,
    #[prost(uint32, tag = "3")]
    pub requested: u32,
    #[prost(message, repeated, tag = "4")]
    pub results: Vec<RuleResultMessage>,
    #[prost(string, tag = "5")]
    pub sdk_version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DecideResponse {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "ConclusionMessage", tag = "2")]
    pub conclusion: i32,
    #[prost(message, repeated, tag = "3")]
    pub results: Vec<RuleResultMessage>,
    #[prost(string, tag = "4")]
    pub country: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuleResultMessage {
    #[prost(string, tag = "1")]
    pub rule_id: String,
    #[prost(enumeration = "ConclusionMessage", tag = "2")]
    pub conclusion: i32,
    #[prost(enumeration = "RuleStateMessage", tag = "3")]
    pub state: i32,
    #[prost(message, optional, tag = "4")]
    pub reason: Option<ReasonMessage>,
    #[prost(uint32, tag = "5")]
    pub ttl: u32,
    #[prost(string, tag = "6")]
    pub fingerprint: String,
    #[prost(bool, tag = "7")]
    pub dry_run: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReasonMessage {
    #[prost(oneof = "reason_message::Kind", tags = "1, 2, 3, 4, 5, 6")]
    pub kind: Option<reason_message::Kind>,
}

pub mod reason_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        RateLimit(super::RateLimitReason),
        #[prost(message, tag = "2")]
        Filter(super::FilterReason),
        #[prost(message, tag = "3")]
        Bot(super::BotReason),
        #[prost(message, tag = "4")]
        SensitiveInfo(super::SensitiveInfoReason),
        #[prost(message, tag = "5")]
        Email(super::EmailReason),
        #[prost(message, tag = "6")]
        Error(super::ErrorReason),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RateLimitReason {
    #[prost(uint32, tag = "1")]
    pub max: u32,
    #[prost(uint32, tag = "2")]
    pub remaining: u32,
    #[prost(message, optional, tag = "3")]
    pub reset: Option<prost_types::Duration>,
    #[prost(message, optional, tag = "4")]
    pub window: Option<prost_types::Duration>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FilterReason {
    #[prost(string, optional, tag = "1")]
    pub matched: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BotReason {
    #[prost(string, repeated, tag = "1")]
    pub allowed: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub denied: Vec<String>,
    #[prost(bool, tag = "3")]
    pub verified: bool,
    #[prost(bool, tag = "4")]
    pub spoofed: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SensitiveInfoReason {
    #[prost(string, repeated, tag = "1")]
    pub allowed: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub denied: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmailReason {
    #[prost(string, repeated, tag = "1")]
    pub email_types: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorReason {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConclusionMessage {
    Unspecified = 0,
    Allow = 1,
    Deny = 2,
    Challenge = 3,
    Error = 4,
    Skip = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RuleStateMessage {
    Unspecified = 0,
    Run = 1,
    Cached = 2,
    NotRun = 3,
    Degraded = 4,
}

impl From<Conclusion> for ConclusionMessage {
    fn from(conclusion: Conclusion) -> Self {
        match conclusion {
            Conclusion::Allow => ConclusionMessage::Allow,
            Conclusion::Deny => ConclusionMessage::Deny,
            Conclusion::Challenge => ConclusionMessage::Challenge,
            Conclusion::Error => ConclusionMessage::Error,
            Conclusion::Skip => ConclusionMessage::Skip,
        }
    }
}

/// Decode a wire conclusion. Unknown and unspecified values are errors.
pub fn conclusion_from_wire(value: i32) -> Result<Conclusion> {
    match ConclusionMessage::try_from(value) {
        Ok(ConclusionMessage::Allow) => Ok(Conclusion::Allow),
        Ok(ConclusionMessage::Deny) => Ok(Conclusion::Deny),
        Ok(ConclusionMessage::Challenge) => Ok(Conclusion::Challenge),
        Ok(ConclusionMessage::Error) => Ok(Conclusion::Error),
        Ok(ConclusionMessage::Skip) => Ok(Conclusion::Skip),
        Ok(ConclusionMessage::Unspecified) | Err(_) => Err(ArbiterError::Remote(format!(
            "invalid conclusion {}",
            value
        ))),
    }
}

impl From<RuleState> for RuleStateMessage {
    fn from(state: RuleState) -> Self {
        match state {
            RuleState::Run => RuleStateMessage::Run,
            RuleState::Cached => RuleStateMessage::Cached,
            RuleState::NotRun => RuleStateMessage::NotRun,
            RuleState::Degraded => RuleStateMessage::Degraded,
        }
    }
}

fn state_from_wire(value: i32) -> RuleState {
    match RuleStateMessage::try_from(value) {
        Ok(RuleStateMessage::Cached) => RuleState::Cached,
        Ok(RuleStateMessage::NotRun) => RuleState::NotRun,
        Ok(RuleStateMessage::Degraded) => RuleState::Degraded,
        _ => RuleState::Run,
    }
}

fn seconds(secs: u32) -> Option<prost_types::Duration> {
    Some(prost_types::Duration {
        seconds: i64::from(secs),
        nanos: 0,
    })
}

fn from_seconds(duration: Option<prost_types::Duration>) -> u32 {
    duration
        .map(|d| d.seconds.clamp(0, i64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

impl From<&Reason> for ReasonMessage {
    fn from(reason: &Reason) -> Self {
        use reason_message::Kind;

        let kind = match reason {
            Reason::RateLimit {
                max,
                remaining,
                reset_secs,
                window_secs,
            } => Kind::RateLimit(RateLimitReason {
                max: *max,
                remaining: *remaining,
                reset: seconds(*reset_secs),
                window: seconds(*window_secs),
            }),
            Reason::Filter { matched } => Kind::Filter(FilterReason {
                matched: matched.clone(),
            }),
            Reason::Bot {
                allowed,
                denied,
                verified,
                spoofed,
            } => Kind::Bot(BotReason {
                allowed: allowed.clone(),
                denied: denied.clone(),
                verified: *verified,
                spoofed: *spoofed,
            }),
            Reason::SensitiveInfo { allowed, denied } => Kind::SensitiveInfo(SensitiveInfoReason {
                allowed: allowed.clone(),
                denied: denied.clone(),
            }),
            Reason::Email { email_types } => Kind::Email(EmailReason {
                email_types: email_types.clone(),
            }),
            Reason::Error { message } => Kind::Error(ErrorReason {
                message: message.clone(),
            }),
        };
        ReasonMessage { kind: Some(kind) }
    }
}

/// Decode a wire reason. A message without a payload decodes to `None`.
pub fn reason_from_wire(message: ReasonMessage) -> Option<Reason> {
    use reason_message::Kind;

    let reason = match message.kind? {
        Kind::RateLimit(r) => Reason::RateLimit {
            max: r.max,
            remaining: r.remaining,
            reset_secs: from_seconds(r.reset),
            window_secs: from_seconds(r.window),
        },
        Kind::Filter(r) => Reason::Filter { matched: r.matched },
        Kind::Bot(r) => Reason::Bot {
            allowed: r.allowed,
            denied: r.denied,
            verified: r.verified,
            spoofed: r.spoofed,
        },
        Kind::SensitiveInfo(r) => Reason::SensitiveInfo {
            allowed: r.allowed,
            denied: r.denied,
        },
        Kind::Email(r) => Reason::Email {
            email_types: r.email_types,
        },
        Kind::Error(r) => Reason::Error { message: r.message },
    };
    Some(reason)
}

impl From<&RuleResult> for RuleResultMessage {
    fn from(result: &RuleResult) -> Self {
        RuleResultMessage {
            rule_id: result.rule_id.clone(),
            conclusion: ConclusionMessage::from(result.conclusion) as i32,
            state: RuleStateMessage::from(result.state) as i32,
            reason: result.reason.as_ref().map(ReasonMessage::from),
            ttl: result.ttl,
            fingerprint: result
                .fingerprint
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default(),
            dry_run: result.mode == Mode::DryRun,
        }
    }
}

impl TryFrom<RuleResultMessage> for RuleResult {
    type Error = ArbiterError;

    fn try_from(message: RuleResultMessage) -> Result<Self> {
        if message.rule_id.is_empty() {
            return Err(ArbiterError::Remote("rule result without rule id".to_string()));
        }
        Ok(RuleResult {
            rule_id: message.rule_id,
            mode: if message.dry_run { Mode::DryRun } else { Mode::Live },
            conclusion: conclusion_from_wire(message.conclusion)?,
            reason: message.reason.and_then(reason_from_wire),
            ttl: message.ttl,
            state: state_from_wire(message.state),
            fingerprint: if message.fingerprint.is_empty() {
                None
            } else {
                Some(Fingerprint::from(message.fingerprint))
            },
        })
    }
}
