//! Rule configuration and compilation.
//!
//! Rules are declared in YAML as a flat list. Each entry names its `type`,
//! an optional `id` and `mode`, and the parameters of that type. Durations
//! may be written as integers or interval strings. Any invalid rule fails
//! engine construction.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::engine::Detector;
use super::Mode;
use crate::error::{ArbiterError, Result};
use crate::ratelimit::{Algorithm, DurationSpec, IpList, StableHasher};

/// Characteristic used when a rule does not name any.
pub const DEFAULT_CHARACTERISTIC: &str = "ip.src";

fn default_characteristics() -> Vec<String> {
    vec![DEFAULT_CHARACTERISTIC.to_string()]
}

/// A rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Stable identifier; generated from the type and position when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(flatten)]
    pub kind: RuleKindConfig,
}

/// Type-specific rule parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKindConfig {
    FixedWindow {
        #[serde(default = "default_characteristics")]
        characteristics: Vec<String>,
        window: DurationSpec,
        max: u32,
    },
    SlidingWindow {
        #[serde(default = "default_characteristics")]
        characteristics: Vec<String>,
        interval: DurationSpec,
        max: u32,
    },
    TokenBucket {
        #[serde(default = "default_characteristics")]
        characteristics: Vec<String>,
        refill_rate: u32,
        interval: DurationSpec,
        capacity: u32,
    },
    Filter {
        action: FilterAction,
        ips: IpList,
    },
}

impl RuleKindConfig {
    fn type_name(&self) -> &'static str {
        match self {
            RuleKindConfig::FixedWindow { .. } => "fixed_window",
            RuleKindConfig::SlidingWindow { .. } => "sliding_window",
            RuleKindConfig::TokenBucket { .. } => "token_bucket",
            RuleKindConfig::Filter { .. } => "filter",
        }
    }
}

/// What an IP filter does with addresses on its list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterAction {
    /// Only listed addresses are allowed
    Allow,
    /// Listed addresses are denied
    Deny,
}

/// A compiled rule, shared read-only by every request.
#[derive(Clone)]
pub struct Rule {
    pub id: String,
    pub mode: Mode,
    pub kind: RuleKind,
}

#[derive(Clone)]
pub enum RuleKind {
    RateLimit {
        algorithm: Algorithm,
        characteristics: Vec<String>,
    },
    Filter {
        action: FilterAction,
        ips: IpList,
    },
    Detector(Arc<dyn Detector>),
}

impl fmt::Debug for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::RateLimit {
                algorithm,
                characteristics,
            } => f
                .debug_struct("RateLimit")
                .field("algorithm", algorithm)
                .field("characteristics", characteristics)
                .finish(),
            RuleKind::Filter { action, ips } => f
                .debug_struct("Filter")
                .field("action", action)
                .field("ips", ips)
                .finish(),
            RuleKind::Detector(_) => f.write_str("Detector"),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Rule {
    /// Store namespace for this rule's counters.
    pub fn counter_namespace(&self) -> String {
        format!("ratelimit:{}", self.id)
    }

    /// Store namespace for this rule's cached denials.
    pub fn cache_namespace(&self) -> String {
        format!("cache:{}", self.id)
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self.kind, RuleKind::RateLimit { .. })
    }

    fn hash_into(&self, hasher: &mut StableHasher) {
        hasher.string("id", &self.id);
        hasher.bool("dry_run", self.mode == Mode::DryRun);
        match &self.kind {
            RuleKind::RateLimit {
                algorithm,
                characteristics,
            } => {
                hasher.string("type", algorithm.name());
                match *algorithm {
                    Algorithm::FixedWindow { window_secs, max } => {
                        hasher.uint("window", window_secs.into());
                        hasher.uint("max", max.into());
                    }
                    Algorithm::SlidingWindow { interval_secs, max } => {
                        hasher.uint("interval", interval_secs.into());
                        hasher.uint("max", max.into());
                    }
                    Algorithm::TokenBucket {
                        refill_rate,
                        interval_secs,
                        capacity,
                    } => {
                        hasher.uint("refill_rate", refill_rate.into());
                        hasher.uint("interval", interval_secs.into());
                        hasher.uint("capacity", capacity.into());
                    }
                }
                let mut sorted = characteristics.clone();
                sorted.sort();
                hasher.string_slice("characteristics", &sorted);
            }
            RuleKind::Filter { action, ips } => {
                hasher.string("type", "filter");
                hasher.bool("allow", *action == FilterAction::Allow);
                let members: Vec<String> = ips.iter().map(|t| t.to_string()).collect();
                hasher.string_slice("ips", &members);
            }
            RuleKind::Detector(_) => {
                hasher.string("type", "detector");
            }
        }
    }
}

/// Stable digest of a rule set, used to tell the remote service which
/// configuration produced a request.
pub fn rules_digest(rules: &[Rule]) -> String {
    let mut hasher = StableHasher::new();
    hasher.uint("count", rules.len() as u64);
    for rule in rules {
        rule.hash_into(&mut hasher);
    }
    hasher.finish()
}

impl RuleConfig {
    /// Validate this rule and resolve its durations. `position` is used to
    /// generate an id when none is configured.
    pub fn compile(&self, position: usize) -> Result<Rule> {
        let id = match &self.id {
            Some(id) if id.trim().is_empty() => {
                return Err(ArbiterError::Config(format!(
                    "rule at position {} has an empty id",
                    position
                )))
            }
            Some(id) => id.clone(),
            None => format!("{}-{}", self.kind.type_name(), position),
        };

        let invalid = |e: ArbiterError| ArbiterError::Config(format!("rule {}: {}", id, e));

        let kind = match &self.kind {
            RuleKindConfig::FixedWindow {
                characteristics,
                window,
                max,
            } => RuleKind::RateLimit {
                algorithm: Algorithm::FixedWindow {
                    window_secs: positive(window, "window").map_err(invalid)?,
                    max: *max,
                },
                characteristics: check_characteristics(characteristics).map_err(invalid)?,
            },
            RuleKindConfig::SlidingWindow {
                characteristics,
                interval,
                max,
            } => RuleKind::RateLimit {
                algorithm: Algorithm::SlidingWindow {
                    interval_secs: positive(interval, "interval").map_err(invalid)?,
                    max: *max,
                },
                characteristics: check_characteristics(characteristics).map_err(invalid)?,
            },
            RuleKindConfig::TokenBucket {
                characteristics,
                refill_rate,
                interval,
                capacity,
            } => {
                if *refill_rate == 0 {
                    return Err(invalid(ArbiterError::InvalidInput(
                        "refill_rate must be positive".to_string(),
                    )));
                }
                RuleKind::RateLimit {
                    algorithm: Algorithm::TokenBucket {
                        refill_rate: *refill_rate,
                        interval_secs: positive(interval, "interval").map_err(invalid)?,
                        capacity: *capacity,
                    },
                    characteristics: check_characteristics(characteristics).map_err(invalid)?,
                }
            }
            RuleKindConfig::Filter { action, ips } => RuleKind::Filter {
                action: *action,
                ips: ips.clone(),
            },
        };

        Ok(Rule {
            id,
            mode: self.mode,
            kind,
        })
    }
}

/// Compile a list of rule configurations, rejecting duplicate ids.
pub fn compile_rules(configs: &[RuleConfig]) -> Result<Vec<Rule>> {
    let rules = configs
        .iter()
        .enumerate()
        .map(|(position, config)| config.compile(position))
        .collect::<Result<Vec<_>>>()?;
    check_unique_ids(&rules)?;
    Ok(rules)
}

pub(crate) fn check_unique_ids(rules: &[Rule]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert(rule.id.as_str()) {
            return Err(ArbiterError::Config(format!(
                "duplicate rule id {:?}",
                rule.id
            )));
        }
    }
    Ok(())
}

fn positive(spec: &DurationSpec, field: &str) -> Result<u32> {
    let seconds = spec.to_seconds()?;
    if seconds == 0 {
        return Err(ArbiterError::InvalidDuration(format!(
            "{} must be at least one second",
            field
        )));
    }
    Ok(seconds)
}

fn check_characteristics(characteristics: &[String]) -> Result<Vec<String>> {
    if characteristics.is_empty() {
        return Err(ArbiterError::InvalidInput(
            "at least one characteristic is required".to_string(),
        ));
    }
    if let Some(blank) = characteristics.iter().find(|c| c.trim().is_empty()) {
        return Err(ArbiterError::InvalidInput(format!(
            "invalid characteristic name {:?}",
            blank
        )));
    }
    Ok(characteristics.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Vec<RuleConfig> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parse_rate_limit_rules() {
        let configs = parse(
            r#"
- id: api
  type: fixed_window
  window: 1m
  max: 60
- type: sliding_window
  mode: DRY_RUN
  characteristics: [userId]
  interval: 30
  max: 10
- type: token_bucket
  refill_rate: 5
  interval: "10s"
  capacity: 10
"#,
        );
        let rules = compile_rules(&configs).unwrap();

        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].id, "api");
        assert_eq!(rules[0].mode, Mode::Live);
        match &rules[0].kind {
            RuleKind::RateLimit {
                algorithm,
                characteristics,
            } => {
                assert_eq!(
                    *algorithm,
                    Algorithm::FixedWindow {
                        window_secs: 60,
                        max: 60
                    }
                );
                assert_eq!(characteristics, &vec!["ip.src".to_string()]);
            }
            other => panic!("unexpected kind {:?}", other),
        }

        assert_eq!(rules[1].id, "sliding_window-1");
        assert_eq!(rules[1].mode, Mode::DryRun);
        assert_eq!(rules[2].id, "token_bucket-2");
        assert!(rules.iter().all(Rule::is_rate_limit));
    }

    #[test]
    fn test_parse_filter_rule() {
        let configs = parse(
            r#"
- id: blocklist
  type: filter
  action: DENY
  ips: ["131.0.72.0/22", "10.0.0.1"]
"#,
        );
        let rules = compile_rules(&configs).unwrap();
        match &rules[0].kind {
            RuleKind::Filter { action, ips } => {
                assert_eq!(*action, FilterAction::Deny);
                assert_eq!(ips.len(), 2);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_invalid_rules_are_config_errors() {
        let cases = [
            "- {type: fixed_window, window: 1y, max: 1}",
            "- {type: fixed_window, window: 0, max: 1}",
            "- {type: sliding_window, interval: -5, max: 1}",
            "- {type: sliding_window, interval: 1.5, max: 1}",
            "- {type: token_bucket, refill_rate: 0, interval: 1s, capacity: 1}",
            "- {type: fixed_window, window: 1m, max: 1, characteristics: []}",
            "- {id: '', type: fixed_window, window: 1m, max: 1}",
        ];
        for yaml in cases {
            let configs = parse(yaml);
            let result = compile_rules(&configs);
            assert!(
                matches!(result, Err(ArbiterError::Config(_))),
                "{} should fail",
                yaml
            );
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let configs = parse(
            r#"
- {id: same, type: fixed_window, window: 1m, max: 1}
- {id: same, type: sliding_window, interval: 1m, max: 1}
"#,
        );
        assert!(matches!(
            compile_rules(&configs),
            Err(ArbiterError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_type_fails_to_parse() {
        let result: std::result::Result<Vec<RuleConfig>, _> =
            serde_yaml::from_str("- {type: leaky_bucket, max: 1}");
        assert!(result.is_err());
    }

    #[test]
    fn test_rules_digest_tracks_configuration() {
        let a = compile_rules(&parse("- {id: r, type: fixed_window, window: 1m, max: 5}")).unwrap();
        let b = compile_rules(&parse("- {id: r, type: fixed_window, window: 60, max: 5}")).unwrap();
        let c = compile_rules(&parse("- {id: r, type: fixed_window, window: 1m, max: 6}")).unwrap();

        assert_eq!(rules_digest(&a), rules_digest(&b));
        assert_ne!(rules_digest(&a), rules_digest(&c));
    }

    #[test]
    fn test_namespaces() {
        let rules = compile_rules(&parse("- {id: r1, type: fixed_window, window: 1m, max: 5}")).unwrap();
        assert_eq!(rules[0].counter_namespace(), "ratelimit:r1");
        assert_eq!(rules[0].cache_namespace(), "cache:r1");
    }
}
