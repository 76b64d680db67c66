//! Core rate limiter implementation.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::clock::Clock;
use super::counter::{FixedWindowState, Quota, SlidingWindowState, Step, TokenBucketState};
use super::fingerprint::Fingerprint;
use super::store::TtlStore;
use crate::error::{ArbiterError, Result};

/// A rate limiting algorithm with its resolved parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Algorithm {
    /// `max` requests per epoch-aligned window
    FixedWindow { window_secs: u32, max: u32 },
    /// `max` requests per interval, smoothed over the previous interval
    SlidingWindow { interval_secs: u32, max: u32 },
    /// `refill_rate` tokens per interval into a bucket of `capacity`
    TokenBucket {
        refill_rate: u32,
        interval_secs: u32,
        capacity: u32,
    },
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow { .. } => "fixed_window",
            Algorithm::SlidingWindow { .. } => "sliding_window",
            Algorithm::TokenBucket { .. } => "token_bucket",
        }
    }

    /// Window length, or refill interval for token buckets, in seconds.
    pub fn window_secs(&self) -> u32 {
        match *self {
            Algorithm::FixedWindow { window_secs, .. } => window_secs,
            Algorithm::SlidingWindow { interval_secs, .. }
            | Algorithm::TokenBucket { interval_secs, .. } => interval_secs,
        }
    }
}

/// Verdict of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub quota: Quota,
    /// Seconds an identical request is certain to stay denied
    pub denied_for_secs: u32,
}

/// Applies rate limit algorithms to counters held in a [`TtlStore`].
///
/// Every check is one [`TtlStore::update`] of a `(namespace, key)` entry, so
/// concurrent requests sharing a fingerprint can never both spend the last
/// unit of quota, even across limiters built on the same store.
pub struct RateLimiter {
    store: Arc<dyn TtlStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn TtlStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Check and consume `requested` units for `key` within `namespace`.
    pub fn check(
        &self,
        namespace: &str,
        algorithm: &Algorithm,
        key: &Fingerprint,
        requested: u32,
    ) -> Result<RateLimitOutcome> {
        trace!(
            namespace = %namespace,
            key = %key,
            algorithm = algorithm.name(),
            requested = requested,
            "Checking rate limit"
        );

        let outcome = match *algorithm {
            Algorithm::FixedWindow { window_secs, max } => {
                self.update(namespace, key, |state, now| {
                    FixedWindowState::step(state, now, window_secs, max, requested)
                })?
            }
            Algorithm::SlidingWindow { interval_secs, max } => {
                self.update(namespace, key, |state, now| {
                    SlidingWindowState::step(state, now, interval_secs, max, requested)
                })?
            }
            Algorithm::TokenBucket {
                refill_rate,
                interval_secs,
                capacity,
            } => self.update(namespace, key, |state, now| {
                TokenBucketState::step(state, now, refill_rate, interval_secs, capacity, requested)
            })?,
        };

        if !outcome.allowed {
            debug!(
                namespace = %namespace,
                key = %key,
                max = outcome.quota.max,
                reset_secs = outcome.quota.reset_secs,
                "Rate limit exceeded"
            );
        }

        Ok(outcome)
    }

    fn update<S, F>(&self, namespace: &str, key: &Fingerprint, step: F) -> Result<RateLimitOutcome>
    where
        S: Serialize + DeserializeOwned,
        F: Fn(Option<S>, u64) -> Step<S>,
    {
        let mut outcome = None;

        self.store.update(namespace, key.as_str(), &mut |raw: Option<String>| {
            let previous = raw
                .map(|value| {
                    serde_json::from_str::<S>(&value).map_err(|e| {
                        ArbiterError::StoreUnavailable(format!(
                            "corrupt counter state in {}: {}",
                            namespace, e
                        ))
                    })
                })
                .transpose()?;

            let next = step(previous, self.clock.now_millis());
            outcome = Some(RateLimitOutcome {
                allowed: next.allowed,
                quota: next.quota,
                denied_for_secs: next.denied_for_secs,
            });

            let ttl_secs = next.ttl_secs;
            next.state
                .map(|state| {
                    serde_json::to_string(&state)
                        .map(|encoded| (encoded, ttl_secs))
                        .map_err(|e| ArbiterError::StoreUnavailable(e.to_string()))
                })
                .transpose()
        })?;

        outcome.ok_or_else(|| {
            ArbiterError::StoreUnavailable(format!("store skipped update in {}", namespace))
        })
    }
}
