//! Rate limit state and the pure state transitions of each algorithm.
//!
//! Each state type is stored JSON-encoded as a single value in the TTL
//! store. The `step` functions take the previous state (if any), the current
//! time and the request, and return the verdict plus the state to persist.
//! They never touch the store themselves.

use serde::{Deserialize, Serialize};

/// Quota metadata reported with every verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Configured limit (max requests or bucket capacity)
    pub max: u32,
    /// Units left after this request
    pub remaining: u32,
    /// Seconds until the limit resets or enough tokens are available
    pub reset_secs: u32,
    /// Length of the window or refill interval in seconds
    pub window_secs: u32,
}

/// Result of applying one request to a piece of state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step<S> {
    pub allowed: bool,
    pub quota: Quota,
    /// State to write back, `None` when nothing changed
    pub state: Option<S>,
    /// TTL for the written state
    pub ttl_secs: u32,
    /// Whole seconds during which an identical request is certain to be
    /// denied again. Zero when allowed.
    pub denied_for_secs: u32,
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn ceil_secs(millis: u64) -> u32 {
    clamp_u32(millis.div_ceil(1000))
}

fn floor_secs(millis: u64) -> u32 {
    clamp_u32(millis / 1000)
}

/// Fixed window counter. `window_start` is in seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindowState {
    pub count: u64,
    pub window_start: u64,
}

impl FixedWindowState {
    /// Apply a request of `requested` units against `max` per `window_secs`.
    ///
    /// Windows are aligned to the epoch, so every request falling in the same
    /// window shares the counter regardless of arrival order.
    pub fn step(
        previous: Option<Self>,
        now_millis: u64,
        window_secs: u32,
        max: u32,
        requested: u32,
    ) -> Step<Self> {
        let window = u64::from(window_secs.max(1));
        let now_secs = now_millis / 1000;
        let aligned = (now_secs / window) * window;

        // A stored window ahead of the clock means the clock stepped back;
        // keep counting in that window rather than starting over.
        let (window_start, count) = match previous {
            Some(state) if state.window_start >= aligned => (state.window_start, state.count),
            _ => (aligned, 0),
        };
        let reset_secs = clamp_u32(window_start + window - now_secs);
        let window_end_ms = (window_start + window) * 1000;

        let max_units = u64::from(max);
        let requested = u64::from(requested);

        if count + requested > max_units {
            return Step {
                allowed: false,
                quota: Quota {
                    max,
                    remaining: clamp_u32(max_units.saturating_sub(count)),
                    reset_secs,
                    window_secs,
                },
                state: None,
                ttl_secs: window_secs,
                denied_for_secs: floor_secs(window_end_ms.saturating_sub(now_millis)),
            };
        }

        let count = count + requested;
        Step {
            allowed: true,
            quota: Quota {
                max,
                remaining: clamp_u32(max_units - count),
                reset_secs,
                window_secs,
            },
            state: Some(Self {
                count,
                window_start,
            }),
            ttl_secs: window_secs,
            denied_for_secs: 0,
        }
    }
}

/// Sliding window counter keeping the current and previous window counts.
/// `window_start` is in milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    pub current: u64,
    pub previous: u64,
    pub window_start: u64,
}

impl SlidingWindowState {
    /// Apply a request against `max` per sliding `interval_secs`.
    ///
    /// The previous window contributes in proportion to how much of it still
    /// overlaps the sliding interval:
    /// `effective = current + floor(previous * (interval - elapsed) / interval)`.
    pub fn step(
        previous: Option<Self>,
        now_millis: u64,
        interval_secs: u32,
        max: u32,
        requested: u32,
    ) -> Step<Self> {
        let interval_ms = u64::from(interval_secs.max(1)) * 1000;
        let aligned = (now_millis / interval_ms) * interval_ms;

        // A stored window ahead of the clock means the clock stepped back;
        // stay in that window with the previous count at full weight.
        let (window_start, current, prior) = match previous {
            Some(state) if state.window_start >= aligned => {
                (state.window_start, state.current, state.previous)
            }
            Some(state) if state.window_start + interval_ms == aligned => (aligned, 0, state.current),
            _ => (aligned, 0, 0),
        };
        let elapsed = now_millis.saturating_sub(window_start);

        let weighted_prior =
            (u128::from(prior) * u128::from(interval_ms.saturating_sub(elapsed)) / u128::from(interval_ms)) as u64;
        let effective = current + weighted_prior;
        let max_units = u64::from(max);
        let requested = u64::from(requested);
        let reset_secs = ceil_secs(window_start + interval_ms - now_millis);
        // The previous count is still needed for the whole next window.
        let ttl_secs = interval_secs.saturating_mul(2);

        let next = Self {
            current,
            previous: prior,
            window_start,
        };

        if effective + requested > max_units {
            let window_end = window_start + interval_ms;
            let denied_until = if current + requested > max_units {
                window_end
            } else {
                // Denied for as long as the decaying previous count alone
                // still exceeds what is left:
                // prior * (interval - elapsed) >= (budget + 1) * interval.
                let budget = u128::from(max_units - current - requested);
                let threshold = ((budget + 1) * u128::from(interval_ms)).div_ceil(u128::from(prior));
                window_end.saturating_sub(u64::try_from(threshold).unwrap_or(u64::MAX))
            };
            return Step {
                allowed: false,
                quota: Quota {
                    max,
                    remaining: clamp_u32(max_units.saturating_sub(effective)),
                    reset_secs,
                    window_secs: interval_secs,
                },
                state: (previous != Some(next)).then_some(next),
                ttl_secs,
                denied_for_secs: floor_secs(denied_until.saturating_sub(now_millis)),
            };
        }

        Step {
            allowed: true,
            quota: Quota {
                max,
                remaining: clamp_u32(max_units - effective - requested),
                reset_secs,
                window_secs: interval_secs,
            },
            state: Some(Self {
                current: current + requested,
                ..next
            }),
            ttl_secs,
            denied_for_secs: 0,
        }
    }
}

/// Token bucket. `last_refill_at` is in milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: u64,
    pub last_refill_at: u64,
}

impl TokenBucketState {
    /// Apply a request for `requested` tokens to a bucket holding at most
    /// `capacity` tokens and gaining `refill_rate` tokens per `interval_secs`.
    ///
    /// New buckets start full. Only whole intervals are credited and the
    /// refill clock advances by exactly those intervals, so partial progress
    /// carries over to the next request.
    pub fn step(
        previous: Option<Self>,
        now_millis: u64,
        refill_rate: u32,
        interval_secs: u32,
        capacity: u32,
        requested: u32,
    ) -> Step<Self> {
        let interval_ms = u64::from(interval_secs.max(1)) * 1000;
        let capacity_units = u64::from(capacity);
        let rate = u64::from(refill_rate);

        let mut bucket = previous.unwrap_or(Self {
            tokens: capacity_units,
            last_refill_at: now_millis,
        });

        let elapsed = now_millis.saturating_sub(bucket.last_refill_at);
        let intervals = elapsed / interval_ms;
        if intervals > 0 {
            bucket.tokens = bucket
                .tokens
                .saturating_add(intervals.saturating_mul(rate))
                .min(capacity_units);
            bucket.last_refill_at += intervals * interval_ms;
        }
        if bucket.tokens >= capacity_units {
            // A full bucket accrues nothing; restart the refill clock.
            bucket.tokens = capacity_units;
            bucket.last_refill_at = now_millis;
        }

        let intervals_to_full = if rate == 0 {
            1
        } else {
            capacity_units.div_ceil(rate).max(1)
        };
        let ttl_secs = clamp_u32(intervals_to_full * u64::from(interval_secs.max(1)));
        let requested = u64::from(requested);

        if bucket.tokens < requested {
            let wait_ms = if rate == 0 || requested > capacity_units {
                u64::MAX
            } else {
                let needed_intervals = (requested - bucket.tokens).div_ceil(rate);
                let since_refill = now_millis.saturating_sub(bucket.last_refill_at);
                (needed_intervals * interval_ms).saturating_sub(since_refill)
            };
            let reset_secs = ceil_secs(wait_ms);
            return Step {
                allowed: false,
                quota: Quota {
                    max: capacity,
                    remaining: clamp_u32(bucket.tokens),
                    reset_secs,
                    window_secs: interval_secs,
                },
                state: (previous != Some(bucket)).then_some(bucket),
                ttl_secs,
                denied_for_secs: floor_secs(wait_ms),
            };
        }

        bucket.tokens -= requested;
        let reset_secs = if bucket.tokens >= capacity_units || rate == 0 {
            0
        } else {
            let since_refill = now_millis.saturating_sub(bucket.last_refill_at);
            ceil_secs(interval_ms.saturating_sub(since_refill))
        };

        Step {
            allowed: true,
            quota: Quota {
                max: capacity,
                remaining: clamp_u32(bucket.tokens),
                reset_secs,
                window_secs: interval_secs,
            },
            state: Some(bucket),
            ttl_secs,
            denied_for_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_040_000; // aligned to a 60 second boundary

    #[test]
    fn test_fixed_window_allow_then_deny_then_next_window() {
        let first = FixedWindowState::step(None, T0, 60, 1, 1);
        assert!(first.allowed);
        assert_eq!(first.quota.remaining, 0);
        assert_eq!(first.quota.reset_secs, 60);

        let second = FixedWindowState::step(first.state, T0 + 30_000, 60, 1, 1);
        assert!(!second.allowed);
        assert_eq!(second.quota.remaining, 0);
        assert_eq!(second.quota.reset_secs, 30);
        assert!(second.state.is_none());

        let third = FixedWindowState::step(first.state, T0 + 60_000, 60, 1, 1);
        assert!(third.allowed);
    }

    #[test]
    fn test_fixed_window_is_epoch_aligned() {
        // 59 seconds into the window, then 1 second later is a new window.
        let late = FixedWindowState::step(None, T0 + 59_000, 60, 1, 1);
        assert!(late.allowed);
        assert_eq!(late.quota.reset_secs, 1);

        let next = FixedWindowState::step(late.state, T0 + 60_000, 60, 1, 1);
        assert!(next.allowed);
    }

    #[test]
    fn test_fixed_window_multi_unit_request() {
        let step = FixedWindowState::step(None, T0, 60, 10, 8);
        assert!(step.allowed);
        assert_eq!(step.quota.remaining, 2);

        let over = FixedWindowState::step(step.state, T0, 60, 10, 3);
        assert!(!over.allowed);
        assert_eq!(over.quota.remaining, 2);

        let exact = FixedWindowState::step(step.state, T0, 60, 10, 2);
        assert!(exact.allowed);
        assert_eq!(exact.quota.remaining, 0);
    }

    #[test]
    fn test_sliding_window_interpolates_previous_window() {
        let mut state = None;
        for _ in 0..10 {
            let step = SlidingWindowState::step(state, T0, 60, 10, 1);
            assert!(step.allowed);
            state = step.state;
        }

        // Halfway through the next window half of the previous count remains.
        let halfway = T0 + 90_000;
        let mut allowed = 0;
        for _ in 0..10 {
            let step = SlidingWindowState::step(state, halfway, 60, 10, 1);
            if step.allowed {
                allowed += 1;
            }
            if let Some(next) = step.state {
                state = Some(next);
            }
        }
        assert_eq!(allowed, 5);
    }

    #[test]
    fn test_sliding_window_at_boundary_counts_full_previous() {
        let mut state = None;
        for _ in 0..3 {
            state = SlidingWindowState::step(state, T0 + 1_000, 60, 3, 1).state;
        }
        let at_boundary = SlidingWindowState::step(state, T0 + 60_000, 60, 3, 1);
        assert!(!at_boundary.allowed);
        assert_eq!(at_boundary.quota.remaining, 0);
    }

    #[test]
    fn test_sliding_window_forgets_after_two_windows() {
        let mut state = None;
        for _ in 0..3 {
            state = SlidingWindowState::step(state, T0, 60, 3, 1).state;
        }
        let later = SlidingWindowState::step(state, T0 + 120_000, 60, 3, 1);
        assert!(later.allowed);
        assert_eq!(later.quota.remaining, 2);
    }

    #[test]
    fn test_token_bucket_starts_full_and_drains() {
        let mut state = None;
        for expected in (0..10).rev() {
            let step = TokenBucketState::step(state, T0, 5, 10, 10, 1);
            assert!(step.allowed);
            assert_eq!(step.quota.remaining, expected);
            state = step.state;
        }

        let denied = TokenBucketState::step(state, T0, 5, 10, 10, 1);
        assert!(!denied.allowed);
        assert_eq!(denied.quota.remaining, 0);
        assert_eq!(denied.quota.reset_secs, 10);
    }

    #[test]
    fn test_token_bucket_refill_survives_small_ticks() {
        let drained = TokenBucketState::step(None, T0, 5, 10, 10, 10);
        assert!(drained.allowed);
        let mut state = drained.state;

        // Check every 3 seconds; partial intervals must not be discarded.
        let mut now = T0;
        for _ in 0..3 {
            now += 3_000;
            let tick = TokenBucketState::step(state, now, 5, 10, 10, 0);
            assert!(tick.allowed);
            assert_eq!(tick.quota.remaining, 0);
            state = tick.state;
        }

        now += 1_000;
        let refilled = TokenBucketState::step(state, now, 5, 10, 10, 0);
        assert!(refilled.quota.remaining >= 5);
        assert_eq!(refilled.quota.remaining, 5);
    }

    #[test]
    fn test_token_bucket_refill_is_capped() {
        let drained = TokenBucketState::step(None, T0, 5, 10, 10, 10);
        let later = TokenBucketState::step(drained.state, T0 + 3_600_000, 5, 10, 10, 1);
        assert!(later.allowed);
        assert_eq!(later.quota.remaining, 9);
    }

    #[test]
    fn test_token_bucket_reset_reports_wait_for_tokens() {
        let drained = TokenBucketState::step(None, T0, 5, 10, 10, 10);
        let denied = TokenBucketState::step(drained.state, T0 + 4_000, 5, 10, 10, 7);
        assert!(!denied.allowed);
        // Seven tokens need two intervals; four seconds of the first have passed.
        assert_eq!(denied.quota.reset_secs, 16);
    }

    #[test]
    fn test_fixed_window_denial_lasts_until_window_end() {
        let full = FixedWindowState::step(None, T0, 60, 1, 1);
        let denied = FixedWindowState::step(full.state, T0 + 30_500, 60, 1, 1);
        assert!(!denied.allowed);
        assert_eq!(denied.denied_for_secs, 29);
        assert_eq!(full.denied_for_secs, 0);
    }

    #[test]
    fn test_fixed_window_clock_stepping_back_keeps_count() {
        let full = FixedWindowState::step(None, T0 + 60_000, 60, 1, 1);
        assert!(full.allowed);

        let earlier = FixedWindowState::step(full.state, T0 + 59_000, 60, 1, 1);
        assert!(!earlier.allowed);
        assert_eq!(earlier.quota.reset_secs, 61);
    }

    #[test]
    fn test_sliding_window_denial_follows_decay() {
        let mut state = None;
        for _ in 0..10 {
            state = SlidingWindowState::step(state, T0, 60, 10, 1).state;
        }

        // At the boundary the previous count weighs 10; five more units fit
        // once it has decayed to 5, which takes more than 24 seconds.
        let denied = SlidingWindowState::step(state, T0 + 60_000, 60, 10, 5);
        assert!(!denied.allowed);
        assert_eq!(denied.denied_for_secs, 24);

        let still_denied = SlidingWindowState::step(state, T0 + 84_000, 60, 10, 5);
        assert!(!still_denied.allowed);
        let admitted = SlidingWindowState::step(state, T0 + 84_001, 60, 10, 5);
        assert!(admitted.allowed);

        // A single unit is never certain to stay denied here.
        let one = SlidingWindowState::step(state, T0 + 60_000, 60, 10, 1);
        assert!(!one.allowed);
        assert_eq!(one.denied_for_secs, 0);
    }

    #[test]
    fn test_sliding_window_full_current_denies_until_window_end() {
        let mut state = None;
        for _ in 0..3 {
            state = SlidingWindowState::step(state, T0, 60, 3, 1).state;
        }
        let denied = SlidingWindowState::step(state, T0 + 10_000, 60, 3, 1);
        assert!(!denied.allowed);
        assert_eq!(denied.denied_for_secs, 50);
    }

    #[test]
    fn test_sliding_window_clock_stepping_back_keeps_counts() {
        let mut state = None;
        for _ in 0..3 {
            state = SlidingWindowState::step(state, T0 + 60_000, 60, 3, 1).state;
        }
        let earlier = SlidingWindowState::step(state, T0 + 59_000, 60, 3, 1);
        assert!(!earlier.allowed);
        assert_eq!(earlier.quota.remaining, 0);
    }

    #[test]
    fn test_token_bucket_denial_lasts_until_tokens_arrive() {
        let drained = TokenBucketState::step(None, T0, 5, 10, 10, 10);
        let denied = TokenBucketState::step(drained.state, T0 + 4_000, 5, 10, 10, 1);
        assert!(!denied.allowed);
        assert_eq!(denied.denied_for_secs, 6);

        let oversized = TokenBucketState::step(None, T0, 5, 10, 10, 11);
        assert!(!oversized.allowed);
        assert_eq!(oversized.quota.remaining, 10);
        assert_eq!(oversized.denied_for_secs, u32::MAX);
    }

    #[test]
    fn test_token_bucket_ttl_covers_full_refill() {
        let step = TokenBucketState::step(None, T0, 5, 10, 10, 1);
        assert_eq!(step.ttl_secs, 20);
    }
}
