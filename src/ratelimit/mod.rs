//! Rate limiting primitives: durations, fingerprints, address matching, the
//! TTL counter store and the limiting algorithms.

mod clock;
mod counter;
pub mod duration;
mod fingerprint;
pub mod ip;
mod limiter;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{FixedWindowState, Quota, SlidingWindowState, Step, TokenBucketState};
pub use duration::DurationSpec;
pub use fingerprint::{hash, FieldValue, Fingerprint, Fingerprinter, StableHasher};
pub use ip::{IpList, IpTarget};
pub use limiter::{Algorithm, RateLimitOutcome, RateLimiter};
pub use store::{KeyLocks, MemoryStore, TtlStore};
