//! TTL counter store.
//!
//! The store is the only owner of rate limit state. The engine talks to it
//! through the [`TtlStore`] trait so the in-memory default can be swapped for
//! a shared backend without touching the limiters.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use super::clock::Clock;
use crate::error::Result;

/// Namespaced key/value storage with per-entry expiry.
///
/// Empty namespaces and keys are ordinary strings and must be accepted.
pub trait TtlStore: Send + Sync {
    /// Fetch a value and its remaining time-to-live in seconds.
    ///
    /// Expired or missing entries yield `(None, 0)`.
    fn get(&self, namespace: &str, key: &str) -> Result<(Option<String>, u32)>;

    /// Store a value that expires `ttl_secs` from now. A TTL of zero writes
    /// a value that is already expired on the next read.
    fn set(&self, namespace: &str, key: &str, value: &str, ttl_secs: u32) -> Result<()>;

    /// Atomic read-modify-write of one entry.
    ///
    /// `apply` receives the current live value and returns the value to write
    /// with its TTL, or `None` to leave the entry as it is. No other `update`
    /// of the same `(namespace, key)` on this store may interleave between
    /// the read and the write, whichever caller issued it.
    fn update(
        &self,
        namespace: &str,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<Option<(String, u32)>>,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
struct Namespace {
    values: HashMap<String, String>,
    /// Expiry per key, in milliseconds since the epoch
    expires: HashMap<String, u64>,
}

/// In-memory [`TtlStore`] with lazy expiry.
///
/// Nothing is swept in the background. A read that finds an expired entry
/// removes it, and drops the namespace once its last key is gone.
pub struct MemoryStore {
    namespaces: DashMap<String, Namespace>,
    locks: KeyLocks,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            namespaces: DashMap::new(),
            locks: KeyLocks::new(),
            clock,
        }
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.namespaces.iter().map(|ns| ns.values.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }
}

impl TtlStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<(Option<String>, u32)> {
        let now = self.clock.now_millis();

        let Some(mut ns) = self.namespaces.get_mut(namespace) else {
            return Ok((None, 0));
        };
        let Some(&expires_at) = ns.expires.get(key) else {
            return Ok((None, 0));
        };

        if expires_at <= now {
            ns.values.remove(key);
            ns.expires.remove(key);
            let now_empty = ns.values.is_empty();
            // The shard lock must be released before removing the namespace.
            drop(ns);

            if now_empty {
                self.namespaces
                    .remove_if(namespace, |_, ns| ns.values.is_empty());
            }
            trace!(namespace = %namespace, key = %key, "Purged expired entry");
            return Ok((None, 0));
        }

        let remaining_secs = (expires_at - now).div_ceil(1000);
        let remaining_secs = u32::try_from(remaining_secs).unwrap_or(u32::MAX);
        Ok((ns.values.get(key).cloned(), remaining_secs))
    }

    fn set(&self, namespace: &str, key: &str, value: &str, ttl_secs: u32) -> Result<()> {
        let expires_at = self.clock.now_millis() + u64::from(ttl_secs) * 1000;

        let mut ns = self.namespaces.entry(namespace.to_string()).or_default();
        ns.values.insert(key.to_string(), value.to_string());
        ns.expires.insert(key.to_string(), expires_at);
        Ok(())
    }

    fn update(
        &self,
        namespace: &str,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<Option<(String, u32)>>,
    ) -> Result<()> {
        let _guard = self.locks.lock(namespace, key);

        let (current, _) = self.get(namespace, key)?;
        if let Some((value, ttl_secs)) = apply(current)? {
            self.set(namespace, key, &value, ttl_secs)?;
        }
        Ok(())
    }
}

const LOCK_STRIPES: usize = 64;

/// Striped locks serializing read-modify-write cycles per `(namespace, key)`.
///
/// Two updates of the same key always contend on the same stripe, which
/// makes [`MemoryStore::update`] linearizable per key.
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn lock(&self, namespace: &str, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        namespace.hash(&mut hasher);
        key.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[stripe].lock()
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::time::Duration;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_get_missing_returns_absent() {
        let (store, _) = store();
        assert_eq!(store.get("ns", "key").unwrap(), (None, 0));
    }

    #[test]
    fn test_set_then_get() {
        let (store, clock) = store();
        store.set("ns", "key", "value", 10).unwrap();

        assert_eq!(
            store.get("ns", "key").unwrap(),
            (Some("value".to_string()), 10)
        );

        clock.advance(Duration::from_millis(9_500));
        let (value, ttl) = store.get("ns", "key").unwrap();
        assert_eq!(value.as_deref(), Some("value"));
        assert_eq!(ttl, 1);
    }

    #[test]
    fn test_zero_ttl_is_immediately_expired() {
        let (store, _) = store();
        store.set("ns", "key", "value", 0).unwrap();
        assert_eq!(store.get("ns", "key").unwrap(), (None, 0));
    }

    #[test]
    fn test_expired_entry_is_purged() {
        let (store, clock) = store();
        store.set("ns", "key", "stale", 10).unwrap();
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("ns", "key").unwrap(), (None, 0));
        assert_eq!(store.len(), 0);
        assert_eq!(store.namespace_count(), 0);

        // A fresh write must not inherit the old expiry.
        store.set("ns", "key", "fresh", 5).unwrap();
        assert_eq!(
            store.get("ns", "key").unwrap(),
            (Some("fresh".to_string()), 5)
        );
    }

    #[test]
    fn test_purge_keeps_live_keys_in_namespace() {
        let (store, clock) = store();
        store.set("ns", "short", "a", 1).unwrap();
        store.set("ns", "long", "b", 60).unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.get("ns", "short").unwrap(), (None, 0));
        assert_eq!(store.namespace_count(), 1);
        assert_eq!(store.get("ns", "long").unwrap().0.as_deref(), Some("b"));
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let (store, _) = store();
        store.set("rule_a", "fp", "1", 60).unwrap();
        store.set("rule_b", "fp", "2", 60).unwrap();

        assert_eq!(store.get("rule_a", "fp").unwrap().0.as_deref(), Some("1"));
        assert_eq!(store.get("rule_b", "fp").unwrap().0.as_deref(), Some("2"));
    }

    #[test]
    fn test_empty_namespace_and_key_are_accepted() {
        let (store, _) = store();
        store.set("", "", "empty", 30).unwrap();
        assert_eq!(store.get("", "").unwrap(), (Some("empty".to_string()), 30));
        assert_eq!(store.get("", "other").unwrap(), (None, 0));
    }

    #[test]
    fn test_overwrite_replaces_value_and_expiry() {
        let (store, clock) = store();
        store.set("ns", "key", "first", 1).unwrap();
        store.set("ns", "key", "second", 100).unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(
            store.get("ns", "key").unwrap(),
            (Some("second".to_string()), 95)
        );
    }

    #[test]
    fn test_update_reads_current_value_and_writes_result() {
        let (store, _) = store();
        store.set("ns", "key", "1", 60).unwrap();

        store
            .update("ns", "key", &mut |current| {
                assert_eq!(current.as_deref(), Some("1"));
                Ok(Some(("2".to_string(), 30)))
            })
            .unwrap();
        assert_eq!(store.get("ns", "key").unwrap(), (Some("2".to_string()), 30));

        // Returning None leaves the entry alone.
        store.update("ns", "key", &mut |_| Ok(None)).unwrap();
        assert_eq!(store.get("ns", "key").unwrap(), (Some("2".to_string()), 30));
    }

    #[test]
    fn test_update_error_writes_nothing() {
        let (store, _) = store();
        let result = store.update("ns", "key", &mut |_| {
            Err(crate::error::ArbiterError::StoreUnavailable("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_increments() {
        let (store, _) = store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store
                            .update("ns", "counter", &mut |current| {
                                let count: u64 = current.map_or(0, |v| v.parse().unwrap());
                                std::thread::yield_now();
                                Ok(Some(((count + 1).to_string(), 60)))
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get("ns", "counter").unwrap().0.as_deref(), Some("400"));
    }

    #[test]
    fn test_key_locks_same_key_same_stripe() {
        let locks = KeyLocks::new();
        let guard = locks.lock("ns", "key");
        assert!(locks.stripes.iter().any(|m| m.is_locked()));
        drop(guard);
        assert!(locks.stripes.iter().all(|m| !m.is_locked()));
    }
}
