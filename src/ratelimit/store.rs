//! In-process bucket store.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::bucket::{BucketState, Consumption};
use super::key::BucketKey;
use super::rules::EndpointPolicy;

/// Result of a local check: the consumption outcome plus the tokens left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalOutcome {
    pub consumption: Consumption,
    pub available: u64,
}

#[derive(Debug)]
struct LocalBucket {
    state: BucketState,
    last_access_ms: u64,
}

/// Concurrent map from bucket key to bucket state.
///
/// The map is sharded, and every bucket sits behind its own mutex, so
/// requests for different keys never wait on each other. The shard lock is
/// released before a bucket mutex is taken.
#[derive(Debug, Default)]
pub struct LocalBucketStore {
    buckets: DashMap<BucketKey, Arc<Mutex<LocalBucket>>>,
}

impl LocalBucketStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refill the bucket for `key` and try to take one token, as one
    /// indivisible step. The bucket is created full on first use.
    pub fn check_and_consume(
        &self,
        key: &BucketKey,
        policy: &EndpointPolicy,
        now_ms: u64,
    ) -> LocalOutcome {
        let bucket = self.bucket_for(key, policy, now_ms);
        let mut bucket = bucket.lock();

        bucket.last_access_ms = bucket.last_access_ms.max(now_ms);
        let consumption = bucket.state.try_consume(now_ms);

        trace!(
            key = %key,
            available = bucket.state.available_tokens,
            consumed = consumption.is_consumed(),
            "Local bucket checked"
        );

        LocalOutcome {
            consumption,
            available: bucket.state.whole_tokens(),
        }
    }

    fn bucket_for(
        &self,
        key: &BucketKey,
        policy: &EndpointPolicy,
        now_ms: u64,
    ) -> Arc<Mutex<LocalBucket>> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(
                key = %key,
                capacity = policy.capacity,
                refill_tokens = policy.refill_tokens,
                refill_period_secs = policy.refill_period_secs,
                "Creating new token bucket"
            );
            Arc::new(Mutex::new(LocalBucket {
                state: BucketState::new(policy, now_ms),
                last_access_ms: now_ms,
            }))
        });
        Arc::clone(bucket.value())
    }

    /// Drop buckets that have been idle for at least `idle_ttl` and are
    /// already back at capacity. Buckets currently held by a request are kept.
    ///
    /// Returns the number of buckets removed.
    pub fn evict_idle(&self, idle_ttl: Duration, now_ms: u64) -> usize {
        let ttl_ms = u64::try_from(idle_ttl.as_millis()).unwrap_or(u64::MAX);
        let before = self.buckets.len();

        self.buckets.retain(|_, bucket| {
            // Only the map holds this Arc, and the shard is write-locked, so no
            // request can pick it up while we decide.
            if Arc::strong_count(bucket) > 1 {
                return true;
            }
            let bucket = bucket.lock();
            let idle = now_ms.saturating_sub(bucket.last_access_ms) >= ttl_ms;
            !(idle && bucket.state.is_full_at(now_ms))
        });

        before.saturating_sub(self.buckets.len())
    }

    /// Number of buckets held.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(capacity: u64) -> EndpointPolicy {
        EndpointPolicy::new(capacity, capacity, Duration::from_secs(60))
    }

    fn key(client: &str) -> BucketKey {
        BucketKey::new("test:", "listUsers", client)
    }

    impl LocalBucketStore {
        /// Whole tokens in the bucket for `key` at `now_ms`, if it exists.
        fn available_tokens(&self, key: &BucketKey, now_ms: u64) -> Option<u64> {
            let bucket = self.buckets.get(key).map(|b| Arc::clone(b.value()))?;
            let mut state = bucket.lock().state;
            state.refill(now_ms);
            Some(state.whole_tokens())
        }
    }

    #[test]
    fn test_creates_bucket_lazily() {
        let store = LocalBucketStore::new();
        assert!(store.is_empty());

        let outcome = store.check_and_consume(&key("a"), &policy(5), 0);
        assert_eq!(outcome.consumption, Consumption::Consumed { remaining: 4 });
        assert_eq!(outcome.available, 4);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = LocalBucketStore::new();
        let policy = policy(1);

        assert!(store.check_and_consume(&key("a"), &policy, 0).consumption.is_consumed());
        assert!(!store.check_and_consume(&key("a"), &policy, 0).consumption.is_consumed());
        assert!(store.check_and_consume(&key("b"), &policy, 0).consumption.is_consumed());
        assert_eq!(store.available_tokens(&key("a"), 0), Some(0));
        assert_eq!(store.available_tokens(&key("missing"), 0), None);
    }

    #[test]
    fn test_evicts_only_idle_full_buckets() {
        let store = LocalBucketStore::new();
        let policy = policy(2);

        // Drained at t=0, refilled by t=60s
        store.check_and_consume(&key("drained"), &policy, 0);
        store.check_and_consume(&key("drained"), &policy, 0);
        // Touched recently
        store.check_and_consume(&key("busy"), &policy, 590_000);

        let removed = store.evict_idle(Duration::from_secs(300), 600_000);
        assert_eq!(removed, 1);
        assert_eq!(store.available_tokens(&key("drained"), 600_000), None);
        assert!(store.available_tokens(&key("busy"), 600_000).is_some());
    }

    #[test]
    fn test_does_not_evict_bucket_still_refilling() {
        let store = LocalBucketStore::new();
        // One token per hour: still empty long after going idle
        let slow = EndpointPolicy::new(1, 1, Duration::from_secs(3600));
        store.check_and_consume(&key("slow"), &slow, 0);

        assert_eq!(store.evict_idle(Duration::from_secs(60), 600_000), 0);
        assert_eq!(store.len(), 1);

        assert_eq!(store.evict_idle(Duration::from_secs(60), 3_600_000), 1);
        assert!(store.is_empty());
    }
}
