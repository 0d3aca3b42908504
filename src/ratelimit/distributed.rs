//! Token buckets kept in a shared store.
//!
//! Several limiter replicas may point at the same store, so every update is an
//! optimistic read-modify-write: read the bucket, do the token math locally,
//! then write it back only if nobody else wrote in between. Lost races are
//! retried a bounded number of times with jittered backoff.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::StoreUnavailable;
use crate::store::SharedStore;

use super::bucket::{BucketState, Consumption};
use super::clock::Clock;
use super::key::BucketKey;
use super::rules::EndpointPolicy;

/// Retry and deadline settings for the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedSettings {
    /// Read-modify-write attempts before giving up
    pub max_attempts: u32,
    /// Deadline for each individual store call
    pub operation_timeout: Duration,
    /// Backoff before the second attempt
    pub backoff_base: Duration,
    /// Upper bound for any single backoff
    pub backoff_max: Duration,
}

impl Default for DistributedSettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            operation_timeout: Duration::from_millis(250),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(50),
        }
    }
}

/// Adapter that runs the token bucket algorithm against a [`SharedStore`].
pub struct DistributedBucketProxy {
    store: Arc<dyn SharedStore>,
    settings: DistributedSettings,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DistributedBucketProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedBucketProxy")
            .field("store", &self.store.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl DistributedBucketProxy {
    /// Create a new proxy.
    pub fn new(
        store: Arc<dyn SharedStore>,
        settings: DistributedSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            settings,
            clock,
        }
    }

    /// Refill and try to take one token from the shared bucket for `key`.
    ///
    /// Any timeout, store error or exhausted retry budget is reported as
    /// [`StoreUnavailable`].
    pub async fn check_and_consume(
        &self,
        key: &BucketKey,
        policy: &EndpointPolicy,
    ) -> Result<Consumption, StoreUnavailable> {
        let ttl = policy.time_to_full().saturating_add(policy.refill_period());
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let current = self.with_deadline("get", self.store.get(key.as_str())).await?;
            let now_ms = self.clock.now_millis();
            let mut state = self.decode(key, current.as_deref(), policy, now_ms);

            let consumption = state.try_consume(now_ms);
            if !consumption.is_consumed() {
                // Nothing changed: an empty bucket gets no refill before the
                // period boundary, so there is nothing to write back.
                return Ok(consumption);
            }

            let encoded = serde_json::to_string(&state)
                .map_err(|e| StoreUnavailable::Backend(format!("encode bucket: {}", e)))?;

            let swapped = self
                .with_deadline(
                    "compare_and_swap",
                    self.store
                        .compare_and_swap(key.as_str(), current.as_deref(), &encoded, ttl),
                )
                .await?;

            if swapped {
                trace!(key = %key, attempt, "Shared bucket updated");
                return Ok(consumption);
            }

            debug!(key = %key, attempt, max_attempts, "Shared bucket write conflict");
            if attempt < max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(StoreUnavailable::Contention {
            attempts: max_attempts,
        })
    }

    /// Check that the shared store answers within the deadline.
    pub async fn ping(&self) -> Result<(), StoreUnavailable> {
        self.with_deadline("ping", self.store.ping()).await
    }

    /// Name of the underlying store.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    fn decode(
        &self,
        key: &BucketKey,
        raw: Option<&str>,
        policy: &EndpointPolicy,
        now_ms: u64,
    ) -> BucketState {
        let Some(raw) = raw else {
            return BucketState::new(policy, now_ms);
        };

        match serde_json::from_str::<BucketState>(raw) {
            Ok(mut state) => {
                state.apply_policy(policy);
                state
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Replacing unreadable shared bucket");
                BucketState::new(policy, now_ms)
            }
        }
    }

    async fn with_deadline<T, F>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<T, StoreUnavailable>
    where
        F: Future<Output = Result<T, StoreUnavailable>>,
    {
        let after = self.settings.operation_timeout;
        tokio::time::timeout(after, call)
            .await
            .map_err(|_| StoreUnavailable::Timeout { operation, after })?
    }

    /// Exponential backoff with full jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = u64::try_from(self.settings.backoff_base.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.settings.backoff_max.as_millis()).unwrap_or(u64::MAX);
        let ceiling = base
            .saturating_mul(1u64 << (attempt - 1).min(16))
            .min(max);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}
