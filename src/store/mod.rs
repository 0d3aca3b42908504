//! Shared key-value stores for distributed token buckets.
//!
//! A shared store only has to offer two things: reading a value and
//! replacing it on the condition that nobody else changed it since it was
//! read. The token arithmetic lives in the rate limiter, not here.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreUnavailable;

/// A key-value store with atomic compare-and-swap.
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Read the current value for `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreUnavailable>;

    /// Write `new` to `key` only if its current value equals `expected`
    /// (`None` meaning the key must not exist). The written value expires
    /// after `ttl`.
    ///
    /// Returns `Ok(false)` when the condition did not hold.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreUnavailable>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreUnavailable> {
        Ok(())
    }

    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;
}
