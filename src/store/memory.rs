//! In-process shared store.
//!
//! Useful for single-node deployments of the distributed code path and for
//! tests. Clones share the same underlying map.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::SharedStore;
use crate::error::StoreUnavailable;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// `None` when the TTL runs past what `Instant` can represent
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, now: Instant, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: now.checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// A [`SharedStore`] backed by a mutex-guarded map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a key unconditionally.
    #[cfg(test)]
    pub(crate) fn insert(&self, key: &str, value: &str, ttl: Duration) {
        self.entries
            .lock()
            .insert(key.to_string(), Entry::new(value, Instant::now(), ttl));
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreUnavailable> {
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.value.clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreUnavailable> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let current = entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }

        entries.insert(key.to_string(), Entry::new(new, now, ttl));
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
