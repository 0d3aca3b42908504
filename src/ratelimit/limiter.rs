//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::error::{Result, StoreUnavailable, TollgateError};
use crate::store::SharedStore;

use super::bucket::Consumption;
use super::clock::{Clock, SystemClock};
use super::diagnostics::{CountingDiagnostics, Diagnostics};
use super::distributed::{DistributedBucketProxy, DistributedSettings};
use super::key::BucketKey;
use super::rules::{PolicyTable, RateLimitConfig};
use super::store::LocalBucketStore;

/// The answer to a single admission check.
///
/// `remaining_tokens` and `available_tokens` are `-1` when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining_tokens: i64,
    pub available_tokens: i64,
    pub retry_after: Duration,
}

impl Decision {
    /// Allow with unknown counters. Used when limiting is disabled and when
    /// the backend fails.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining_tokens: -1,
            available_tokens: -1,
            retry_after: Duration::ZERO,
        }
    }

    fn from_consumption(consumption: Consumption, available_tokens: i64) -> Self {
        match consumption {
            Consumption::Consumed { remaining } => Self {
                allowed: true,
                remaining_tokens: to_i64(remaining),
                available_tokens,
                retry_after: Duration::ZERO,
            },
            Consumption::Rejected { retry_after } => Self {
                allowed: false,
                remaining_tokens: 0,
                available_tokens,
                retry_after,
            },
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Where buckets live. Chosen once, at construction.
#[derive(Debug)]
pub enum Backend {
    /// Buckets held in this process
    Local(LocalBucketStore),
    /// Buckets held in a store shared by all replicas
    Distributed(DistributedBucketProxy),
}

impl Backend {
    /// Short name for logs and health output.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Local(_) => "in-memory",
            Backend::Distributed(proxy) => proxy.store_name(),
        }
    }
}

/// The core rate limiter.
///
/// This struct is thread-safe and is meant to be shared behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    key_prefix: String,
    policies: PolicyTable,
    backend: Backend,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<dyn Diagnostics>,
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<dyn Diagnostics>,
    shared_store: Option<(Arc<dyn SharedStore>, DistributedSettings)>,
}

impl RateLimiterBuilder {
    /// Use a specific clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Send denial and failure events to `diagnostics`.
    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Provide the shared store used when the distributed backend is enabled.
    pub fn shared_store(mut self, store: Arc<dyn SharedStore>, settings: DistributedSettings) -> Self {
        self.shared_store = Some((store, settings));
        self
    }

    /// Validate the configuration and build the limiter.
    pub fn build(self) -> Result<RateLimiter> {
        self.config.validate()?;

        let backend = if self.config.use_distributed_backend {
            let (store, settings) = self.shared_store.ok_or_else(|| {
                TollgateError::Config(
                    "use_distributed_backend is set but no shared store is configured".to_string(),
                )
            })?;
            if settings.max_attempts == 0 || settings.operation_timeout.is_zero() {
                return Err(TollgateError::Config(
                    "shared store needs at least one attempt and a nonzero timeout".to_string(),
                ));
            }
            Backend::Distributed(DistributedBucketProxy::new(
                store,
                settings,
                Arc::clone(&self.clock),
            ))
        } else {
            Backend::Local(LocalBucketStore::new())
        };

        info!(
            enabled = self.config.enabled,
            backend = backend.name(),
            key_prefix = %self.config.key_prefix,
            "Rate limiter initialized"
        );

        Ok(RateLimiter {
            enabled: self.config.enabled,
            key_prefix: self.config.key_prefix.clone(),
            policies: PolicyTable::from_config(&self.config),
            backend,
            clock: self.clock,
            diagnostics: self.diagnostics,
        })
    }
}

impl RateLimiter {
    /// Start building a limiter from configuration.
    pub fn builder(config: RateLimitConfig) -> RateLimiterBuilder {
        RateLimiterBuilder {
            config,
            clock: Arc::new(SystemClock),
            diagnostics: Arc::new(CountingDiagnostics::new()),
            shared_store: None,
        }
    }

    /// Create a limiter with in-process buckets and default collaborators.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Decide whether one request from `client_key` to `endpoint_class` may
    /// proceed, consuming a token if so.
    ///
    /// This never fails: a backend failure yields an allow decision with
    /// unknown counters and is reported to diagnostics.
    pub async fn check_and_consume(&self, client_key: &str, endpoint_class: &str) -> Decision {
        if !self.enabled {
            return Decision::unlimited();
        }

        // Class names are case-insensitive for both policy and bucket
        let class = endpoint_class.to_ascii_lowercase();
        let policy = self.policies.resolve(&class);
        let key = BucketKey::new(&self.key_prefix, &class, client_key);

        trace!(key = %key, capacity = policy.capacity, "Checking rate limit");

        let decision = match &self.backend {
            Backend::Local(store) => {
                let outcome = store.check_and_consume(&key, policy, self.clock.now_millis());
                Decision::from_consumption(outcome.consumption, to_i64(outcome.available))
            }
            Backend::Distributed(proxy) => match proxy.check_and_consume(&key, policy).await {
                Ok(consumption) => Decision::from_consumption(consumption, -1),
                Err(err) => {
                    self.diagnostics.on_backend_failure(endpoint_class, &err);
                    return Decision::unlimited();
                }
            },
        };

        if !decision.allowed {
            self.diagnostics
                .on_denied(&key, endpoint_class, decision.retry_after);
        }

        decision
    }

    /// Whether limiting is switched on.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The active backend.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The diagnostics sink.
    pub fn diagnostics(&self) -> &Arc<dyn Diagnostics> {
        &self.diagnostics
    }

    /// Check that the backend can serve requests.
    pub async fn ping_backend(&self) -> std::result::Result<(), StoreUnavailable> {
        match &self.backend {
            Backend::Local(_) => Ok(()),
            Backend::Distributed(proxy) => proxy.ping().await,
        }
    }

    /// Drop idle, refilled local buckets. A no-op for the distributed backend,
    /// where keys expire in the store.
    pub fn evict_idle(&self, idle_ttl: Duration) -> usize {
        match &self.backend {
            Backend::Local(store) => store.evict_idle(idle_ttl, self.clock.now_millis()),
            Backend::Distributed(_) => 0,
        }
    }

    /// Number of buckets held locally.
    pub fn local_bucket_count(&self) -> usize {
        match &self.backend {
            Backend::Local(store) => store.len(),
            Backend::Distributed(_) => 0,
        }
    }

    /// Periodically evict idle local buckets until the handle is aborted.
    ///
    /// Returns `None` when there is nothing to sweep.
    pub fn spawn_idle_eviction(
        self: &Arc<Self>,
        idle_ttl: Duration,
        every: Duration,
    ) -> Option<JoinHandle<()>> {
        if idle_ttl.is_zero() || every.is_zero() || !matches!(self.backend, Backend::Local(_)) {
            return None;
        }

        let limiter = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.evict_idle(idle_ttl);
                if removed > 0 {
                    debug!(
                        removed,
                        remaining = limiter.local_bucket_count(),
                        "Evicted idle token buckets"
                    );
                }
            }
        }))
    }
}
