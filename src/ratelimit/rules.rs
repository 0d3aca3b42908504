//! Rate limit policy configuration and resolution.
//!
//! This module holds the recognised rate limiting options, the per-endpoint-class
//! bucket policies and the rules that validate them at startup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Largest accepted bucket capacity.
pub const MAX_CAPACITY: u64 = 1_000_000_000;
/// Longest accepted refill period: one year.
pub const MAX_REFILL_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

/// Bucket parameters bound to an endpoint class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// Maximum number of tokens the bucket holds
    pub capacity: u64,
    /// Tokens added at the end of every refill period
    pub refill_tokens: u64,
    /// Length of one refill period in seconds
    pub refill_period_secs: u64,
}

impl EndpointPolicy {
    /// Create a new policy.
    pub fn new(capacity: u64, refill_tokens: u64, refill_period: Duration) -> Self {
        Self {
            capacity,
            refill_tokens,
            refill_period_secs: refill_period.as_secs(),
        }
    }

    /// Get the refill period as a duration.
    pub fn refill_period(&self) -> Duration {
        Duration::from_secs(self.refill_period_secs)
    }

    /// Get the refill period in milliseconds.
    pub fn refill_period_millis(&self) -> u64 {
        self.refill_period_secs.saturating_mul(1000)
    }

    /// Time an empty bucket needs to refill to capacity.
    pub fn time_to_full(&self) -> Duration {
        let periods = self.capacity.div_ceil(self.refill_tokens.max(1));
        self.refill_period().saturating_mul(u32::try_from(periods).unwrap_or(u32::MAX))
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.capacity == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}': capacity must be at least 1",
                name
            )));
        }
        if self.refill_tokens == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}': refill_tokens must be at least 1",
                name
            )));
        }
        if self.refill_period_secs == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}': refill_period_secs must be at least 1",
                name
            )));
        }
        if self.capacity > MAX_CAPACITY {
            return Err(TollgateError::Config(format!(
                "policy '{}': capacity must not exceed {}",
                name, MAX_CAPACITY
            )));
        }
        if self.refill_period_secs > MAX_REFILL_PERIOD_SECS {
            return Err(TollgateError::Config(format!(
                "policy '{}': refill_period_secs must not exceed {}",
                name, MAX_REFILL_PERIOD_SECS
            )));
        }
        Ok(())
    }
}

/// Rate limiting algorithm.
///
/// Only the token bucket is implemented; the window strategies are recognised
/// so that configuring them fails loudly instead of silently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    #[serde(alias = "token_bucket")]
    TokenBucket,
    #[serde(alias = "fixed_window")]
    FixedWindow,
    #[serde(alias = "sliding_window")]
    SlidingWindow,
}

/// A static route mapping a path pattern and method to an endpoint class.
///
/// Path segments written as `{name}` match exactly one non-empty segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path pattern, e.g. `/api/users/{id}`
    pub path: String,
    /// HTTP method, e.g. `GET`
    pub method: String,
    /// Endpoint class the request is limited under
    pub endpoint_class: String,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Master switch; when false every request is allowed
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Limiting algorithm
    #[serde(default)]
    pub strategy: Strategy,

    /// Capacity of buckets without an endpoint-specific policy
    #[serde(default = "default_capacity")]
    pub default_capacity: u64,

    /// Refill amount of buckets without an endpoint-specific policy
    #[serde(default = "default_refill_tokens")]
    pub default_refill_tokens: u64,

    /// Refill period of buckets without an endpoint-specific policy
    #[serde(default = "default_refill_period_secs")]
    pub default_refill_period_secs: u64,

    /// Keep buckets in the shared store instead of in process
    #[serde(default)]
    pub use_distributed_backend: bool,

    /// Prefix for every bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-endpoint-class policy overrides
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointPolicy>,

    /// Static routing table used to classify requests
    #[serde(default)]
    pub routes: Vec<RouteRule>,

    /// Requests whose path starts with one of these bypass the limiter
    #[serde(default = "default_exempt_path_prefixes")]
    pub exempt_path_prefixes: Vec<String>,

    /// Idle time after which a refilled local bucket may be dropped (0 disables)
    #[serde(default = "default_local_idle_ttl_secs")]
    pub local_idle_ttl_secs: u64,

    /// How often the local store is swept for idle buckets
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            strategy: Strategy::default(),
            default_capacity: default_capacity(),
            default_refill_tokens: default_refill_tokens(),
            default_refill_period_secs: default_refill_period_secs(),
            use_distributed_backend: false,
            key_prefix: default_key_prefix(),
            endpoints: BTreeMap::new(),
            routes: Vec::new(),
            exempt_path_prefixes: default_exempt_path_prefixes(),
            local_idle_ttl_secs: default_local_idle_ttl_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_capacity() -> u64 {
    100
}

fn default_refill_tokens() -> u64 {
    100
}

fn default_refill_period_secs() -> u64 {
    60
}

fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

fn default_exempt_path_prefixes() -> Vec<String> {
    vec!["/actuator".to_string()]
}

fn default_local_idle_ttl_secs() -> u64 {
    600
}

fn default_eviction_interval_secs() -> u64 {
    60
}

impl RateLimitConfig {
    /// Load a rate limit section from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse rate limit config: {}", e)))
    }

    /// The policy applied to endpoint classes without an override.
    pub fn default_policy(&self) -> EndpointPolicy {
        EndpointPolicy {
            capacity: self.default_capacity,
            refill_tokens: self.default_refill_tokens,
            refill_period_secs: self.default_refill_period_secs,
        }
    }

    /// Check every option; any failure here must stop startup.
    pub fn validate(&self) -> Result<()> {
        if self.strategy != Strategy::TokenBucket {
            return Err(TollgateError::Config(format!(
                "strategy {:?} is not implemented; only token-bucket is supported",
                self.strategy
            )));
        }

        self.default_policy().validate("default")?;
        for (class, policy) in &self.endpoints {
            policy.validate(class)?;
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if !route.path.starts_with('/') {
                return Err(TollgateError::Config(format!(
                    "route path '{}' must start with '/'",
                    route.path
                )));
            }
            if http::Method::from_bytes(route.method.to_ascii_uppercase().as_bytes()).is_err() {
                return Err(TollgateError::Config(format!(
                    "route '{}' has invalid method '{}'",
                    route.path, route.method
                )));
            }
            if route.endpoint_class.trim().is_empty() {
                return Err(TollgateError::Config(format!(
                    "route '{} {}' has an empty endpoint class",
                    route.method, route.path
                )));
            }
            if !seen.insert((route.path.as_str(), route.method.to_ascii_uppercase())) {
                return Err(TollgateError::Config(format!(
                    "duplicate route '{} {}'",
                    route.method, route.path
                )));
            }
        }

        if let Some(prefix) = self.exempt_path_prefixes.iter().find(|p| !p.starts_with('/')) {
            return Err(TollgateError::Config(format!(
                "exempt path prefix '{}' must start with '/'",
                prefix
            )));
        }

        if self.local_idle_ttl_secs > 0 && self.eviction_interval_secs == 0 {
            return Err(TollgateError::Config(
                "eviction_interval_secs must be at least 1 when idle eviction is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

/// Resolved policies, keyed by lowercased endpoint class.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    default: EndpointPolicy,
    endpoints: HashMap<String, EndpointPolicy>,
}

impl PolicyTable {
    /// Build the lookup table from configuration.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let endpoints: HashMap<String, EndpointPolicy> = config
            .endpoints
            .iter()
            .map(|(class, policy)| (class.to_ascii_lowercase(), *policy))
            .collect();

        info!(
            overrides = endpoints.len(),
            default_capacity = config.default_capacity,
            "Loaded rate limit policies"
        );

        Self {
            default: config.default_policy(),
            endpoints,
        }
    }

    /// Find the policy for an endpoint class, falling back to the default.
    ///
    /// Class names compare case-insensitively. An unknown class is not an error.
    pub fn resolve(&self, endpoint_class: &str) -> &EndpointPolicy {
        self.endpoints
            .get(&endpoint_class.to_ascii_lowercase())
            .unwrap_or(&self.default)
    }
}
