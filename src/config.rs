//! Configuration management for Tollgate.
//!
//! Settings come from an optional YAML file layered with `TOLLGATE__*`
//! environment variables, e.g. `TOLLGATE__RATE_LIMIT__ENABLED=false`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{DistributedSettings, RateLimitConfig};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Seconds in-flight requests may take to finish after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Name of this replica in logs and health output
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            instance_id: default_instance_id(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Shared store configuration, used when the distributed backend is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Deadline for each store call in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Conditional write attempts per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            operation_timeout_ms: default_operation_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_operation_timeout_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_base_ms() -> u64 {
    5
}

fn default_backoff_max_ms() -> u64 {
    50
}

impl StoreConfig {
    /// Retry and deadline settings for the distributed proxy.
    pub fn distributed_settings(&self) -> DistributedSettings {
        DistributedSettings {
            max_attempts: self.max_attempts,
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TOLLGATE")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Check the whole configuration. Any error here must stop startup.
    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()?;

        if self.rate_limit.use_distributed_backend
            && self
                .store
                .redis_url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
        {
            return Err(TollgateError::Config(
                "rate_limit.use_distributed_backend requires store.redis_url".to_string(),
            ));
        }
        if self.store.max_attempts == 0 {
            return Err(TollgateError::Config(
                "store.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.store.operation_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.operation_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.store.backoff_base_ms > self.store.backoff_max_ms {
            return Err(TollgateError::Config(
                "store.backoff_base_ms must not exceed store.backoff_max_ms".to_string(),
            ));
        }
        if self.server.instance_id.trim().is_empty() {
            return Err(TollgateError::Config(
                "server.instance_id must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
