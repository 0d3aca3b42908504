//! Operational endpoints: effective rate limit policy and health.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ratelimit::{EndpointPolicy, RateLimitConfig, RateLimiter, Strategy};

/// Shared state for the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<RateLimitConfig>,
    pub instance_id: String,
}

#[derive(Debug, Serialize)]
pub struct PolicyView {
    pub enabled: bool,
    pub strategy: Strategy,
    pub use_distributed_backend: bool,
    pub default_capacity: u64,
    pub default_refill_tokens: u64,
    pub default_refill_period_secs: u64,
    pub endpoints: BTreeMap<String, EndpointPolicy>,
}

#[derive(Debug, Serialize)]
pub struct LimiterHealth {
    pub status: &'static str,
    pub instance_id: String,
    pub rate_limit_enabled: bool,
    pub backend: &'static str,
    pub backend_reachable: bool,
    pub denied_total: u64,
    pub backend_failures_total: u64,
    pub internal_errors_total: u64,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
}

/// Routes for the admin endpoints.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/api/rate-limit/config", get(policy))
        .route("/api/rate-limit/health", get(limiter_health))
        .route("/actuator/health", get(health))
        .with_state(state)
}

async fn policy(State(state): State<AdminState>) -> Json<PolicyView> {
    let config = &state.config;
    Json(PolicyView {
        enabled: config.enabled,
        strategy: config.strategy,
        use_distributed_backend: config.use_distributed_backend,
        default_capacity: config.default_capacity,
        default_refill_tokens: config.default_refill_tokens,
        default_refill_period_secs: config.default_refill_period_secs,
        endpoints: config.endpoints.clone(),
    })
}

async fn limiter_health(State(state): State<AdminState>) -> Json<LimiterHealth> {
    let limiter = &state.limiter;
    let counters = limiter.diagnostics().snapshot().unwrap_or_default();

    // Store trouble is reported, not escalated: requests are still served.
    Json(LimiterHealth {
        status: "UP",
        instance_id: state.instance_id.clone(),
        rate_limit_enabled: limiter.is_enabled(),
        backend: limiter.backend().name(),
        backend_reachable: limiter.ping_backend().await.is_ok(),
        denied_total: counters.denied_total,
        backend_failures_total: counters.backend_failures_total,
        internal_errors_total: counters.internal_errors_total,
    })
}

async fn health() -> Json<Health> {
    Json(Health { status: "UP" })
}
