//! Diagnostics sink for limiter events.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::StoreUnavailable;

use super::key::BucketKey;

/// Receives notable limiter events.
pub trait Diagnostics: Send + Sync + std::fmt::Debug {
    /// A request was denied.
    fn on_denied(&self, key: &BucketKey, endpoint_class: &str, retry_after: Duration);

    /// The distributed backend failed and the request was let through.
    fn on_backend_failure(&self, endpoint_class: &str, error: &StoreUnavailable);

    /// The limiter itself failed and the request was let through.
    fn on_internal_error(&self, endpoint_class: &str);

    /// Counters collected so far, if the sink keeps any.
    fn snapshot(&self) -> Option<DiagnosticsSnapshot> {
        None
    }
}

/// Totals reported by [`CountingDiagnostics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub denied_total: u64,
    pub backend_failures_total: u64,
    pub internal_errors_total: u64,
}

/// Logs every event and keeps running totals.
#[derive(Debug, Default)]
pub struct CountingDiagnostics {
    denied: AtomicU64,
    backend_failures: AtomicU64,
    internal_errors: AtomicU64,
}

impl CountingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Diagnostics for CountingDiagnostics {
    fn on_denied(&self, key: &BucketKey, endpoint_class: &str, retry_after: Duration) {
        self.denied.fetch_add(1, Ordering::Relaxed);
        debug!(
            key = %key,
            endpoint_class = %endpoint_class,
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate limit exceeded"
        );
    }

    fn on_backend_failure(&self, endpoint_class: &str, error: &StoreUnavailable) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            endpoint_class = %endpoint_class,
            error = %error,
            "Rate limit store unavailable, allowing request"
        );
    }

    fn on_internal_error(&self, endpoint_class: &str) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
        error!(
            endpoint_class = %endpoint_class,
            "Rate limiter failed, allowing request"
        );
    }

    fn snapshot(&self) -> Option<DiagnosticsSnapshot> {
        Some(DiagnosticsSnapshot {
            denied_total: self.denied.load(Ordering::Relaxed),
            backend_failures_total: self.backend_failures.load(Ordering::Relaxed),
            internal_errors_total: self.internal_errors.load(Ordering::Relaxed),
        })
    }
}
