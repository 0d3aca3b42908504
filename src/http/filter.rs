//! Admission filter.
//!
//! A tower layer that puts every non-exempt request through the rate limiter
//! before it reaches the downstream service.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{HeaderMap, HeaderValue, Request, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};
use tracing::warn;

use crate::ratelimit::{Decision, RateLimiter};

use super::resolver::KeyResolver;
use super::routes::RouteTable;

pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const AVAILABLE_HEADER: &str = "x-ratelimit-available";
pub const RETRY_AFTER_HEADER: &str = "x-ratelimit-retry-after";

/// Body returned with a 429.
#[derive(Debug, Serialize)]
struct RateLimitExceeded {
    error: &'static str,
    message: &'static str,
    status: u16,
    timestamp: String,
}

struct AdmissionState {
    limiter: Arc<RateLimiter>,
    resolver: KeyResolver,
    routes: RouteTable,
}

/// Layer that wraps a service in an [`AdmissionService`].
#[derive(Clone)]
pub struct AdmissionLayer {
    state: Arc<AdmissionState>,
}

impl AdmissionLayer {
    pub fn new(limiter: Arc<RateLimiter>, routes: RouteTable) -> Self {
        Self {
            state: Arc::new(AdmissionState {
                limiter,
                resolver: KeyResolver::new(),
                routes,
            }),
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            state: Arc::clone(&self.state),
        }
    }
}

/// Rate limits requests before handing them to `S`.
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    state: Arc<AdmissionState>,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let state = Arc::clone(&self.state);
        // Keep the service that was polled ready
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let path = request.uri().path().to_string();
            if state.routes.is_exempt(&path) {
                return inner.call(request).await;
            }

            let remote_addr = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0);
            let client_key = state.resolver.resolve(request.headers(), remote_addr);
            let endpoint_class = state.routes.classify(&path, request.method());

            let decision = match AssertUnwindSafe(
                state.limiter.check_and_consume(&client_key, &endpoint_class),
            )
            .catch_unwind()
            .await
            {
                Ok(decision) => decision,
                Err(_) => {
                    state.limiter.diagnostics().on_internal_error(&endpoint_class);
                    Decision::unlimited()
                }
            };

            if decision.allowed {
                let mut response = inner.call(request).await?;
                apply_headers(response.headers_mut(), &decision);
                return Ok(response);
            }

            warn!(
                client = %client_key,
                endpoint_class = %endpoint_class,
                path = %path,
                retry_after_secs = retry_after_secs(decision.retry_after),
                "Rate limit exceeded"
            );
            Ok(denied(&decision))
        })
    }
}

/// Whole seconds, rounded up.
fn retry_after_secs(retry_after: Duration) -> u64 {
    u64::try_from(retry_after.as_millis().div_ceil(1000)).unwrap_or(u64::MAX)
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    if decision.remaining_tokens >= 0 {
        headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining_tokens));
    }
    if decision.available_tokens >= 0 {
        headers.insert(AVAILABLE_HEADER, HeaderValue::from(decision.available_tokens));
    }
    if !decision.retry_after.is_zero() {
        headers.insert(
            RETRY_AFTER_HEADER,
            HeaderValue::from(retry_after_secs(decision.retry_after)),
        );
    }
}

fn denied(decision: &Decision) -> Response {
    let mut headers = HeaderMap::new();
    apply_headers(&mut headers, decision);
    headers.insert(
        http::header::RETRY_AFTER,
        HeaderValue::from(retry_after_secs(decision.retry_after)),
    );

    let body = RateLimitExceeded {
        error: "Rate limit exceeded",
        message: "Too many requests. Please try again later.",
        status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Clock, EndpointPolicy, ManualClock, RateLimitConfig, RouteRule};
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn limiter_with(capacity: u64, clock: Arc<dyn Clock>) -> Arc<RateLimiter> {
        let mut config = RateLimitConfig::default();
        config.endpoints.insert(
            "listUsers".to_string(),
            EndpointPolicy::new(capacity, capacity, Duration::from_secs(60)),
        );
        Arc::new(RateLimiter::builder(config).clock(clock).build().unwrap())
    }

    fn internal_errors(limiter: &RateLimiter) -> u64 {
        limiter
            .diagnostics()
            .snapshot()
            .map_or(0, |s| s.internal_errors_total)
    }

    fn app(limiter: Arc<RateLimiter>, hits: Arc<AtomicUsize>) -> Router {
        let routes = RouteTable::new(
            &[RouteRule {
                path: "/api/users".to_string(),
                method: "GET".to_string(),
                endpoint_class: "listUsers".to_string(),
            }],
            &["/actuator".to_string()],
        )
        .unwrap();

        let counted = move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "ok"
            }
        };

        Router::new()
            .route("/api/users", get(counted.clone()))
            .route("/actuator/health", get(counted))
            .layer(AdmissionLayer::new(limiter, routes))
    }

    fn request(path: &str, client: &'static str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap()
    }

    #[derive(Debug)]
    struct PanickingClock;

    impl Clock for PanickingClock {
        fn now_millis(&self) -> u64 {
            panic!("clock unavailable");
        }
    }

    #[tokio::test]
    async fn test_allowed_request_carries_headers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(limiter_with(3, Arc::new(ManualClock::new(0))), hits.clone());

        let response = app.oneshot(request("/api/users", "10.0.0.5")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REMAINING_HEADER], "2");
        assert_eq!(response.headers()[AVAILABLE_HEADER], "2");
        assert!(response.headers().get(RETRY_AFTER_HEADER).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_request_short_circuits() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(limiter_with(1, Arc::new(ManualClock::new(0))), hits.clone());

        let first = app
            .clone()
            .oneshot(request("/api/users", "10.0.0.5"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let response = app.oneshot(request("/api/users", "10.0.0.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[REMAINING_HEADER], "0");
        assert_eq!(response.headers()[RETRY_AFTER_HEADER], "60");
        assert_eq!(response.headers()[http::header::RETRY_AFTER], "60");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Rate limit exceeded");
        assert_eq!(json["message"], "Too many requests. Please try again later.");
        assert_eq!(json["status"], 429);
        assert!(json["timestamp"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_clients_limited_separately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(limiter_with(1, Arc::new(ManualClock::new(0))), hits.clone());

        let a = app.clone().oneshot(request("/api/users", "10.0.0.5")).await.unwrap();
        let b = app.clone().oneshot(request("/api/users", "10.0.0.6")).await.unwrap();
        let a_again = app.oneshot(request("/api/users", "10.0.0.5")).await.unwrap();

        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(b.status(), StatusCode::OK);
        assert_eq!(a_again.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_exempt_path_bypasses_limiter() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(limiter_with(1, Arc::new(ManualClock::new(0))), hits.clone());

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(request("/actuator/health", "10.0.0.5"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(REMAINING_HEADER).is_none());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_limiter_panic_fails_open() {
        let hits = Arc::new(AtomicUsize::new(0));
        let limiter = limiter_with(1, Arc::new(PanickingClock));
        let app = app(Arc::clone(&limiter), hits.clone());

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request("/api/users", "10.0.0.5"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(REMAINING_HEADER).is_none());
            assert!(response.headers().get(AVAILABLE_HEADER).is_none());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(internal_errors(&limiter), 3);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1000)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1001)), 2);
        assert_eq!(retry_after_secs(Duration::ZERO), 0);
    }
}
