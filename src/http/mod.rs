//! HTTP surface: admission filter, client identity, request classification
//! and the operational endpoints.

pub mod admin;
mod filter;
mod resolver;
mod routes;
mod server;

pub use admin::AdminState;
pub use filter::{
    AdmissionLayer, AdmissionService, AVAILABLE_HEADER, REMAINING_HEADER, RETRY_AFTER_HEADER,
};
pub use resolver::KeyResolver;
pub use routes::RouteTable;
pub use server::HttpServer;

use axum::Router;

/// Compose `downstream` with the admin endpoints behind the admission filter.
pub fn app(downstream: Router, admin: AdminState, routes: RouteTable) -> Router {
    let limiter = admin.limiter.clone();
    downstream
        .merge(admin::router(admin))
        .layer(AdmissionLayer::new(limiter, routes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{EndpointPolicy, ManualClock, RateLimitConfig, RateLimiter};
    use axum::body::Body;
    use axum::routing::get;
    use http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn composed(capacity: u64) -> Router {
        let mut config = RateLimitConfig::from_yaml(
            r#"
routes:
  - path: /api/users/{id}
    method: GET
    endpoint_class: getUserById
"#,
        )
        .unwrap();
        config.endpoints.insert(
            "getUserById".to_string(),
            EndpointPolicy::new(capacity, capacity, Duration::from_secs(60)),
        );
        config.default_capacity = 1;
        config.default_refill_tokens = 1;

        let limiter = RateLimiter::builder(config.clone())
            .clock(Arc::new(ManualClock::new(0)))
            .build()
            .unwrap();
        let routes = RouteTable::new(&config.routes, &config.exempt_path_prefixes).unwrap();
        let admin = AdminState {
            limiter: Arc::new(limiter),
            config: Arc::new(config),
            instance_id: "test".to_string(),
        };

        let downstream = Router::new().route("/api/users/:id", get(|| async { "user" }));
        app(downstream, admin, routes)
    }

    fn get_from(uri: &str, client: &'static str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-real-ip", client)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_capacity_three_over_http() {
        let app = composed(3);

        for expected in ["2", "1", "0"] {
            let response = app
                .clone()
                .oneshot(get_from("/api/users/7", "10.0.0.5"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[REMAINING_HEADER], expected);
        }

        let denied = app.oneshot(get_from("/api/users/7", "10.0.0.5")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_path_params_share_one_bucket() {
        let app = composed(2);

        let a = app.clone().oneshot(get_from("/api/users/1", "c")).await.unwrap();
        let b = app.clone().oneshot(get_from("/api/users/2", "c")).await.unwrap();
        let c = app.oneshot(get_from("/api/users/3", "c")).await.unwrap();

        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(b.status(), StatusCode::OK);
        assert_eq!(c.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_admin_endpoints_limited_but_actuator_exempt() {
        let app = composed(1);

        let first = app
            .clone()
            .oneshot(get_from("/api/rate-limit/config", "c"))
            .await
            .unwrap();
        let second = app
            .clone()
            .oneshot(get_from("/api/rate-limit/config", "c"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        for _ in 0..3 {
            let health = app
                .clone()
                .oneshot(get_from("/actuator/health", "c"))
                .await
                .unwrap();
            assert_eq!(health.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_unrouted_paths_are_limited_then_404() {
        let app = composed(1);

        let first = app.clone().oneshot(get_from("/nowhere", "c")).await.unwrap();
        let second = app.oneshot(get_from("/nowhere", "c")).await.unwrap();

        assert_eq!(first.status(), StatusCode::NOT_FOUND);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
