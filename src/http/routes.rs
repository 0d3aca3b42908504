//! Request classification.
//!
//! Maps a request path and method to the endpoint class whose policy governs
//! it, and decides which paths bypass the limiter altogether.

use http::Method;

use crate::error::{Result, TollgateError};
use crate::ratelimit::RouteRule;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
}

#[derive(Debug, Clone)]
struct Route {
    segments: Vec<Segment>,
    method: Method,
    endpoint_class: String,
}

impl Route {
    fn matches(&self, segments: &[&str], method: &Method) -> bool {
        if self.method != *method || self.segments.len() != segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(segments)
            .all(|(pattern, actual)| match pattern {
                Segment::Literal(literal) => literal == actual,
                Segment::Param => !actual.is_empty(),
            })
    }
}

/// Static routing table from `(path pattern, method)` to endpoint class.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    exempt_prefixes: Vec<String>,
}

impl RouteTable {
    /// Compile route rules and exempt prefixes.
    pub fn new(rules: &[RouteRule], exempt_prefixes: &[String]) -> Result<Self> {
        let routes = rules
            .iter()
            .map(|rule| {
                let method = Method::from_bytes(rule.method.to_ascii_uppercase().as_bytes())
                    .map_err(|_| {
                        TollgateError::Config(format!(
                            "route '{}' has invalid method '{}'",
                            rule.path, rule.method
                        ))
                    })?;
                Ok(Route {
                    segments: split_path(&rule.path)
                        .into_iter()
                        .map(|s| {
                            if s.starts_with('{') && s.ends_with('}') {
                                Segment::Param
                            } else {
                                Segment::Literal(s.to_string())
                            }
                        })
                        .collect(),
                    method,
                    endpoint_class: rule.endpoint_class.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            routes,
            exempt_prefixes: exempt_prefixes.to_vec(),
        })
    }

    /// Whether requests for `path` skip rate limiting.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// The endpoint class for a request.
    ///
    /// Unmapped requests get a class synthesized from the path and method,
    /// e.g. `GET /api/orders` becomes `_api_orders_get`.
    pub fn classify(&self, path: &str, method: &Method) -> String {
        let segments = split_path(path);
        self.routes
            .iter()
            .find(|route| route.matches(&segments, method))
            .map(|route| route.endpoint_class.clone())
            .unwrap_or_else(|| {
                format!(
                    "{}_{}",
                    path.replace('/', "_"),
                    method.as_str().to_ascii_lowercase()
                )
            })
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.trim_start_matches('/').split('/').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(path: &str, method: &str, class: &str) -> RouteRule {
        RouteRule {
            path: path.to_string(),
            method: method.to_string(),
            endpoint_class: class.to_string(),
        }
    }

    fn user_routes() -> RouteTable {
        RouteTable::new(
            &[
                rule("/api/users", "GET", "listUsers"),
                rule("/api/users", "POST", "createUser"),
                rule("/api/users/{id}", "GET", "getUserById"),
                rule("/api/users/{id}", "put", "updateUser"),
                rule("/api/users/{id}", "DELETE", "deleteUser"),
            ],
            &["/actuator".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_classify_static_routes() {
        let table = user_routes();
        assert_eq!(table.classify("/api/users", &Method::GET), "listUsers");
        assert_eq!(table.classify("/api/users", &Method::POST), "createUser");
        assert_eq!(table.classify("/api/users/42", &Method::GET), "getUserById");
        assert_eq!(table.classify("/api/users/42", &Method::PUT), "updateUser");
        assert_eq!(table.classify("/api/users/abc", &Method::DELETE), "deleteUser");
    }

    #[test]
    fn test_param_matches_exactly_one_segment() {
        let table = user_routes();
        assert_eq!(
            table.classify("/api/users/42/roles", &Method::GET),
            "_api_users_42_roles_get"
        );
        assert_eq!(table.classify("/api/users/", &Method::GET), "_api_users__get");
    }

    #[test]
    fn test_unmapped_requests_get_synthesized_class() {
        let table = user_routes();
        assert_eq!(table.classify("/api/orders", &Method::GET), "_api_orders_get");
        assert_eq!(table.classify("/api/users", &Method::PATCH), "_api_users_patch");
        assert_eq!(RouteTable::default().classify("/", &Method::HEAD), "__head");
    }

    #[test]
    fn test_exempt_prefixes() {
        let table = user_routes();
        assert!(table.is_exempt("/actuator/health"));
        assert!(table.is_exempt("/actuator"));
        assert!(!table.is_exempt("/api/users"));
        assert!(!RouteTable::default().is_exempt("/actuator"));
    }

    #[test]
    fn test_invalid_method_rejected() {
        assert!(RouteTable::new(&[rule("/a", "NOT A METHOD", "x")], &[]).is_err());
    }
}
