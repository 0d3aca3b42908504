//! Client identity resolution.

use http::HeaderMap;
use std::net::SocketAddr;

/// Header carrying the proxy chain, client first.
pub const FORWARDED_FOR: &str = "x-forwarded-for";
/// Header carrying the client address as reported by a proxy.
pub const REAL_IP: &str = "x-real-ip";
/// Identity used when nothing else is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Derives the rate limiting identity of a request.
///
/// First match wins:
/// 1. the left-most address in `X-Forwarded-For`
/// 2. `X-Real-IP`
/// 3. the remote address of the connection
/// 4. `"unknown"`
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyResolver;

impl KeyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the client key from request headers and the peer address.
    pub fn resolve(&self, headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
        if let Some(client) = header_value(headers, FORWARDED_FOR)
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|client| !client.is_empty())
        {
            return client.to_string();
        }

        if let Some(real_ip) = header_value(headers, REAL_IP) {
            return real_ip.to_string();
        }

        match remote_addr {
            Some(addr) => addr.ip().to_string(),
            None => UNKNOWN_CLIENT.to_string(),
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
