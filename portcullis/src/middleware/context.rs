//! Request context: id, client IP, timing
//!
//! The first pipeline stage. Assigns a request id (inbound header wins over
//! a generated one), resolves the client IP, and records the start time. On
//! the way out it echoes `X-Request-Id` and stamps `X-Response-Time`.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use uuid::Uuid;

use crate::state::AppState;

/// Header carrying the request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Accumulated per-request context, stored in request extensions
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Inbound id or a generated 128-bit random id
    pub request_id: String,

    /// Resolved client address
    pub client_ip: IpAddr,

    /// Monotonic start for latency measurement
    pub started_at: Instant,

    /// Wall-clock arrival time
    pub received_at: DateTime<Utc>,
}

/// Pipeline stage 1
pub async fn middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());

    let client_ip = resolve_client_ip(
        request.headers(),
        peer,
        state.config().proxy.trust_forwarded_headers,
    );

    let ctx = RequestContext {
        request_id: request_id.clone(),
        client_ip,
        started_at: Instant::now(),
        received_at: Utc::now(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    let elapsed_ms = ctx.started_at.elapsed().as_millis();
    if let Ok(value) = HeaderValue::from_str(&format!("{elapsed_ms}ms")) {
        headers.insert("x-response-time", value);
    }

    response
}

/// Resolve the client IP
///
/// Forwarded headers are honored only when the deployment declares a
/// trusted proxy in front of the gateway; otherwise the socket peer wins.
/// Preference order: first X-Forwarded-For entry, X-Real-Ip, socket peer.
pub fn resolve_client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trust_forwarded: bool,
) -> IpAddr {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = real_ip {
            return ip;
        }
    }

    peer.unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    const PEER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1));

    #[test]
    fn test_forwarded_for_first_entry_wins_when_trusted() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.2, 10.0.0.3")]);
        assert_eq!(
            resolve_client_ip(&h, Some(PEER), true),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_real_ip_fallback() {
        let h = headers(&[("x-real-ip", "198.51.100.4")]);
        assert_eq!(
            resolve_client_ip(&h, Some(PEER), true),
            "198.51.100.4".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_headers_ignored_when_untrusted() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7")]);
        assert_eq!(resolve_client_ip(&h, Some(PEER), false), PEER);
    }

    #[test]
    fn test_garbage_header_falls_through_to_peer() {
        let h = headers(&[("x-forwarded-for", "not-an-ip")]);
        assert_eq!(resolve_client_ip(&h, Some(PEER), true), PEER);
    }

    #[test]
    fn test_ipv6_forwarded() {
        let h = headers(&[("x-forwarded-for", "2001:db8::1")]);
        assert_eq!(
            resolve_client_ip(&h, Some(PEER), true),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
    }
}
