//! Header shaping for proxied requests and responses
//!
//! Hop-by-hop headers are stripped in both directions. Upstream requests
//! carry a small allowlist of client headers plus the forwarding set; the
//! response comes back with everything except hop-by-hop fields.

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::middleware::context::RequestContext;
use crate::middleware::identity::Identity;

/// Hop-by-hop headers, stripped from both directions
pub const HOP_BY_HOP: &[&str] = &[
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "upgrade",
];

/// Client headers forwarded to the upstream
pub const FORWARDED_CLIENT_HEADERS: &[&str] = &[
    "content-type",
    "accept",
    "accept-language",
    "user-agent",
];

/// True when a header must not cross the proxy boundary
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str() == *h)
}

/// Build the header map for an upstream attempt
pub fn upstream_headers(
    inbound: &HeaderMap,
    ctx: &RequestContext,
    identity: Option<&Identity>,
    scheme: &str,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for name in FORWARDED_CLIENT_HEADERS {
        if let Some(value) = inbound.get(*name) {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                headers.insert(name, value.clone());
            }
        }
    }

    insert(&mut headers, "x-request-id", &ctx.request_id);
    insert(&mut headers, "x-forwarded-for", &ctx.client_ip.to_string());
    insert(&mut headers, "x-forwarded-proto", scheme);

    if let Some(host) = inbound.get("host").and_then(|v| v.to_str().ok()) {
        insert(&mut headers, "x-forwarded-host", host);
    }

    if let Some(identity) = identity {
        insert(&mut headers, "x-user-id", &identity.user_id().to_string());
        insert(&mut headers, "x-user-tier", identity.tier().as_str());
    }

    headers
}

/// Copy an upstream response's headers, dropping hop-by-hop fields
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Instant;

    fn ctx() -> RequestContext {
        RequestContext {
            request_id: "req-123".to_string(),
            client_ip: "203.0.113.7".parse().unwrap(),
            started_at: Instant::now(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("proxy-authorization")));
        assert!(is_hop_by_hop(&HeaderName::from_static("upgrade")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("x-request-id")));
    }

    #[test]
    fn test_upstream_headers_allowlist() {
        let mut inbound = HeaderMap::new();
        inbound.insert("content-type", HeaderValue::from_static("application/json"));
        inbound.insert("accept", HeaderValue::from_static("application/json"));
        inbound.insert("user-agent", HeaderValue::from_static("curl/8"));
        inbound.insert("host", HeaderValue::from_static("api.example.com"));
        // Must not cross the boundary
        inbound.insert("authorization", HeaderValue::from_static("Bearer secret"));
        inbound.insert("cookie", HeaderValue::from_static("session=abc"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));

        let headers = upstream_headers(&inbound, &ctx(), None, "https");

        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("user-agent").unwrap(), "curl/8");
        assert_eq!(headers.get("x-request-id").unwrap(), "req-123");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.7");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "api.example.com");

        assert!(headers.get("authorization").is_none());
        assert!(headers.get("cookie").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-user-id").is_none());
    }

    #[test]
    fn test_response_headers_strip_hop_by_hop() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("text/plain"));
        upstream.insert("etag", HeaderValue::from_static("\"abc\""));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        upstream.insert("keep-alive", HeaderValue::from_static("timeout=5"));

        let filtered = response_headers(&upstream);
        assert_eq!(filtered.get("content-type").unwrap(), "text/plain");
        assert_eq!(filtered.get("etag").unwrap(), "\"abc\"");
        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("keep-alive").is_none());
    }
}
