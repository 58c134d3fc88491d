//! Security and gateway identification headers
//!
//! The response-transforming tail of the pipeline, applied via
//! `tower_http::set_header::SetResponseHeaderLayer`. Values set by an
//! upstream win for the security trio (`if_not_present`); the gateway
//! identification header always reflects this instance.

use axum::http::HeaderValue;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;

/// Apply security headers and the gateway banner to the router
pub fn apply_security_headers(app: Router, gateway_name: &str) -> Router {
    let banner = format!("{}/{}", gateway_name, env!("CARGO_PKG_VERSION"));
    let banner = HeaderValue::from_str(&banner)
        .unwrap_or_else(|_| HeaderValue::from_static("portcullis"));

    app.layer(SetResponseHeaderLayer::overriding(
        http::header::HeaderName::from_static("x-gateway"),
        banner,
    ))
    .layer(SetResponseHeaderLayer::if_not_present(
        http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    ))
    .layer(SetResponseHeaderLayer::if_not_present(
        http::header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    ))
    .layer(SetResponseHeaderLayer::if_not_present(
        http::header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    ))
}
