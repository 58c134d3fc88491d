//! Error types and HTTP response conversion
//!
//! Every error the gateway can surface to a client maps to a stable error
//! code and an HTTP status. Proxied upstream responses are never shaped by
//! this module; only gateway-generated errors carry the JSON envelope.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the gateway error
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes exposed to API consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingCredentials,
    InvalidCredentials,
    InvalidToken,
    TokenExpired,
    TokenRevoked,
    TokenVersionMismatch,
    InvalidApiKey,
    ApiKeyExpired,
    InsufficientScope,
    IpBlocked,
    IpNotAllowed,
    ApiDisabled,
    RouteNotFound,
    RateLimitExceeded,
    RateLimiterError,
    UpstreamError,
    UpstreamTimeout,
    ValidationError,
    Conflict,
    InternalError,
}

impl ErrorCode {
    /// Wire representation of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "MISSING_CREDENTIALS",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::TokenVersionMismatch => "TOKEN_VERSION_MISMATCH",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::ApiKeyExpired => "API_KEY_EXPIRED",
            Self::InsufficientScope => "INSUFFICIENT_SCOPE",
            Self::IpBlocked => "IP_BLOCKED",
            Self::IpNotAllowed => "IP_NOT_ALLOWED",
            Self::ApiDisabled => "API_DISABLED",
            Self::RouteNotFound => "ROUTE_NOT_FOUND",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::RateLimiterError => "RATE_LIMITER_ERROR",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Conflict => "CONFLICT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details attached to a rate-limit rejection
///
/// Carried on the error itself so the 429 response can set `Retry-After`
/// and the `X-RateLimit-*` headers without a second pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRejection {
    /// Strategy that denied the request (wire name, e.g. "token_bucket")
    pub strategy: &'static str,
    /// Policy capacity
    pub limit: u64,
    /// Requests remaining in the current window/bucket
    pub remaining: u64,
    /// Suggested wait before retrying
    pub retry_after: Duration,
    /// Wall-clock time the limit resets
    pub reset_at: DateTime<Utc>,
}

/// Main error type for the gateway
///
/// Large foreign error variants are boxed to keep the enum small.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Database error
    #[error("Database error: {0}")]
    Database(Box<sqlx::Error>),

    /// Redis protocol error
    #[error("Cache error: {0}")]
    Cache(Box<redis::RedisError>),

    /// Redis pool error (connection acquisition)
    #[error("Cache pool error: {0}")]
    CachePool(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No credentials on a protected request
    #[error("Missing credentials")]
    MissingCredentials,

    /// Login with a wrong email/password pair
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Bearer token failed signature or structural validation
    #[error("Invalid token")]
    InvalidToken,

    /// Bearer token past its expiry
    #[error("Token expired")]
    TokenExpired,

    /// Token nonce is on the blacklist
    #[error("Token revoked")]
    TokenRevoked,

    /// Token was issued before a mass revocation
    #[error("Token version mismatch")]
    TokenVersionMismatch,

    /// API key unknown, malformed, or not active
    #[error("Invalid API key")]
    InvalidApiKey,

    /// API key past its expiry
    #[error("API key expired")]
    ApiKeyExpired,

    /// API key lacks the scope the route requires
    #[error("Insufficient scope: {required}")]
    InsufficientScope {
        /// Scope the route required
        required: String,
    },

    /// Client IP has an active block rule
    #[error("IP address blocked")]
    IpBlocked,

    /// Allowlist mode is active and the client IP is not on it
    #[error("IP address not on allowlist")]
    IpNotAllowed,

    /// Matched route exists but is disabled
    #[error("API disabled: {0}")]
    ApiDisabled(String),

    /// No enabled route matches the request
    #[error("No route matches {method} {path}")]
    RouteNotFound {
        /// Request method
        method: String,
        /// Request path
        path: String,
    },

    /// Rate limit denied the request
    #[error("Rate limit exceeded")]
    RateLimitExceeded(RateLimitRejection),

    /// Shared cache unreachable under a fail-closed policy
    #[error("Rate limiter unavailable: {0}")]
    RateLimiterUnavailable(String),

    /// Upstream connection failure, 5xx after retries, or open circuit
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream exceeded the per-attempt timeout
    #[error("Upstream timeout after {0:?}")]
    UpstreamTimeout(Duration),

    /// Request payload failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource conflict (duplicate email, duplicate key digest)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingCredentials => ErrorCode::MissingCredentials,
            Self::InvalidCredentials => ErrorCode::InvalidCredentials,
            Self::InvalidToken => ErrorCode::InvalidToken,
            Self::TokenExpired => ErrorCode::TokenExpired,
            Self::TokenRevoked => ErrorCode::TokenRevoked,
            Self::TokenVersionMismatch => ErrorCode::TokenVersionMismatch,
            Self::InvalidApiKey => ErrorCode::InvalidApiKey,
            Self::ApiKeyExpired => ErrorCode::ApiKeyExpired,
            Self::InsufficientScope { .. } => ErrorCode::InsufficientScope,
            Self::IpBlocked => ErrorCode::IpBlocked,
            Self::IpNotAllowed => ErrorCode::IpNotAllowed,
            Self::ApiDisabled(_) => ErrorCode::ApiDisabled,
            Self::RouteNotFound { .. } => ErrorCode::RouteNotFound,
            Self::RateLimitExceeded(_) => ErrorCode::RateLimitExceeded,
            Self::RateLimiterUnavailable(_) => ErrorCode::RateLimiterError,
            Self::Upstream(_) => ErrorCode::UpstreamError,
            Self::UpstreamTimeout(_) => ErrorCode::UpstreamTimeout,
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Conflict(_) => ErrorCode::Conflict,
            _ => ErrorCode::InternalError,
        }
    }

    /// HTTP status this error maps to
    pub fn status(&self) -> StatusCode {
        match self.code() {
            ErrorCode::MissingCredentials
            | ErrorCode::InvalidCredentials
            | ErrorCode::InvalidToken
            | ErrorCode::TokenExpired
            | ErrorCode::TokenRevoked
            | ErrorCode::TokenVersionMismatch
            | ErrorCode::InvalidApiKey
            | ErrorCode::ApiKeyExpired => StatusCode::UNAUTHORIZED,
            ErrorCode::InsufficientScope
            | ErrorCode::IpBlocked
            | ErrorCode::IpNotAllowed
            | ErrorCode::ApiDisabled => StatusCode::FORBIDDEN,
            ErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::RateLimiterError => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message
    ///
    /// Internal variants are redacted; the full error is logged server-side.
    pub fn client_message(&self) -> String {
        match self {
            Self::Config(_) | Self::Database(_) | Self::Cache(_) | Self::CachePool(_)
            | Self::Io(_) | Self::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

/// JSON error envelope body: `{"success": false, "error": {...}}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always `false` for error responses
    pub success: bool,

    /// Error payload
    pub error: ErrorBody,
}

/// Inner error payload of the envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Optional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorEnvelope {
    /// Build an envelope from a code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                code,
                message: message.into(),
                details: None,
            },
        }
    }

    /// Attach structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        // Internal failures carry the full chain in the log, never the body
        if status.is_server_error() {
            tracing::error!(code = %code, error = %self, "gateway error");
        } else {
            tracing::debug!(code = %code, error = %self, "request rejected");
        }

        let mut envelope = ErrorEnvelope::new(code, self.client_message());

        let mut extra_headers: Vec<(header::HeaderName, HeaderValue)> = Vec::new();

        match &self {
            Error::RateLimitExceeded(r) => {
                envelope = envelope.with_details(serde_json::json!({
                    "strategy": r.strategy,
                    "limit": r.limit,
                    "remaining": r.remaining,
                    "retry_after_ms": r.retry_after.as_millis() as u64,
                }));

                let retry_secs = r.retry_after.as_secs_f64().ceil().max(0.0) as u64;
                if let Ok(v) = HeaderValue::from_str(&retry_secs.to_string()) {
                    extra_headers.push((header::RETRY_AFTER, v));
                }
                push_rate_limit_headers(
                    &mut extra_headers,
                    r.limit,
                    r.remaining,
                    r.reset_at.timestamp(),
                );
            }
            Error::InsufficientScope { required } => {
                envelope = envelope
                    .with_details(serde_json::json!({ "required_scope": required }));
            }
            Error::RouteNotFound { method, path } => {
                envelope = envelope
                    .with_details(serde_json::json!({ "method": method, "path": path }));
            }
            _ => {}
        }

        let mut response = (status, Json(envelope)).into_response();
        for (name, value) in extra_headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}

/// Append the `X-RateLimit-*` trio to a header list
pub(crate) fn push_rate_limit_headers(
    headers: &mut Vec<(header::HeaderName, HeaderValue)>,
    limit: u64,
    remaining: u64,
    reset_epoch_secs: i64,
) {
    let entries = [
        ("x-ratelimit-limit", limit.to_string()),
        ("x-ratelimit-remaining", remaining.to_string()),
        ("x-ratelimit-reset", reset_epoch_secs.to_string()),
    ];
    for (name, value) in entries {
        if let (Ok(n), Ok(v)) = (
            header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.push((n, v));
        }
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(Box::new(err))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Cache(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_status_mapping() {
        assert_eq!(Error::MissingCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::TokenExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::TokenRevoked.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::TokenVersionMismatch.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::InvalidApiKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::IpBlocked.status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::IpNotAllowed.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::ApiDisabled("billing".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::RouteNotFound {
                method: "GET".into(),
                path: "/nope".into()
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::RateLimiterUnavailable("redis down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Upstream("connect refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::UpstreamTimeout(Duration::from_secs(30)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_messages_redacted() {
        let err = Error::Internal("connection string leaked".into());
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = Error::InvalidApiKey;
        assert_eq!(err.client_message(), "Invalid API key");
    }

    #[test]
    fn test_error_code_wire_format() {
        assert_eq!(ErrorCode::TokenVersionMismatch.as_str(), "TOKEN_VERSION_MISMATCH");
        assert_eq!(ErrorCode::RateLimitExceeded.as_str(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(
            serde_json::to_string(&ErrorCode::IpBlocked).unwrap(),
            "\"IP_BLOCKED\""
        );
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = ErrorEnvelope::new(ErrorCode::InvalidToken, "Invalid token");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["success"], serde_json::json!(false));
        assert_eq!(json["error"]["code"], "INVALID_TOKEN");
        assert!(json["error"].get("details").is_none());
    }

    #[test]
    fn test_rate_limit_rejection_details() {
        let rejection = RateLimitRejection {
            strategy: "token_bucket",
            limit: 100,
            remaining: 0,
            retry_after: Duration::from_millis(1500),
            reset_at: Utc::now(),
        };
        let response = Error::RateLimitExceeded(rejection).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        // Retry-After rounds up to whole seconds
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "2"
        );
        assert!(response.headers().contains_key("x-ratelimit-limit"));
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            "0"
        );
    }
}
