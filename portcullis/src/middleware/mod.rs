//! Pipeline middleware stages
//!
//! The request pipeline is an ordered chain; each stage either annotates the
//! per-request context and hands off, or short-circuits with a terminal
//! response:
//!
//! 1. [`context`] — request id, client IP, start time
//! 2. [`logger`] — one structured event per request with status and latency
//! 3. [`ip_filter`] — active block list / allowlist enforcement
//! 4. [`authn`] — bearer token or API key resolution
//! 5. [`rate_limit`] — route resolution, policy selection, strategy check
//! 6. [`metrics`] — downstream timing and counters
//!
//! Stage 7 (the proxy) is the router fallback handler in [`crate::proxy`];
//! stage 8 (response transformation) is [`security_headers`] plus the
//! response-side work of [`context`].

pub mod authn;
pub mod context;
pub mod identity;
pub mod ip_filter;
pub mod logger;
pub mod metrics;
pub mod rate_limit;
pub mod security_headers;

pub use context::RequestContext;
pub use identity::Identity;
pub use ip_filter::IpGuard;
pub use rate_limit::MatchedRoute;

/// Sensitive headers masked in trace output
pub const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie", "x-api-key"];

/// Management-surface path prefixes that bypass authentication and rate
/// limiting (IP rules still apply to everything but the health surface)
pub const BYPASS_PREFIXES: &[&str] = &["/health", "/auth/", "/admin/", "/developer/"];

/// True when the path belongs to a management surface
pub fn is_management_path(path: &str) -> bool {
    BYPASS_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_management_paths() {
        assert!(is_management_path("/health"));
        assert!(is_management_path("/health/detailed"));
        assert!(is_management_path("/auth/login"));
        assert!(is_management_path("/admin/users"));
        assert!(is_management_path("/developer/keys"));

        assert!(!is_management_path("/orders/42"));
        assert!(!is_management_path("/authenticate"));
        assert!(!is_management_path("/api/health"));
    }
}
