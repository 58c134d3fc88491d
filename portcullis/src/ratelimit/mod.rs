//! Distributed rate limiting
//!
//! Five strategies, each executed atomically in the shared cache (see
//! [`scripts`]). Counters are keyed by strategy, route, tier, and caller
//! identifier so gateway instances coordinate without talking to each other.

pub mod scripts;

mod limiter;

pub use limiter::{ConcurrencyToken, RateLimiter, Verdict};

use chrono::{DateTime, Utc};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use uuid::Uuid;

use crate::model::{Strategy, Tier};

/// The string a rate-limit counter is keyed on for a caller
///
/// Priority order: user id, then API key id, then client IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateIdentifier {
    User(Uuid),
    ApiKey(Uuid),
    Ip(IpAddr),
}

impl fmt::Display for RateIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::ApiKey(id) => write!(f, "key:{id}"),
            Self::Ip(ip) => write!(f, "ip:{ip}"),
        }
    }
}

/// The outcome of a single strategy check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    /// Policy capacity
    pub limit: u64,
    /// Requests remaining
    pub remaining: u64,
    /// Suggested wait before retrying (zero when allowed)
    pub retry_after: Duration,
    /// Wall-clock time the limit resets (bucket full / window boundary)
    pub reset_at: DateTime<Utc>,
}

/// Build the cache key for a strategy counter
///
/// Layout: `ratelimit:<strategy>:<route>:<tier>:<identifier>[:<window>]`.
pub(crate) fn state_key(
    strategy: Strategy,
    route_id: Uuid,
    tier: Tier,
    identifier: &RateIdentifier,
    window_start: Option<i64>,
) -> String {
    match window_start {
        Some(start) => format!(
            "ratelimit:{}:{}:{}:{}:{}",
            strategy.as_str(),
            route_id,
            tier.as_str(),
            identifier,
            start
        ),
        None => format!(
            "ratelimit:{}:{}:{}:{}",
            strategy.as_str(),
            route_id,
            tier.as_str(),
            identifier
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_display() {
        let id = Uuid::nil();
        assert_eq!(RateIdentifier::User(id).to_string(), format!("user:{id}"));
        assert_eq!(RateIdentifier::ApiKey(id).to_string(), format!("key:{id}"));
        assert_eq!(
            RateIdentifier::Ip("203.0.113.7".parse().unwrap()).to_string(),
            "ip:203.0.113.7"
        );
    }

    #[test]
    fn test_state_key_layout() {
        let route = Uuid::nil();
        let id = RateIdentifier::Ip("10.0.0.1".parse().unwrap());

        let key = state_key(Strategy::TokenBucket, route, Tier::Free, &id, None);
        assert_eq!(key, format!("ratelimit:token_bucket:{route}:free:ip:10.0.0.1"));

        let key = state_key(Strategy::FixedWindow, route, Tier::Pro, &id, Some(1_700_000_040));
        assert!(key.ends_with(":1700000040"));
        assert!(key.starts_with("ratelimit:fixed_window:"));
    }
}
