//! Rate-limit policies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::Tier;

/// Rate-limiting strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingWindow,
    Concurrency,
}

impl Strategy {
    /// Wire/storage representation, also used in cache keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::LeakyBucket => "leaky_bucket",
            Self::FixedWindow => "fixed_window",
            Self::SlidingWindow => "sliding_window",
            Self::Concurrency => "concurrency",
        }
    }

    /// Bucket strategies carry a real-valued count updated by elapsed time
    pub fn is_bucket(&self) -> bool {
        matches!(self, Self::TokenBucket | Self::LeakyBucket)
    }

    /// Window strategies carry an integer count keyed by a time bucket
    pub fn is_window(&self) -> bool {
        matches!(self, Self::FixedWindow | Self::SlidingWindow)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Strategy {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        match value.as_str() {
            "token_bucket" => Ok(Self::TokenBucket),
            "leaky_bucket" => Ok(Self::LeakyBucket),
            "fixed_window" => Ok(Self::FixedWindow),
            "sliding_window" => Ok(Self::SlidingWindow),
            "concurrency" => Ok(Self::Concurrency),
            other => Err(Error::Validation(format!("unknown strategy: {other}"))),
        }
    }
}

/// Behavior when the shared cache cannot answer a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Allow the request and log
    Open,
    /// Reject with a 503-class error
    Closed,
}

impl FailureMode {
    /// Wire/storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for FailureMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        match value.as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(Error::Validation(format!("unknown failure mode: {other}"))),
        }
    }
}

/// A rate-limit policy attached to a route
///
/// `tier = None` is the default policy for all tiers; a tier-specific policy
/// overrides it. `(api_definition_id, tier)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RateLimitPolicy {
    pub id: Uuid,

    pub api_definition_id: Uuid,

    /// None applies the policy to every tier without a specific one
    pub tier: Option<String>,

    #[sqlx(try_from = "String")]
    pub strategy: Strategy,

    pub capacity: i64,

    /// Tokens (or leaks) per second; required for bucket strategies
    pub refill_rate: Option<f64>,

    /// Window length; required for window strategies
    pub window_seconds: Option<i64>,

    #[sqlx(try_from = "String")]
    pub failure_mode: FailureMode,

    pub created_at: DateTime<Utc>,
}

impl RateLimitPolicy {
    /// Parsed tier, if the policy is tier-specific
    pub fn tier(&self) -> Option<Tier> {
        self.tier
            .as_ref()
            .and_then(|t| Tier::try_from(t.clone()).ok())
    }

    /// Validate strategy-specific parameters; enforced at write time
    pub fn validate(&self) -> Result<()> {
        if self.capacity <= 0 {
            return Err(Error::Validation("capacity must be positive".to_string()));
        }
        if self.strategy.is_bucket() {
            match self.refill_rate {
                Some(rate) if rate >= 0.0 => {}
                Some(_) => {
                    return Err(Error::Validation(
                        "refill_rate must not be negative".to_string(),
                    ))
                }
                None => {
                    return Err(Error::Validation(format!(
                        "{} requires refill_rate",
                        self.strategy
                    )))
                }
            }
        }
        if self.strategy.is_window() {
            match self.window_seconds {
                Some(secs) if secs > 0 => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "{} requires a positive window_seconds",
                        self.strategy
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: Strategy) -> RateLimitPolicy {
        RateLimitPolicy {
            id: Uuid::new_v4(),
            api_definition_id: Uuid::new_v4(),
            tier: None,
            strategy,
            capacity: 100,
            refill_rate: Some(10.0),
            window_seconds: Some(60),
            failure_mode: FailureMode::Open,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_strategy_families() {
        assert!(Strategy::TokenBucket.is_bucket());
        assert!(Strategy::LeakyBucket.is_bucket());
        assert!(Strategy::FixedWindow.is_window());
        assert!(Strategy::SlidingWindow.is_window());
        assert!(!Strategy::Concurrency.is_bucket());
        assert!(!Strategy::Concurrency.is_window());
    }

    #[test]
    fn test_bucket_requires_refill_rate() {
        let mut p = policy(Strategy::TokenBucket);
        assert!(p.validate().is_ok());
        p.refill_rate = None;
        assert!(p.validate().is_err());
        // A paused bucket (refill 0) is a legal configuration
        p.refill_rate = Some(0.0);
        assert!(p.validate().is_ok());
        p.refill_rate = Some(-1.0);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_window_requires_window_seconds() {
        let mut p = policy(Strategy::SlidingWindow);
        assert!(p.validate().is_ok());
        p.window_seconds = None;
        assert!(p.validate().is_err());
        p.window_seconds = Some(0);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_concurrency_needs_only_capacity() {
        let mut p = policy(Strategy::Concurrency);
        p.refill_rate = None;
        p.window_seconds = None;
        assert!(p.validate().is_ok());
        p.capacity = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_tier_parsing() {
        let mut p = policy(Strategy::FixedWindow);
        assert_eq!(p.tier(), None);
        p.tier = Some("pro".to_string());
        assert_eq!(p.tier(), Some(Tier::Pro));
    }
}
