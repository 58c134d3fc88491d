//! Abuse auto-blocking
//!
//! Authentication and rate-limit rejections feed violation counters keyed by
//! `(kind, ip)` in the shared cache. When a counter crosses its threshold
//! inside the observation window, a temporary block rule is written to the
//! database, the `blocked_ip` cache entry is primed, and a security audit
//! event is recorded. Loopback addresses and allow-listed IPs are exempt.

use deadpool_redis::Pool;
use redis::{AsyncCommands, Script};
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::model::{AuditRecord, RuleType};
use crate::repository::{AuditWriter, IpRuleRepository};

/// Increment a violation counter, starting its observation window on the
/// first hit only so the window slides per burst rather than per request.
///
/// KEYS\[1\] = violation counter
/// ARGV\[1\] = observation window in seconds
///
/// Returns the count after increment.
const VIOLATION_INCR: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
";

static VIOLATION_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(VIOLATION_INCR));

/// Kinds of observed abuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    InvalidApiKey,
    InvalidToken,
    RateLimitAbuse,
    AuthFailure,
}

impl ViolationKind {
    /// All kinds, for counter clearing
    pub const ALL: [ViolationKind; 4] = [
        Self::InvalidApiKey,
        Self::InvalidToken,
        Self::RateLimitAbuse,
        Self::AuthFailure,
    ];

    /// Wire/cache-key representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidApiKey => "invalid_api_key",
            Self::InvalidToken => "invalid_token",
            Self::RateLimitAbuse => "rate_limit_abuse",
            Self::AuthFailure => "auth_failure",
        }
    }

    /// Violations tolerated inside the observation window
    pub fn threshold(&self) -> u64 {
        match self {
            Self::InvalidApiKey => 10,
            Self::InvalidToken => 20,
            Self::RateLimitAbuse => 50,
            Self::AuthFailure => 30,
        }
    }

    /// Observation window
    pub fn window(&self) -> Duration {
        match self {
            Self::InvalidApiKey | Self::InvalidToken => Duration::from_secs(60),
            Self::RateLimitAbuse | Self::AuthFailure => Duration::from_secs(300),
        }
    }

    /// How long the resulting block lasts
    pub fn block_duration(&self) -> Duration {
        match self {
            Self::InvalidApiKey | Self::InvalidToken => Duration::from_secs(3600),
            Self::RateLimitAbuse => Duration::from_secs(1800),
            Self::AuthFailure => Duration::from_secs(7200),
        }
    }

    /// The violation an error feeds, if any
    ///
    /// Expired credentials are benign: a legitimate client with a stale
    /// token looks exactly like this, so expiry never counts as abuse.
    pub fn for_error(error: &Error) -> Option<Self> {
        match error {
            Error::InvalidApiKey => Some(Self::InvalidApiKey),
            Error::InvalidToken | Error::TokenRevoked | Error::TokenVersionMismatch => {
                Some(Self::InvalidToken)
            }
            Error::MissingCredentials | Error::InvalidCredentials => Some(Self::AuthFailure),
            Error::RateLimitExceeded(_) => Some(Self::RateLimitAbuse),
            _ => None,
        }
    }
}

/// Converts observed abuse into temporary IP block rules
pub struct AutoBlocker {
    pool: Pool,
    ip_rules: IpRuleRepository,
    audit: AuditWriter,
    enabled: bool,
}

impl AutoBlocker {
    /// Create an auto-blocker
    pub fn new(pool: Pool, ip_rules: IpRuleRepository, audit: AuditWriter, enabled: bool) -> Self {
        Self {
            pool,
            ip_rules,
            audit,
            enabled,
        }
    }

    fn violation_key(kind: ViolationKind, ip: IpAddr) -> String {
        format!("violations:{}:{}", kind.as_str(), ip)
    }

    fn blocked_key(ip: IpAddr) -> String {
        format!("blocked_ip:{ip}")
    }

    /// Record one violation; creates a block rule when the threshold is met
    pub async fn record(&self, kind: ViolationKind, ip: IpAddr) -> Result<()> {
        if !self.enabled || ip.is_loopback() {
            return Ok(());
        }
        if self.ip_rules.has_active_allow(&ip.to_string()).await? {
            return Ok(());
        }

        let key = Self::violation_key(kind, ip);
        let mut conn = self.conn().await?;
        let count: u64 = VIOLATION_SCRIPT
            .key(&key)
            .arg(kind.window().as_secs())
            .invoke_async(&mut conn)
            .await?;

        tracing::debug!(kind = kind.as_str(), %ip, count, "violation recorded");

        if count >= kind.threshold() {
            self.block(kind, ip, count).await?;
            let _: () = conn.del(&key).await?;
        }

        Ok(())
    }

    /// Create the temporary block rule and its audit trail
    async fn block(&self, kind: ViolationKind, ip: IpAddr, count: u64) -> Result<()> {
        let duration = kind.block_duration();
        let expires_at = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        let reason = format!(
            "auto-blocked: {} x{} within {}s",
            kind.as_str(),
            count,
            kind.window().as_secs()
        );

        let rule = self
            .ip_rules
            .create(
                &ip.to_string(),
                RuleType::Block,
                Some(&reason),
                true,
                Some(expires_at),
            )
            .await?;

        // Prime the block cache so enforcement does not wait on a DB read
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(Self::blocked_key(ip), 1, duration.as_secs().max(1))
            .await?;

        tracing::warn!(%ip, kind = kind.as_str(), count, "IP auto-blocked");

        self.audit
            .append(
                AuditRecord::new("security.ip.auto_blocked")
                    .from_ip(ip.to_string())
                    .on_resource("ip_rule", rule.id.to_string())
                    .with_changes(serde_json::json!({
                        "rule_type": "block",
                        "auto_blocked": true,
                        "expires_at": expires_at,
                    }))
                    .with_metadata(serde_json::json!({
                        "violation_kind": kind.as_str(),
                        "violation_count": count,
                        "threshold": kind.threshold(),
                        "window_secs": kind.window().as_secs(),
                    })),
            )
            .await?;

        Ok(())
    }

    /// Clear every violation counter for an IP (called on successful auth)
    pub async fn clear(&self, ip: IpAddr) -> Result<()> {
        let keys: Vec<String> = ViolationKind::ALL
            .iter()
            .map(|kind| Self::violation_key(*kind, ip))
            .collect();

        let mut conn = self.conn().await?;
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::CachePool(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateLimitRejection;

    #[test]
    fn test_violation_parameters() {
        assert_eq!(ViolationKind::InvalidApiKey.threshold(), 10);
        assert_eq!(ViolationKind::InvalidApiKey.window().as_secs(), 60);
        assert_eq!(ViolationKind::InvalidApiKey.block_duration().as_secs(), 3600);

        assert_eq!(ViolationKind::InvalidToken.threshold(), 20);
        assert_eq!(ViolationKind::InvalidToken.window().as_secs(), 60);
        assert_eq!(ViolationKind::InvalidToken.block_duration().as_secs(), 3600);

        assert_eq!(ViolationKind::RateLimitAbuse.threshold(), 50);
        assert_eq!(ViolationKind::RateLimitAbuse.window().as_secs(), 300);
        assert_eq!(ViolationKind::RateLimitAbuse.block_duration().as_secs(), 1800);

        assert_eq!(ViolationKind::AuthFailure.threshold(), 30);
        assert_eq!(ViolationKind::AuthFailure.window().as_secs(), 300);
        assert_eq!(ViolationKind::AuthFailure.block_duration().as_secs(), 7200);
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            ViolationKind::for_error(&Error::InvalidApiKey),
            Some(ViolationKind::InvalidApiKey)
        );
        assert_eq!(
            ViolationKind::for_error(&Error::InvalidToken),
            Some(ViolationKind::InvalidToken)
        );
        assert_eq!(
            ViolationKind::for_error(&Error::TokenRevoked),
            Some(ViolationKind::InvalidToken)
        );
        assert_eq!(
            ViolationKind::for_error(&Error::TokenVersionMismatch),
            Some(ViolationKind::InvalidToken)
        );
        assert_eq!(
            ViolationKind::for_error(&Error::MissingCredentials),
            Some(ViolationKind::AuthFailure)
        );
        let rejection = RateLimitRejection {
            strategy: "fixed_window",
            limit: 10,
            remaining: 0,
            retry_after: Duration::from_secs(1),
            reset_at: Utc::now(),
        };
        assert_eq!(
            ViolationKind::for_error(&Error::RateLimitExceeded(rejection)),
            Some(ViolationKind::RateLimitAbuse)
        );
    }

    #[test]
    fn test_expired_credentials_are_benign() {
        assert_eq!(ViolationKind::for_error(&Error::TokenExpired), None);
        assert_eq!(ViolationKind::for_error(&Error::ApiKeyExpired), None);
        assert_eq!(ViolationKind::for_error(&Error::IpBlocked), None);
    }

    #[test]
    fn test_key_formats() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(
            AutoBlocker::violation_key(ViolationKind::InvalidApiKey, ip),
            "violations:invalid_api_key:203.0.113.7"
        );
        assert_eq!(AutoBlocker::blocked_key(ip), "blocked_ip:203.0.113.7");
    }
}
