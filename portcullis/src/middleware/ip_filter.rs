//! IP rule enforcement
//!
//! Stage 3. The verdict for an IP is cached under `blocked_ip:<ip>` so the
//! hot path normally costs one cache read; the database is consulted only on
//! a miss. Writes that change a rule (including the manual unblock path the
//! admin surface calls) go through [`IpGuard`] so the cache stays coherent.

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::model::{AuditRecord, IpRule, RuleType};
use crate::repository::{AuditWriter, IpRuleRepository};
use crate::state::AppState;

use super::context::RequestContext;

/// Seconds a clean (not blocked) verdict may be served from the cache
const CLEAR_VERDICT_TTL: u64 = 30;

/// Fallback TTL for a blocked verdict discovered via the database
const BLOCKED_VERDICT_TTL: u64 = 60;

/// IP rule enforcement and cache-coherent rule management
pub struct IpGuard {
    pool: Pool,
    rules: IpRuleRepository,
    audit: AuditWriter,
    allowlist_enabled: bool,
}

impl IpGuard {
    /// Create a guard
    pub fn new(
        pool: Pool,
        rules: IpRuleRepository,
        audit: AuditWriter,
        allowlist_enabled: bool,
    ) -> Self {
        Self {
            pool,
            rules,
            audit,
            allowlist_enabled,
        }
    }

    fn blocked_key(ip: IpAddr) -> String {
        format!("blocked_ip:{ip}")
    }

    /// Reject the request if the IP is blocked (or, in allowlist mode, not
    /// explicitly allowed)
    ///
    /// A cache failure falls through to the database; a database failure
    /// fails open with a warning.
    pub async fn ensure_allowed(&self, ip: IpAddr) -> Result<()> {
        match self.cached_verdict(ip).await {
            Ok(Some(true)) => return Err(Error::IpBlocked),
            Ok(Some(false)) => return Ok(()),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(%ip, "blocked_ip cache read failed: {e}");
            }
        }

        let blocked = match self.rules.has_active_block(&ip.to_string()).await {
            Ok(blocked) => blocked,
            Err(e) => {
                tracing::warn!(%ip, "IP rule lookup failed, allowing: {e}");
                return Ok(());
            }
        };

        if blocked {
            self.cache_verdict(ip, true, BLOCKED_VERDICT_TTL).await;
            return Err(Error::IpBlocked);
        }

        if self.allowlist_enabled {
            let allowed = match self.rules.has_active_allow(&ip.to_string()).await {
                Ok(allowed) => allowed,
                Err(e) => {
                    tracing::warn!(%ip, "IP allowlist lookup failed, allowing: {e}");
                    return Ok(());
                }
            };
            if !allowed {
                return Err(Error::IpNotAllowed);
            }
        }

        self.cache_verdict(ip, false, CLEAR_VERDICT_TTL).await;
        Ok(())
    }

    async fn cached_verdict(&self, ip: IpAddr) -> Result<Option<bool>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::CachePool(e.to_string()))?;
        let value: Option<u8> = conn.get(Self::blocked_key(ip)).await?;
        Ok(value.map(|v| v == 1))
    }

    async fn cache_verdict(&self, ip: IpAddr, blocked: bool, ttl_secs: u64) {
        let result: Result<()> = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| Error::CachePool(e.to_string()))?;
            let _: () = conn
                .set_ex(Self::blocked_key(ip), u8::from(blocked), ttl_secs)
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(%ip, "blocked_ip cache write failed: {e}");
        }
    }

    /// Create a manual block rule and prime the cache
    ///
    /// This is the write interface the admin surface uses; the core also
    /// exposes it so operators can block without a cache round-trip race.
    pub async fn block(
        &self,
        ip: IpAddr,
        reason: Option<&str>,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<IpRule> {
        let rule = self
            .rules
            .create(&ip.to_string(), RuleType::Block, reason, false, expires_at)
            .await?;

        let ttl = expires_at
            .map(|at| (at - Utc::now()).num_seconds().max(1) as u64)
            .unwrap_or(BLOCKED_VERDICT_TTL);
        self.cache_verdict(ip, true, ttl).await;

        self.audit
            .append(
                AuditRecord::new("security.ip.blocked")
                    .from_ip(ip.to_string())
                    .on_resource("ip_rule", rule.id.to_string())
                    .with_changes(serde_json::json!({
                        "rule_type": "block",
                        "reason": reason,
                        "expires_at": expires_at,
                    })),
            )
            .await?;

        Ok(rule)
    }

    /// Remove all block rules for an IP and drop the cached verdict
    pub async fn unblock(&self, ip: IpAddr) -> Result<u64> {
        let removed = self
            .rules
            .delete_for_ip(&ip.to_string(), RuleType::Block)
            .await?;

        // Drop the verdict outright; the next request re-reads the rules
        let result: Result<()> = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| Error::CachePool(e.to_string()))?;
            let _: () = conn.del(Self::blocked_key(ip)).await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(%ip, "blocked_ip cache clear failed: {e}");
        }

        if removed > 0 {
            self.audit
                .append(
                    AuditRecord::new("security.ip.unblocked")
                        .from_ip(ip.to_string())
                        .with_metadata(serde_json::json!({ "rules_removed": removed })),
                )
                .await?;
        }

        Ok(removed)
    }
}

/// Pipeline stage 3
///
/// Applies to every path except the health surface, which must stay
/// reachable for load balancers.
pub async fn middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response> {
    if request.uri().path().starts_with("/health") {
        return Ok(next.run(request).await);
    }

    let client_ip = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.client_ip)
        .ok_or_else(|| Error::Internal("request context missing in IP filter".to_string()))?;

    state.ip_guard().ensure_allowed(client_ip).await?;

    Ok(next.run(request).await)
}
