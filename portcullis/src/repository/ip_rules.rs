//! IP rule repository

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{IpRule, RuleType};

/// Repository for IP allow/block rules
#[derive(Clone)]
pub struct IpRuleRepository {
    pool: PgPool,
}

impl IpRuleRepository {
    /// Create a repository over the shared pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a rule
    pub async fn create(
        &self,
        ip_address: &str,
        rule_type: RuleType,
        reason: Option<&str>,
        auto_blocked: bool,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IpRule> {
        let rule = sqlx::query_as::<_, IpRule>(
            r#"
            INSERT INTO ip_rules (id, ip_address, rule_type, reason, auto_blocked, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            RETURNING id, ip_address, rule_type, reason, auto_blocked, expires_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(ip_address)
        .bind(rule_type.as_str())
        .bind(reason)
        .bind(auto_blocked)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(rule)
    }

    /// True when any active block rule exists for the IP
    pub async fn has_active_block(&self, ip_address: &str) -> Result<bool> {
        self.has_active(ip_address, RuleType::Block).await
    }

    /// True when any active allow rule exists for the IP
    pub async fn has_active_allow(&self, ip_address: &str) -> Result<bool> {
        self.has_active(ip_address, RuleType::Allow).await
    }

    async fn has_active(&self, ip_address: &str, rule_type: RuleType) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ip_rules
                WHERE ip_address = $1
                  AND rule_type = $2
                  AND (expires_at IS NULL OR expires_at > NOW())
            )
            "#,
        )
        .bind(ip_address)
        .bind(rule_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Delete every rule of the given type for an IP (manual unblock path)
    ///
    /// Returns the number of rules removed.
    pub async fn delete_for_ip(&self, ip_address: &str, rule_type: RuleType) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ip_rules WHERE ip_address = $1 AND rule_type = $2")
            .bind(ip_address)
            .bind(rule_type.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// All currently active rules
    pub async fn list_active(&self) -> Result<Vec<IpRule>> {
        let rules = sqlx::query_as::<_, IpRule>(
            r#"
            SELECT id, ip_address, rule_type, reason, auto_blocked, expires_at, created_at
            FROM ip_rules
            WHERE expires_at IS NULL OR expires_at > NOW()
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }
}
