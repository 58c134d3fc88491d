//! API key repository
//!
//! Keys are addressed by digest; the plaintext never reaches this layer
//! except transiently inside [`create`](ApiKeyRepository::create)'s caller.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{ApiKey, KeyStatus};

/// Repository for API keys
#[derive(Clone)]
pub struct ApiKeyRepository {
    pool: PgPool,
}

impl ApiKeyRepository {
    /// Create a repository over the shared pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a new key record
    pub async fn create(
        &self,
        user_id: Uuid,
        key_digest: &str,
        prefix: &str,
        display_name: &str,
        scopes: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey> {
        let key = sqlx::query_as::<_, ApiKey>(
            r#"
            INSERT INTO api_keys
                (id, user_id, key_digest, prefix, display_name, scopes, status, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, NOW())
            RETURNING id, user_id, key_digest, prefix, display_name, scopes, status,
                      expires_at, last_used_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(key_digest)
        .bind(prefix)
        .bind(display_name)
        .bind(scopes)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict("key digest collision".to_string())
            }
            _ => Error::from(e),
        })?;

        Ok(key)
    }

    /// Look up a key by its digest
    pub async fn find_by_digest(&self, digest: &str) -> Result<Option<ApiKey>> {
        let key = sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT id, user_id, key_digest, prefix, display_name, scopes, status,
                   expires_at, last_used_at, created_at
            FROM api_keys
            WHERE key_digest = $1
            "#,
        )
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }

    /// Update `last_used_at`; best-effort, callers fire-and-forget
    pub async fn touch_last_used(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Set the key status (revoke / deprecate)
    pub async fn set_status(&self, id: Uuid, status: KeyStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE api_keys SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List a user's keys
    pub async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<ApiKey>> {
        let keys = sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT id, user_id, key_digest, prefix, display_name, scopes, status,
                   expires_at, last_used_at, created_at
            FROM api_keys
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }
}
