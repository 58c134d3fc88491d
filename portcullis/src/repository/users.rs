//! User repository

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Role, Tier, User};

/// Repository for user accounts
#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    /// Create a repository over the shared pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a user; email is stored lowercased
    ///
    /// Returns [`Error::Conflict`] when the email is already registered.
    pub async fn create(
        &self,
        email: &str,
        password_digest: &str,
        role: Role,
        tier: Tier,
    ) -> Result<User> {
        let email = email.trim().to_lowercase();

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, password_digest, role, tier, token_version, created_at)
            VALUES ($1, $2, $3, $4, $5, 1, NOW())
            RETURNING id, email, password_digest, role, tier, token_version, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&email)
        .bind(password_digest)
        .bind(role.as_str())
        .bind(tier.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(format!("email already registered: {email}"))
            }
            _ => Error::from(e),
        })?;

        Ok(user)
    }

    /// Look up a user by id
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_digest, role, tier, token_version, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Look up a user by email (case-insensitive)
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_digest, role, tier, token_version, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Increment `token_version`, invalidating every outstanding token
    ///
    /// Returns the new version.
    pub async fn bump_token_version(&self, id: Uuid) -> Result<i32> {
        let version: i32 = sqlx::query_scalar(
            r#"
            UPDATE users
            SET token_version = token_version + 1
            WHERE id = $1
            RETURNING token_version
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(version)
    }

    /// Replace the password digest and bump `token_version` in one statement
    pub async fn update_password(&self, id: Uuid, password_digest: &str) -> Result<i32> {
        let version: i32 = sqlx::query_scalar(
            r#"
            UPDATE users
            SET password_digest = $2, token_version = token_version + 1
            WHERE id = $1
            RETURNING token_version
            "#,
        )
        .bind(id)
        .bind(password_digest)
        .fetch_one(&self.pool)
        .await?;

        Ok(version)
    }
}
