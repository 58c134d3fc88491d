//! Token revocation state in the shared cache
//!
//! Two keyspaces:
//! - `blacklist:<jti>` — individually revoked nonces, TTL = remaining token
//!   lifetime. Written with SET NX so concurrent refresh attempts on the
//!   same token produce exactly one winner.
//! - `refresh:<user>:<jti>` — outstanding refresh tokens. A refresh token
//!   that is not tracked here is treated as revoked.

use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Revocation and refresh-token tracking over Redis
#[derive(Clone)]
pub struct TokenStore {
    pool: Pool,
}

impl TokenStore {
    /// Create a store over the shared pool
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn blacklist_key(jti: &str) -> String {
        format!("blacklist:{jti}")
    }

    fn refresh_key(user_id: Uuid, jti: &str) -> String {
        format!("refresh:{user_id}:{jti}")
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::CachePool(e.to_string()))
    }

    /// Check whether a nonce is on the blacklist
    pub async fn is_blacklisted(&self, jti: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(Self::blacklist_key(jti)).await?;
        Ok(exists)
    }

    /// Blacklist a nonce for `ttl`
    ///
    /// Returns `true` when this call created the entry, `false` when the
    /// nonce was already blacklisted (SET NX).
    pub async fn blacklist(&self, jti: &str, ttl: Duration) -> Result<bool> {
        // A token at the edge of expiry still needs a nonzero TTL
        let ttl_secs = ttl.as_secs().max(1);

        let mut conn = self.conn().await?;
        let set: bool = redis::cmd("SET")
            .arg(Self::blacklist_key(jti))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;

        Ok(set)
    }

    /// Record an outstanding refresh token
    pub async fn track_refresh(&self, user_id: Uuid, jti: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(Self::refresh_key(user_id, jti), 1, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    /// Check whether a refresh token is still outstanding
    pub async fn refresh_tracked(&self, user_id: Uuid, jti: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(Self::refresh_key(user_id, jti)).await?;
        Ok(exists)
    }

    /// Drop a refresh token from tracking (after rotation or logout)
    pub async fn untrack_refresh(&self, user_id: Uuid, jti: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(Self::refresh_key(user_id, jti)).await?;
        Ok(())
    }
}
