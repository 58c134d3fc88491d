//! Redis connection pool management
//!
//! The shared cache is the single source of truth for all cross-instance
//! state: rate counters, circuit state, IP block cache, token blacklist.

use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
use std::time::Duration;

use crate::{config::RedisConfig, error::Result};

/// Create a Redis connection pool with retry logic
///
/// Retries with exponential backoff based on the configuration; the gateway
/// cannot start without its coordination store.
pub(crate) async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Redis connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Redis connection pool created: max_connections={}",
                        config.max_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::error!(
                        "Failed to connect to Redis after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay_multiplier = 2_u32.pow(attempt.saturating_sub(1));
                let delay = base_delay * delay_multiplier;

                tracing::warn!(
                    "Redis connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Attempt to create a Redis pool (single try)
async fn try_create_pool(config: &RedisConfig) -> Result<Pool> {
    let cfg = DeadpoolConfig::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| crate::error::Error::CachePool(format!("Failed to build Redis pool: {e}")))?
        .max_size(config.max_connections)
        .wait_timeout(Some(Duration::from_secs(config.connection_timeout_secs)))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| crate::error::Error::CachePool(format!("Failed to create Redis pool: {e}")))?;

    // Test the connection
    let conn = pool
        .get()
        .await
        .map_err(|e| crate::error::Error::CachePool(format!("Failed to get Redis connection: {e}")))?;
    drop(conn);

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use crate::config::RedisConfig;

    #[test]
    fn test_redis_config() {
        let config = RedisConfig {
            url: "redis://localhost:6379".to_string(),
            max_connections: 50,
            connection_timeout_secs: 10,
            max_retries: 5,
            retry_delay_secs: 2,
        };

        assert_eq!(config.max_connections, 50);
        assert_eq!(config.max_retries, 5);
    }
}
