//! Strategy execution against the shared cache

use chrono::Utc;
use deadpool_redis::Pool;
use redis::Script;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::model::{FailureMode, RateLimitPolicy, Strategy, Tier};

use super::{scripts, state_key, RateIdentifier, RateLimitDecision};

static TOKEN_BUCKET: LazyLock<Script> = LazyLock::new(|| Script::new(scripts::TOKEN_BUCKET));
static LEAKY_BUCKET: LazyLock<Script> = LazyLock::new(|| Script::new(scripts::LEAKY_BUCKET));
static FIXED_WINDOW: LazyLock<Script> = LazyLock::new(|| Script::new(scripts::FIXED_WINDOW));
static SLIDING_WINDOW: LazyLock<Script> = LazyLock::new(|| Script::new(scripts::SLIDING_WINDOW));
static CONCURRENCY_ACQUIRE: LazyLock<Script> =
    LazyLock::new(|| Script::new(scripts::CONCURRENCY_ACQUIRE));
static CONCURRENCY_RELEASE: LazyLock<Script> =
    LazyLock::new(|| Script::new(scripts::CONCURRENCY_RELEASE));

/// Verdict of a policy check
pub enum Verdict {
    /// Request admitted; concurrency admissions carry a release token
    Allowed {
        decision: RateLimitDecision,
        token: Option<ConcurrencyToken>,
    },
    /// Request denied
    Denied(RateLimitDecision),
    /// The cache could not answer and the policy fails open
    Unavailable,
}

/// Executes rate-limit strategies atomically in the shared cache
pub struct RateLimiter {
    pool: Pool,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a limiter over the shared pool
    pub fn new(pool: Pool, config: RateLimitConfig) -> Self {
        Self { pool, config }
    }

    /// Run a policy's strategy for the caller
    ///
    /// Cache failures (including the hard per-operation timeout) resolve per
    /// the policy's failure mode: open allows without headers, closed maps
    /// to a 503-class error.
    pub async fn check(
        &self,
        policy: &RateLimitPolicy,
        route_id: Uuid,
        tier: Tier,
        identifier: &RateIdentifier,
    ) -> Result<Verdict> {
        let op = self.run_strategy(policy, route_id, tier, identifier);
        let outcome = match tokio::time::timeout(self.config.op_timeout(), op).await {
            Ok(Ok(verdict)) => return Ok(verdict),
            Ok(Err(e)) => e,
            Err(_) => Error::CachePool(format!(
                "rate limit check exceeded {}s",
                self.config.op_timeout_secs
            )),
        };

        match policy.failure_mode {
            FailureMode::Open => {
                tracing::warn!(
                    strategy = %policy.strategy,
                    route_id = %route_id,
                    "rate limiter unavailable, failing open: {outcome}"
                );
                Ok(Verdict::Unavailable)
            }
            FailureMode::Closed => Err(Error::RateLimiterUnavailable(outcome.to_string())),
        }
    }

    async fn run_strategy(
        &self,
        policy: &RateLimitPolicy,
        route_id: Uuid,
        tier: Tier,
        identifier: &RateIdentifier,
    ) -> Result<Verdict> {
        let capacity = policy.capacity.max(1);
        let now_ms = Utc::now().timestamp_millis();

        let raw: (i64, i64, i64, i64) = match policy.strategy {
            Strategy::TokenBucket | Strategy::LeakyBucket => {
                let key = state_key(policy.strategy, route_id, tier, identifier, None);
                let rate = policy.refill_rate.unwrap_or(0.0).max(0.0);
                let script = if policy.strategy == Strategy::TokenBucket {
                    &TOKEN_BUCKET
                } else {
                    &LEAKY_BUCKET
                };
                let mut conn = self.conn().await?;
                script
                    .key(&key)
                    .arg(capacity)
                    .arg(rate)
                    .arg(now_ms)
                    .arg(self.config.bucket_state_ttl_secs)
                    .invoke_async(&mut conn)
                    .await?
            }
            Strategy::FixedWindow => {
                let window = policy.window_seconds.unwrap_or(60).max(1);
                let window_start = (now_ms / 1000).div_euclid(window) * window;
                let window_end_ms = (window_start + window) * 1000;
                let key = state_key(
                    policy.strategy,
                    route_id,
                    tier,
                    identifier,
                    Some(window_start),
                );
                let mut conn = self.conn().await?;
                FIXED_WINDOW
                    .key(&key)
                    .arg(capacity)
                    .arg(window)
                    .arg(window_end_ms)
                    .arg(now_ms)
                    .invoke_async(&mut conn)
                    .await?
            }
            Strategy::SlidingWindow => {
                let window = policy.window_seconds.unwrap_or(60).max(1);
                let window_start = (now_ms / 1000).div_euclid(window) * window;
                let current = state_key(
                    policy.strategy,
                    route_id,
                    tier,
                    identifier,
                    Some(window_start),
                );
                let previous = state_key(
                    policy.strategy,
                    route_id,
                    tier,
                    identifier,
                    Some(window_start - window),
                );
                let mut conn = self.conn().await?;
                SLIDING_WINDOW
                    .key(&current)
                    .key(&previous)
                    .arg(capacity)
                    .arg(window)
                    .arg(window_start * 1000)
                    .arg(now_ms)
                    .invoke_async(&mut conn)
                    .await?
            }
            Strategy::Concurrency => {
                let key = state_key(policy.strategy, route_id, tier, identifier, None);
                let mut conn = self.conn().await?;
                let raw: (i64, i64, i64, i64) = CONCURRENCY_ACQUIRE
                    .key(&key)
                    .arg(capacity)
                    .arg(self.config.concurrency_ttl_secs)
                    .arg(self.config.concurrency_retry_hint_ms)
                    .invoke_async(&mut conn)
                    .await?;

                let decision = decision_from_raw(capacity as u64, raw);
                if raw.0 == 1 {
                    let token = ConcurrencyToken::new(self.pool.clone(), key);
                    return Ok(Verdict::Allowed {
                        decision,
                        token: Some(token),
                    });
                }
                return Ok(Verdict::Denied(decision));
            }
        };

        let decision = decision_from_raw(capacity as u64, raw);
        if raw.0 == 1 {
            Ok(Verdict::Allowed {
                decision,
                token: None,
            })
        } else {
            Ok(Verdict::Denied(decision))
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::CachePool(e.to_string()))
    }
}

fn decision_from_raw(limit: u64, raw: (i64, i64, i64, i64)) -> RateLimitDecision {
    let (_, remaining, retry_ms, reset_secs) = raw;
    RateLimitDecision {
        limit,
        remaining: remaining.max(0) as u64,
        retry_after: Duration::from_millis(retry_ms.max(0) as u64),
        reset_at: Utc::now() + chrono::Duration::seconds(reset_secs.max(0)),
    }
}

/// Release handle for a concurrency admission
///
/// The pipeline must release exactly once per acquire, on every exit path.
/// Call [`release`](Self::release) at the response-completion edge; if the
/// request future is dropped first (client disconnect, panic unwind), the
/// `Drop` impl spawns the release instead. The cache-side TTL is the last
/// line of defense when the process dies outright.
pub struct ConcurrencyToken {
    pool: Pool,
    key: String,
    released: Arc<AtomicBool>,
}

impl ConcurrencyToken {
    fn new(pool: Pool, key: String) -> Self {
        Self {
            pool,
            key,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Decrement the in-flight counter
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        release_counter(&self.pool, &self.key).await;
    }
}

impl Drop for ConcurrencyToken {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.pool.clone();
        let key = std::mem::take(&mut self.key);
        tokio::spawn(async move {
            release_counter(&pool, &key).await;
        });
    }
}

async fn release_counter(pool: &Pool, key: &str) {
    let result: Result<i64> = async {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| Error::CachePool(e.to_string()))?;
        let count = CONCURRENCY_RELEASE
            .key(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
    .await;

    if let Err(e) = result {
        // The counter TTL recovers the slot eventually
        tracing::warn!(key, "concurrency release failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_from_raw_clamps() {
        let d = decision_from_raw(10, (0, -3, -100, -5));
        assert_eq!(d.remaining, 0);
        assert_eq!(d.retry_after, Duration::ZERO);
        assert!(d.reset_at <= Utc::now() + chrono::Duration::seconds(1));

        let d = decision_from_raw(10, (1, 7, 0, 30));
        assert_eq!(d.limit, 10);
        assert_eq!(d.remaining, 7);
    }

    /// The strategy arithmetic the Lua scripts implement, mirrored so the
    /// boundary behavior is pinned by deterministic tests.
    mod arithmetic {
        /// Token-bucket refill-and-spend, returning (allowed, tokens_after)
        pub fn token_bucket(
            tokens: f64,
            elapsed_secs: f64,
            rate: f64,
            capacity: f64,
        ) -> (bool, f64) {
            let tokens = (tokens + elapsed_secs * rate).min(capacity);
            if tokens >= 1.0 {
                (true, tokens - 1.0)
            } else {
                (false, tokens)
            }
        }

        /// Leaky-bucket drain-and-enqueue, returning (allowed, queue_after)
        pub fn leaky_bucket(
            queue: f64,
            elapsed_secs: f64,
            rate: f64,
            capacity: f64,
        ) -> (bool, f64) {
            let queue = (queue - elapsed_secs * rate).max(0.0);
            if queue < capacity {
                (true, queue + 1.0)
            } else {
                (false, queue)
            }
        }

        /// Weighted effective count for the sliding window
        pub fn sliding_effective(previous: u64, current: u64, progress: f64) -> u64 {
            ((1.0 - progress) * previous as f64).floor() as u64 + current
        }
    }

    #[test]
    fn test_token_bucket_fractional_boundary() {
        // tokens = 0.999 is not a whole token: denied
        let (allowed, after) = arithmetic::token_bucket(0.999, 0.0, 10.0, 100.0);
        assert!(!allowed);
        assert!((after - 0.999).abs() < 1e-9);

        // after 0.001 / rate seconds the missing fraction has refilled
        let (allowed, _) = arithmetic::token_bucket(0.999, 0.001 / 10.0, 10.0, 100.0);
        assert!(allowed);
    }

    #[test]
    fn test_token_bucket_burst_up_to_capacity() {
        let mut tokens = 3.0;
        for _ in 0..3 {
            let (allowed, after) = arithmetic::token_bucket(tokens, 0.0, 0.0, 3.0);
            assert!(allowed);
            tokens = after;
        }
        let (allowed, _) = arithmetic::token_bucket(tokens, 0.0, 0.0, 3.0);
        assert!(!allowed);
    }

    #[test]
    fn test_token_bucket_refill_capped_at_capacity() {
        let (_, after) = arithmetic::token_bucket(2.0, 3600.0, 10.0, 5.0);
        // Full bucket minus the token just spent
        assert!((after - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_leaky_bucket_smooths_to_leak_rate() {
        // Full queue at capacity 2: denied until a leak opens room
        let (allowed, queue) = arithmetic::leaky_bucket(2.0, 0.0, 1.0, 2.0);
        assert!(!allowed);
        assert!((queue - 2.0).abs() < 1e-9);

        // One second at 1/sec leaks one unit
        let (allowed, queue) = arithmetic::leaky_bucket(2.0, 1.0, 1.0, 2.0);
        assert!(allowed);
        assert!((queue - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_leaky_bucket_floors_at_zero() {
        let (allowed, queue) = arithmetic::leaky_bucket(1.0, 3600.0, 1.0, 2.0);
        assert!(allowed);
        assert!((queue - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sliding_window_progress_zero_counts_full_previous() {
        // At progress = 0 the effective count equals the previous window's
        assert_eq!(arithmetic::sliding_effective(100, 0, 0.0), 100);
    }

    #[test]
    fn test_sliding_window_boundary_burst_is_damped() {
        // 100 requests landed in the previous window; one second into a
        // 60-second window the weighted carry-over is floor(98.33) = 98,
        // leaving room for only 2 of a second 100-request burst.
        let capacity = 100u64;
        let progress = 1.0 / 60.0;
        let mut current = 0u64;
        let mut admitted = 0u64;
        for _ in 0..100 {
            if arithmetic::sliding_effective(100, current, progress) < capacity {
                current += 1;
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
    }

    #[test]
    fn test_fixed_window_boundary_instant_rolls_over() {
        // Window index is floor(now / window); at now == window_end the
        // request lands in the next window's counter.
        let window = 60i64;
        let window_start = 1_700_000_040i64; // multiple of 60
        let window_end = window_start + window;

        let index_of = |now: i64| now.div_euclid(window) * window;
        assert_eq!(index_of(window_end - 1), window_start);
        assert_eq!(index_of(window_end), window_end);
    }
}
