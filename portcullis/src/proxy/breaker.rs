//! Per-route circuit breaker
//!
//! State lives in the shared cache under `circuit:<route>:*` so every
//! gateway instance sees the same circuit. The absence of a state key means
//! closed; transitions run as Lua scripts with the same atomicity argument
//! as the rate limiter.
//!
//! | state     | meaning        | transition                                     |
//! |-----------|----------------|------------------------------------------------|
//! | closed    | normal         | threshold consecutive failures in window: open |
//! | open      | reject eagerly | first check after cooldown: half_open          |
//! | half_open | probing        | success: closed; failure: open again           |

use deadpool_redis::Pool;
use redis::Script;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;

use crate::config::BreakerConfig;
use crate::error::{Error, Result};

/// Gate a request through the circuit.
///
/// KEYS\[1\] = state key, KEYS\[2\] = opened_at key, KEYS\[3\] = failures key
/// ARGV\[1\] = now (unix seconds), ARGV\[2\] = cooldown seconds,
/// ARGV\[3\] = state TTL seconds
///
/// Returns `{allowed, state, retry_after_secs, failures}`.
const CHECK: &str = r"
local now = tonumber(ARGV[1])
local cooldown = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local state = redis.call('GET', KEYS[1])
if state == false then state = 'closed' end
local failures = tonumber(redis.call('GET', KEYS[3]) or '0')

if state == 'open' then
    local opened_at = tonumber(redis.call('GET', KEYS[2]) or '0')
    local retry_at = opened_at + cooldown
    if now >= retry_at then
        redis.call('SET', KEYS[1], 'half_open', 'EX', ttl)
        return {1, 'half_open', 0, failures}
    end
    return {0, 'open', retry_at - now, failures}
end

return {1, state, 0, failures}
";

/// Record an upstream failure.
///
/// KEYS\[1\] = state key, KEYS\[2\] = opened_at key, KEYS\[3\] = failures key
/// ARGV\[1\] = now (unix seconds), ARGV\[2\] = consecutive-failure threshold,
/// ARGV\[3\] = failure window seconds, ARGV\[4\] = state TTL seconds
///
/// Returns the resulting state name.
const RECORD_FAILURE: &str = r"
local now = tonumber(ARGV[1])
local threshold = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('GET', KEYS[1])
if state == false then state = 'closed' end

if state == 'half_open' then
    redis.call('SET', KEYS[1], 'open', 'EX', ttl)
    redis.call('SET', KEYS[2], now, 'EX', ttl)
    redis.call('DEL', KEYS[3])
    return 'open'
end

if state == 'open' then
    return 'open'
end

local failures = redis.call('INCR', KEYS[3])
if failures == 1 then
    redis.call('EXPIRE', KEYS[3], window)
end
if failures >= threshold then
    redis.call('SET', KEYS[1], 'open', 'EX', ttl)
    redis.call('SET', KEYS[2], now, 'EX', ttl)
    redis.call('DEL', KEYS[3])
    return 'open'
end
return 'closed'
";

/// Record an upstream success.
///
/// KEYS\[1\] = state key, KEYS\[2\] = opened_at key, KEYS\[3\] = failures key
///
/// A half-open probe success closes the circuit (deleting the state key;
/// absence is closed). Any success resets the consecutive-failure count.
const RECORD_SUCCESS: &str = r"
local state = redis.call('GET', KEYS[1])
redis.call('DEL', KEYS[3])
if state == 'half_open' then
    redis.call('DEL', KEYS[1])
    redis.call('DEL', KEYS[2])
    return 'closed'
end
if state == false then return 'closed' end
return state
";

static CHECK_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(CHECK));
static FAILURE_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(RECORD_FAILURE));
static SUCCESS_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(RECORD_SUCCESS));

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn parse(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Gate decision for one request
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerDecision {
    /// Proceed to the upstream; carries the observed state and failure count
    Allow {
        state: BreakerState,
        failures: u64,
    },
    /// Fail fast without touching the backend
    Reject {
        retry_after: Duration,
    },
}

/// Distributed circuit breaker over the shared cache
pub struct CircuitBreaker {
    pool: Pool,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Create a breaker
    pub fn new(pool: Pool, config: BreakerConfig) -> Self {
        Self { pool, config }
    }

    fn keys(route: &str) -> [String; 3] {
        [
            format!("circuit:{route}:state"),
            format!("circuit:{route}:opened_at"),
            format!("circuit:{route}:failures"),
        ]
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::CachePool(e.to_string()))
    }

    /// Gate a request for the route
    ///
    /// Cache errors fail open: a broken coordination store must not take
    /// every upstream down with it.
    pub async fn check(&self, route: &str) -> BreakerDecision {
        let attempt: Result<(i64, String, i64, i64)> = async {
            let [state_key, opened_key, failures_key] = Self::keys(route);
            let mut conn = self.conn().await?;
            let raw = CHECK_SCRIPT
                .key(&state_key)
                .key(&opened_key)
                .key(&failures_key)
                .arg(Utc::now().timestamp())
                .arg(self.config.cooldown_secs)
                .arg(self.config.state_ttl_secs)
                .invoke_async(&mut conn)
                .await?;
            Ok(raw)
        }
        .await;

        match attempt {
            Ok((allowed, state, retry_secs, failures)) => {
                if allowed == 1 {
                    BreakerDecision::Allow {
                        state: BreakerState::parse(&state),
                        failures: failures.max(0) as u64,
                    }
                } else {
                    BreakerDecision::Reject {
                        retry_after: Duration::from_secs(retry_secs.max(0) as u64),
                    }
                }
            }
            Err(e) => {
                tracing::warn!(route, "breaker check failed, allowing: {e}");
                BreakerDecision::Allow {
                    state: BreakerState::Closed,
                    failures: 0,
                }
            }
        }
    }

    /// Count one upstream failure; returns the resulting state
    pub async fn record_failure(&self, route: &str) -> BreakerState {
        let attempt: Result<String> = async {
            let [state_key, opened_key, failures_key] = Self::keys(route);
            let mut conn = self.conn().await?;
            let state = FAILURE_SCRIPT
                .key(&state_key)
                .key(&opened_key)
                .key(&failures_key)
                .arg(Utc::now().timestamp())
                .arg(self.config.failure_threshold)
                .arg(self.config.failure_window_secs)
                .arg(self.config.state_ttl_secs)
                .invoke_async(&mut conn)
                .await?;
            Ok(state)
        }
        .await;

        match attempt {
            Ok(state) => {
                let state = BreakerState::parse(&state);
                if state == BreakerState::Open {
                    tracing::warn!(route, "circuit opened");
                }
                state
            }
            Err(e) => {
                tracing::warn!(route, "breaker failure record failed: {e}");
                BreakerState::Closed
            }
        }
    }

    /// Record an upstream success (resets consecutive failures, closes a
    /// half-open circuit)
    pub async fn record_success(&self, route: &str) {
        let attempt: Result<String> = async {
            let [state_key, opened_key, failures_key] = Self::keys(route);
            let mut conn = self.conn().await?;
            let state = SUCCESS_SCRIPT
                .key(&state_key)
                .key(&opened_key)
                .key(&failures_key)
                .invoke_async(&mut conn)
                .await?;
            Ok(state)
        }
        .await;

        match attempt {
            Ok(state) => {
                if BreakerState::parse(&state) == BreakerState::Closed {
                    tracing::debug!(route, "circuit closed");
                }
            }
            Err(e) => {
                tracing::warn!(route, "breaker success record failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parse() {
        assert_eq!(BreakerState::parse("closed"), BreakerState::Closed);
        assert_eq!(BreakerState::parse("open"), BreakerState::Open);
        assert_eq!(BreakerState::parse("half_open"), BreakerState::HalfOpen);
        // Absent key reads as closed
        assert_eq!(BreakerState::parse(""), BreakerState::Closed);
    }

    #[test]
    fn test_key_layout() {
        let [state, opened, failures] = CircuitBreaker::keys("orders");
        assert_eq!(state, "circuit:orders:state");
        assert_eq!(opened, "circuit:orders:opened_at");
        assert_eq!(failures, "circuit:orders:failures");
    }

    /// The transition table the Lua scripts implement, mirrored for
    /// deterministic coverage of the state machine.
    mod transitions {
        use super::super::BreakerState::{self, *};

        pub fn on_check(
            state: BreakerState,
            opened_at: i64,
            now: i64,
            cooldown: i64,
        ) -> (bool, BreakerState) {
            match state {
                Open if now >= opened_at + cooldown => (true, HalfOpen),
                Open => (false, Open),
                other => (true, other),
            }
        }

        pub fn on_failure(state: BreakerState, failures: u64, threshold: u64) -> BreakerState {
            match state {
                HalfOpen => Open,
                Open => Open,
                Closed if failures + 1 >= threshold => Open,
                Closed => Closed,
            }
        }

        pub fn on_success(state: BreakerState) -> BreakerState {
            match state {
                HalfOpen => Closed,
                other => other,
            }
        }
    }

    #[test]
    fn test_closed_trips_at_threshold() {
        use transitions::on_failure;
        use BreakerState::*;

        let mut state = Closed;
        for failures in 0..4u64 {
            state = on_failure(state, failures, 5);
            assert_eq!(state, Closed);
        }
        state = on_failure(state, 4, 5);
        assert_eq!(state, Open);
    }

    #[test]
    fn test_open_rejects_until_cooldown() {
        use transitions::on_check;
        use BreakerState::*;

        let opened_at = 1000;
        let (allowed, state) = on_check(Open, opened_at, opened_at + 29, 30);
        assert!(!allowed);
        assert_eq!(state, Open);

        let (allowed, state) = on_check(Open, opened_at, opened_at + 30, 30);
        assert!(allowed);
        assert_eq!(state, HalfOpen);
    }

    #[test]
    fn test_half_open_single_probe_decides() {
        use transitions::{on_failure, on_success};
        use BreakerState::*;

        assert_eq!(on_success(HalfOpen), Closed);
        assert_eq!(on_failure(HalfOpen, 0, 5), Open);
    }

    #[test]
    fn test_success_does_not_close_an_open_circuit() {
        // Only a half-open probe success closes; an open circuit stays open
        // until the cooldown elapses regardless of stray success records.
        use transitions::on_success;
        use BreakerState::*;

        assert_eq!(on_success(Open), Open);
        assert_eq!(on_success(Closed), Closed);
    }
}
