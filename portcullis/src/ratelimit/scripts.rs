//! Lua scripts for atomic rate-limit state transitions
//!
//! Every strategy's full read-modify-write runs server-side in a single
//! script invocation; a read-then-write from application code would race
//! across gateway instances and under-limit.
//!
//! All scripts return a four-element array:
//! `{allowed (0|1), remaining, retry_after_ms, reset_after_secs}`.

/// Token bucket: refill by elapsed time, spend one token if available.
///
/// KEYS\[1\] = bucket state (hash: `tokens`, `ts`)
/// ARGV\[1\] = capacity
/// ARGV\[2\] = refill rate (tokens per second, may be fractional or zero)
/// ARGV\[3\] = now in milliseconds
/// ARGV\[4\] = state TTL in seconds
///
/// A zero refill rate never refills; the bucket only resets when the state
/// key expires, so the retry hint on denial is the TTL.
pub const TOKEN_BUCKET: &str = r"
local cap = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil then
    tokens = cap
    ts = now
end

local elapsed = math.max(0, now - ts) / 1000.0
tokens = math.min(cap, tokens + elapsed * rate)

local allowed = 0
local retry_ms = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
else
    if rate > 0 then
        retry_ms = math.ceil(((1 - tokens) / rate) * 1000)
    else
        retry_ms = ttl * 1000
    end
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', now)
redis.call('EXPIRE', KEYS[1], ttl)

local reset = ttl
if rate > 0 then
    reset = math.ceil((cap - tokens) / rate)
end
return {allowed, math.floor(tokens), retry_ms, reset}
";

/// Leaky bucket: drain by elapsed time, enqueue one unit if below capacity.
///
/// KEYS\[1\] = bucket state (hash: `queue`, `ts`)
/// ARGV\[1\] = capacity
/// ARGV\[2\] = leak rate (units per second)
/// ARGV\[3\] = now in milliseconds
/// ARGV\[4\] = state TTL in seconds
pub const LEAKY_BUCKET: &str = r"
local cap = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'queue', 'ts')
local queue = tonumber(state[1])
local ts = tonumber(state[2])
if queue == nil then
    queue = 0
    ts = now
end

local elapsed = math.max(0, now - ts) / 1000.0
queue = math.max(0, queue - elapsed * rate)

local allowed = 0
local retry_ms = 0
if queue < cap then
    queue = queue + 1
    allowed = 1
else
    if rate > 0 then
        retry_ms = math.ceil(((queue - cap + 1) / rate) * 1000)
    else
        retry_ms = ttl * 1000
    end
end

redis.call('HSET', KEYS[1], 'queue', tostring(queue), 'ts', now)
redis.call('EXPIRE', KEYS[1], ttl)

local remaining = math.max(0, cap - math.ceil(queue))
local reset = ttl
if rate > 0 then
    reset = math.ceil(queue / rate)
end
return {allowed, remaining, retry_ms, reset}
";

/// Fixed window: integer counter per window, checked before increment.
///
/// KEYS\[1\] = counter key (window start baked into the key)
/// ARGV\[1\] = capacity
/// ARGV\[2\] = window length in seconds (also the TTL, set on first increment)
/// ARGV\[3\] = window end in milliseconds
/// ARGV\[4\] = now in milliseconds
pub const FIXED_WINDOW: &str = r"
local cap = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local window_end = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local reset = math.ceil(math.max(0, window_end - now) / 1000)
local count = tonumber(redis.call('GET', KEYS[1]) or '0')

if count < cap then
    count = redis.call('INCR', KEYS[1])
    if count == 1 then
        redis.call('EXPIRE', KEYS[1], window)
    end
    return {1, cap - count, 0, reset}
end

return {0, 0, math.max(0, window_end - now), reset}
";

/// Weighted sliding window over the current and previous fixed windows.
///
/// KEYS\[1\] = current window counter
/// KEYS\[2\] = previous window counter
/// ARGV\[1\] = capacity
/// ARGV\[2\] = window length in seconds (key TTL is twice this)
/// ARGV\[3\] = current window start in milliseconds
/// ARGV\[4\] = now in milliseconds
///
/// Effective count = floor((1 - progress) * previous) + current, with
/// progress in [0, 1) across the current window.
pub const SLIDING_WINDOW: &str = r"
local cap = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local window_start = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local cur = tonumber(redis.call('GET', KEYS[1]) or '0')
local prev = tonumber(redis.call('GET', KEYS[2]) or '0')

local window_ms = window * 1000
local progress = (now - window_start) / window_ms
if progress < 0 then progress = 0 end
if progress >= 1 then progress = 1 end

local effective = math.floor((1 - progress) * prev) + cur
local window_end = window_start + window_ms
local reset = math.ceil(math.max(0, window_end - now) / 1000)

if effective < cap then
    cur = redis.call('INCR', KEYS[1])
    if cur == 1 then
        redis.call('EXPIRE', KEYS[1], window * 2)
    end
    local remaining = cap - effective - 1
    if remaining < 0 then remaining = 0 end
    return {1, remaining, 0, reset}
end

return {0, 0, math.max(0, window_end - now), reset}
";

/// Concurrency acquire: admit while below capacity.
///
/// KEYS\[1\] = in-flight counter
/// ARGV\[1\] = capacity
/// ARGV\[2\] = counter TTL in seconds (leak recovery after a crashed holder)
/// ARGV\[3\] = retry hint in milliseconds returned on denial
pub const CONCURRENCY_ACQUIRE: &str = r"
local cap = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local hint = tonumber(ARGV[3])

local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count < cap then
    count = redis.call('INCR', KEYS[1])
    redis.call('EXPIRE', KEYS[1], ttl)
    return {1, cap - count, 0, ttl}
end

return {0, 0, hint, ttl}
";

/// Concurrency release: decrement, never below zero.
///
/// KEYS\[1\] = in-flight counter
///
/// Returns the counter value after release.
pub const CONCURRENCY_RELEASE: &str = r"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count > 0 then
    return redis.call('DECR', KEYS[1])
end
return 0
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_are_nonempty_and_return_arrays() {
        for script in [
            TOKEN_BUCKET,
            LEAKY_BUCKET,
            FIXED_WINDOW,
            SLIDING_WINDOW,
            CONCURRENCY_ACQUIRE,
        ] {
            assert!(script.contains("return {"));
        }
        assert!(CONCURRENCY_RELEASE.contains("DECR"));
    }

    #[test]
    fn test_mutating_scripts_refresh_ttl() {
        // Both bucket paths persist state and TTL on allow and on deny
        assert!(TOKEN_BUCKET.contains("EXPIRE"));
        assert!(LEAKY_BUCKET.contains("EXPIRE"));
        // Window counters set their TTL only on first increment
        assert!(FIXED_WINDOW.contains("count == 1"));
        assert!(SLIDING_WINDOW.contains("cur == 1"));
    }
}
