//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: GATEWAY_, double underscore nests
//!    sections: `GATEWAY_AUTH__TOKEN_SECRET` sets `auth.token_secret`), plus
//!    bare `DATABASE_URL` and `REDIS_URL` for deployment-platform
//!    compatibility
//! 2. Current working directory: ./config.toml
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Authentication and token configuration
    pub auth: AuthConfig,

    /// Rate limiter configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Upstream proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Auto-blocker configuration
    #[serde(default)]
    pub autoblock: AutoBlockConfig,

    /// Route table configuration
    #[serde(default)]
    pub routing: RoutingConfig,

    /// CORS configuration
    #[serde(default)]
    pub cors: CorsConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Redis configuration
    pub redis: RedisConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name (reported in X-Gateway and logs)
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whole-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Request body size limit in MB
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
}

/// Authentication and token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token signing secret (HS256/384/512) or PEM path (RS256/ES256)
    pub token_secret: String,

    /// Signing algorithm
    #[serde(default = "default_token_algorithm")]
    pub algorithm: String,

    /// Access token lifetime in seconds
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,

    /// Refresh token lifetime in seconds
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: u64,

    /// Token issuer claim
    #[serde(default)]
    pub issuer: Option<String>,

    /// Prefix for generated API keys (e.g. "pk_live")
    #[serde(default = "default_api_key_prefix")]
    pub api_key_prefix: String,

    /// Seconds an API key lookup may be served from the cache
    #[serde(default = "default_api_key_cache_ttl")]
    pub api_key_cache_ttl_secs: u64,

    /// Enforce API key scopes against the matched route in the hot path
    #[serde(default = "default_false")]
    pub enforce_scopes: bool,
}

impl AuthConfig {
    /// Access token lifetime as a Duration
    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(self.access_ttl_secs)
    }

    /// Refresh token lifetime as a Duration
    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Behavior when the shared cache is unreachable and the policy does
    /// not say otherwise: "open" allows, "closed" rejects
    #[serde(default = "default_failure_mode")]
    pub default_failure_mode: String,

    /// Hard timeout for a single rate-limit cache operation in seconds
    #[serde(default = "default_cache_op_timeout")]
    pub op_timeout_secs: u64,

    /// TTL for bucket state keys in seconds (leak recovery / idle cleanup)
    #[serde(default = "default_bucket_state_ttl")]
    pub bucket_state_ttl_secs: u64,

    /// TTL for concurrency counters in seconds (crash recovery)
    #[serde(default = "default_concurrency_ttl")]
    pub concurrency_ttl_secs: u64,

    /// Retry hint returned on concurrency denial in milliseconds
    #[serde(default = "default_concurrency_retry_hint_ms")]
    pub concurrency_retry_hint_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_failure_mode: default_failure_mode(),
            op_timeout_secs: default_cache_op_timeout(),
            bucket_state_ttl_secs: default_bucket_state_ttl(),
            concurrency_ttl_secs: default_concurrency_ttl(),
            concurrency_retry_hint_ms: default_concurrency_retry_hint_ms(),
        }
    }
}

impl RateLimitConfig {
    /// Per-operation cache timeout as a Duration
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: u32,

    /// Window in which consecutive failures are counted, in seconds
    #[serde(default = "default_breaker_window")]
    pub failure_window_secs: u64,

    /// Seconds the circuit stays open before a half-open probe
    #[serde(default = "default_breaker_cooldown")]
    pub cooldown_secs: u64,

    /// TTL for circuit state keys; must exceed the cooldown
    #[serde(default = "default_breaker_state_ttl")]
    pub state_ttl_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_threshold(),
            failure_window_secs: default_breaker_window(),
            cooldown_secs: default_breaker_cooldown(),
            state_ttl_secs: default_breaker_state_ttl(),
        }
    }
}

/// Upstream proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Per-attempt upstream timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Additional attempts after the first on retryable upstream statuses
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,

    /// Base delay for exponential retry backoff in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Trust X-Forwarded-For / X-Real-Ip from the immediate peer
    ///
    /// Enable only when the gateway sits behind a proxy that sanitizes
    /// these headers.
    #[serde(default = "default_false")]
    pub trust_forwarded_headers: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_timeout_secs: default_upstream_timeout(),
            retry_max_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            trust_forwarded_headers: false,
        }
    }
}

impl ProxyConfig {
    /// Per-attempt upstream timeout as a Duration
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Backoff delay before retry attempt `n` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2_u64.pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(multiplier))
    }
}

/// Auto-blocker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoBlockConfig {
    /// Master switch for abuse auto-blocking
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AutoBlockConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Route table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Seconds a loaded route/policy snapshot is served before reload
    #[serde(default = "default_route_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Reject clients with no active allow rule (allowlist mode)
    #[serde(default = "default_false")]
    pub ip_allowlist_enabled: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_route_cache_ttl(),
            ip_allowlist_enabled: false,
        }
    }
}

impl RoutingConfig {
    /// Snapshot TTL as a Duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins; `["*"]` enables permissive mode
    #[serde(default = "default_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_cors_origins(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_db_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the initial connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the initial connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "portcullis".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

// Must cover the worst-case upstream retry chain (3 x 30s + backoff)
fn default_timeout() -> u64 {
    120
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_body_limit_mb() -> usize {
    10
}

fn default_token_algorithm() -> String {
    "HS256".to_string()
}

fn default_access_ttl() -> u64 {
    900 // 15 minutes
}

fn default_refresh_ttl() -> u64 {
    604_800 // 7 days
}

fn default_api_key_prefix() -> String {
    "pk_live".to_string()
}

fn default_api_key_cache_ttl() -> u64 {
    60
}

fn default_failure_mode() -> String {
    "open".to_string()
}

fn default_cache_op_timeout() -> u64 {
    5
}

fn default_bucket_state_ttl() -> u64 {
    3600
}

fn default_concurrency_ttl() -> u64 {
    120
}

fn default_concurrency_retry_hint_ms() -> u64 {
    1000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_window() -> u64 {
    60
}

fn default_breaker_cooldown() -> u64 {
    30
}

fn default_breaker_state_ttl() -> u64 {
    300
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_route_cache_ttl() -> u64 {
    300
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_db_max_connections() -> u32 {
    50
}

fn default_db_min_connections() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_redis_max_connections() -> usize {
    50
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Config {
    /// Load configuration from defaults, ./config.toml, and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load configuration from a specific TOML file path
    pub fn load_from(path: &str) -> Result<Self> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("GATEWAY_").split("__"));

        // Platform-style bare URLs take precedence over file configuration
        if let Ok(url) = std::env::var("DATABASE_URL") {
            figment = figment.merge(("database.url", url));
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            figment = figment.merge(("redis.url", url));
        }

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run
    fn validate(&self) -> Result<()> {
        if self.auth.token_secret.is_empty() {
            return Err(Error::Config(Box::new(figment::Error::from(
                "auth.token_secret must be set".to_string(),
            ))));
        }
        if self.breaker.state_ttl_secs <= self.breaker.cooldown_secs {
            return Err(Error::Config(Box::new(figment::Error::from(
                "breaker.state_ttl_secs must exceed breaker.cooldown_secs".to_string(),
            ))));
        }
        match self.rate_limit.default_failure_mode.as_str() {
            "open" | "closed" => {}
            other => {
                return Err(Error::Config(Box::new(figment::Error::from(format!(
                    "rate_limit.default_failure_mode must be \"open\" or \"closed\", got {other:?}"
                )))));
            }
        }
        Ok(())
    }

    /// True when running in production
    pub fn is_production(&self) -> bool {
        self.service.environment == "production"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: default_service_name(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
                body_limit_mb: default_body_limit_mb(),
            },
            auth: AuthConfig {
                token_secret: String::new(),
                algorithm: default_token_algorithm(),
                access_ttl_secs: default_access_ttl(),
                refresh_ttl_secs: default_refresh_ttl(),
                issuer: None,
                api_key_prefix: default_api_key_prefix(),
                api_key_cache_ttl_secs: default_api_key_cache_ttl(),
                enforce_scopes: false,
            },
            rate_limit: RateLimitConfig::default(),
            breaker: BreakerConfig::default(),
            proxy: ProxyConfig::default(),
            autoblock: AutoBlockConfig::default(),
            routing: RoutingConfig::default(),
            cors: CorsConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/portcullis".to_string(),
                max_connections: default_db_max_connections(),
                min_connections: default_db_min_connections(),
                connection_timeout_secs: default_connection_timeout(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                max_connections: default_redis_max_connections(),
                connection_timeout_secs: default_connection_timeout(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.auth.access_ttl_secs, 900);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_secs, 30);
        assert_eq!(config.proxy.retry_max_attempts, 2);
        assert_eq!(config.rate_limit.default_failure_mode, "open");
        assert_eq!(config.routing.cache_ttl_secs, 300);
    }

    #[test]
    fn test_retry_delay_backoff() {
        let proxy = ProxyConfig::default();
        assert_eq!(proxy.retry_delay(1), Duration::from_secs(1));
        assert_eq!(proxy.retry_delay(2), Duration::from_secs(2));
        assert_eq!(proxy.retry_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_validate_rejects_empty_secret() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.token_secret = "supersecret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_failure_mode() {
        let mut config = Config::default();
        config.auth.token_secret = "supersecret".to_string();
        config.rate_limit.default_failure_mode = "maybe".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_short_breaker_ttl() {
        let mut config = Config::default();
        config.auth.token_secret = "supersecret".to_string();
        config.breaker.state_ttl_secs = config.breaker.cooldown_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[service]
name = "edge-gw"
port = 9000

[auth]
token_secret = "test-secret"

[breaker]
failure_threshold = 3
"#,
        )
        .unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.service.name, "edge-gw");
        assert_eq!(config.service.port, 9000);
        assert_eq!(config.breaker.failure_threshold, 3);
        // Untouched sections keep defaults
        assert_eq!(config.proxy.upstream_timeout_secs, 30);
    }
}
