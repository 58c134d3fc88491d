//! Application state shared across handlers and middleware

use deadpool_redis::Pool as RedisPool;
use sqlx::PgPool;
use std::sync::Arc;

use crate::auth::{TokenService, TokenStore};
use crate::autoblock::AutoBlocker;
use crate::config::Config;
use crate::error::Result;
use crate::metrics::MetricsRecorder;
use crate::middleware::IpGuard;
use crate::proxy::CircuitBreaker;
use crate::ratelimit::RateLimiter;
use crate::repository::{
    ApiKeyRepository, AuditWriter, IpRuleRepository, RouteRepository, UserRepository,
};
use crate::routing::RouteTable;

struct Inner {
    config: Config,
    db: PgPool,
    redis: RedisPool,
    http: reqwest::Client,

    users: UserRepository,
    api_keys: ApiKeyRepository,
    ip_rules: IpRuleRepository,
    audit: AuditWriter,

    routes: RouteTable,
    tokens: TokenService,
    token_store: TokenStore,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    autoblock: Arc<AutoBlocker>,
    metrics: Arc<MetricsRecorder>,
    ip_guard: IpGuard,
}

/// Shared application state
///
/// Cloning is cheap (a single `Arc`); every subsystem hangs off this.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    /// Connect pools and wire up every subsystem
    pub async fn connect(config: Config) -> Result<Self> {
        let db = crate::database::create_pool(&config.database).await?;
        let redis = crate::cache::create_pool(&config.redis).await?;

        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| crate::error::Error::Internal(format!("http client build failed: {e}")))?;

        Self::assemble(config, db, redis, http)
    }

    /// Wire subsystems over already-constructed pools
    pub fn assemble(
        config: Config,
        db: PgPool,
        redis: RedisPool,
        http: reqwest::Client,
    ) -> Result<Self> {
        let users = UserRepository::new(db.clone());
        let api_keys = ApiKeyRepository::new(db.clone());
        let ip_rules = IpRuleRepository::new(db.clone());
        let audit = AuditWriter::new(db.clone());

        let routes = RouteTable::new(
            RouteRepository::new(db.clone()),
            config.routing.cache_ttl(),
        );
        let tokens = TokenService::new(&config.auth)?;
        let token_store = TokenStore::new(redis.clone());
        let limiter = RateLimiter::new(redis.clone(), config.rate_limit.clone());
        let breaker = CircuitBreaker::new(redis.clone(), config.breaker.clone());
        let autoblock = Arc::new(AutoBlocker::new(
            redis.clone(),
            ip_rules.clone(),
            audit.clone(),
            config.autoblock.enabled,
        ));
        let metrics = Arc::new(MetricsRecorder::new(redis.clone()));
        let ip_guard = IpGuard::new(
            redis.clone(),
            ip_rules.clone(),
            audit.clone(),
            config.routing.ip_allowlist_enabled,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                db,
                redis,
                http,
                users,
                api_keys,
                ip_rules,
                audit,
                routes,
                tokens,
                token_store,
                limiter,
                breaker,
                autoblock,
                metrics,
                ip_guard,
            }),
        })
    }

    /// Gateway configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Database pool
    pub fn db(&self) -> &PgPool {
        &self.inner.db
    }

    /// Shared cache pool
    pub fn redis(&self) -> &RedisPool {
        &self.inner.redis
    }

    /// Upstream HTTP client
    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// User repository
    pub fn users(&self) -> &UserRepository {
        &self.inner.users
    }

    /// API key repository
    pub fn api_keys(&self) -> &ApiKeyRepository {
        &self.inner.api_keys
    }

    /// IP rule repository
    pub fn ip_rules(&self) -> &IpRuleRepository {
        &self.inner.ip_rules
    }

    /// Audit writer
    pub fn audit(&self) -> &AuditWriter {
        &self.inner.audit
    }

    /// Route table
    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }

    /// Token service
    pub fn tokens(&self) -> &TokenService {
        &self.inner.tokens
    }

    /// Token revocation store
    pub fn token_store(&self) -> &TokenStore {
        &self.inner.token_store
    }

    /// Rate limiter
    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// Circuit breaker
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Auto-blocker
    pub fn autoblock(&self) -> &Arc<AutoBlocker> {
        &self.inner.autoblock
    }

    /// Metrics recorder
    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.inner.metrics
    }

    /// IP rule enforcement
    pub fn ip_guard(&self) -> &IpGuard {
        &self.inner.ip_guard
    }
}
