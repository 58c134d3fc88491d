//! Repository layer over PostgreSQL
//!
//! Thin, query-per-method repositories. Each repository is `Clone` and wraps
//! the shared `PgPool` (pooling makes clones cheap). All hot-path reads are
//! fronted by caches elsewhere; nothing here caches.

pub mod api_keys;
pub mod audit;
pub mod ip_rules;
pub mod routes;
pub mod users;

pub use api_keys::ApiKeyRepository;
pub use audit::AuditWriter;
pub use ip_rules::IpRuleRepository;
pub use routes::RouteRepository;
pub use users::UserRepository;
