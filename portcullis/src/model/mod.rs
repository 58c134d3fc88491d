//! Durable data model
//!
//! Entities live in PostgreSQL; the repository layer (see
//! [`crate::repository`]) owns the queries. Textual enums are stored as TEXT
//! columns and converted through `TryFrom<String>` so rows deserialize with
//! `sqlx::FromRow` without database-side enum types.

pub mod api_key;
pub mod audit;
pub mod ip_rule;
pub mod policy;
pub mod route;
pub mod user;

pub use api_key::{ApiKey, KeyStatus};
pub use audit::AuditRecord;
pub use ip_rule::{IpRule, RuleType};
pub use policy::{FailureMode, RateLimitPolicy, Strategy};
pub use route::ApiDefinition;
pub use user::{Role, Tier, User};
