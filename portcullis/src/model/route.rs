//! Route definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A proxied route: pattern, upstream, and allowed methods
///
/// Patterns use `*` for a single wildcard segment and `:name` for a named
/// parameter segment. When several enabled routes match a request, the
/// first-registered one wins; overlapping patterns are a configuration
/// error, not validated at write time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiDefinition {
    pub id: Uuid,

    /// Unique slug
    pub name: String,

    /// Glob pattern, e.g. `/orders/:id/items/*`
    pub route_pattern: String,

    /// Absolute http(s) base URL of the upstream
    pub backend_url: String,

    /// Uppercased HTTP verbs this route accepts
    pub allowed_methods: Vec<String>,

    pub enabled: bool,

    pub created_at: DateTime<Utc>,
}

impl ApiDefinition {
    /// True when the route accepts the given method
    pub fn allows_method(&self, method: &str) -> bool {
        self.allowed_methods.iter().any(|m| m == method)
    }

    /// Validate the definition before persisting
    pub fn validate(&self) -> Result<()> {
        if !self.route_pattern.starts_with('/') {
            return Err(Error::Validation(format!(
                "route pattern must start with '/': {}",
                self.route_pattern
            )));
        }
        if !self.backend_url.starts_with("http://") && !self.backend_url.starts_with("https://") {
            return Err(Error::Validation(format!(
                "backend URL must be absolute http(s): {}",
                self.backend_url
            )));
        }
        if self.allowed_methods.is_empty() {
            return Err(Error::Validation(
                "route must allow at least one method".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(pattern: &str, backend: &str, methods: &[&str]) -> ApiDefinition {
        ApiDefinition {
            id: Uuid::new_v4(),
            name: "orders".to_string(),
            route_pattern: pattern.to_string(),
            backend_url: backend.to_string(),
            allowed_methods: methods.iter().map(|m| m.to_string()).collect(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_allows_method() {
        let r = route("/orders/*", "http://orders.internal", &["GET", "POST"]);
        assert!(r.allows_method("GET"));
        assert!(r.allows_method("POST"));
        assert!(!r.allows_method("DELETE"));
    }

    #[test]
    fn test_validate() {
        assert!(route("/orders", "http://x", &["GET"]).validate().is_ok());
        assert!(route("orders", "http://x", &["GET"]).validate().is_err());
        assert!(route("/orders", "ftp://x", &["GET"]).validate().is_err());
        assert!(route("/orders", "http://x", &[]).validate().is_err());
    }
}
