//! API keys
//!
//! The plaintext key is returned exactly once at creation. Only a one-way
//! digest is stored; authentication looks the digest up directly, so no
//! reversible form ever exists server-side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Error;

/// API key lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
    Deprecated,
}

impl KeyStatus {
    /// Wire/storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Deprecated => "deprecated",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for KeyStatus {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            "deprecated" => Ok(Self::Deprecated),
            other => Err(Error::Validation(format!("unknown key status: {other}"))),
        }
    }
}

/// An API key record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiKey {
    pub id: Uuid,

    pub user_id: Uuid,

    /// One-way hash of the full plaintext key (unique)
    pub key_digest: String,

    /// Human-recognizable prefix of the key (e.g. "pk_live")
    pub prefix: String,

    pub display_name: String,

    /// "resource:action" scope strings; `*` permitted on either side
    pub scopes: Vec<String>,

    #[sqlx(try_from = "String")]
    pub status: KeyStatus,

    pub expires_at: Option<DateTime<Utc>>,

    pub last_used_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// True when the key has passed its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Check whether the key grants a `resource:action` scope
    ///
    /// `*` matches any value on its side; a bare `*` scope grants everything.
    pub fn has_scope(&self, required: &str) -> bool {
        let (req_resource, req_action) = match required.split_once(':') {
            Some(parts) => parts,
            None => (required, ""),
        };

        self.scopes.iter().any(|scope| {
            if scope == "*" {
                return true;
            }
            match scope.split_once(':') {
                Some((resource, action)) => {
                    (resource == "*" || resource == req_resource)
                        && (action == "*" || action == req_action)
                }
                None => scope == required,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_with_scopes(scopes: &[&str]) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            key_digest: "digest".to_string(),
            prefix: "pk_test".to_string(),
            display_name: "test key".to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            status: KeyStatus::Active,
            expires_at: None,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_scope_exact_match() {
        let key = key_with_scopes(&["orders:read", "orders:write"]);
        assert!(key.has_scope("orders:read"));
        assert!(key.has_scope("orders:write"));
        assert!(!key.has_scope("orders:delete"));
        assert!(!key.has_scope("billing:read"));
    }

    #[test]
    fn test_scope_wildcards() {
        let key = key_with_scopes(&["orders:*"]);
        assert!(key.has_scope("orders:read"));
        assert!(key.has_scope("orders:anything"));
        assert!(!key.has_scope("billing:read"));

        let key = key_with_scopes(&["*:read"]);
        assert!(key.has_scope("orders:read"));
        assert!(key.has_scope("billing:read"));
        assert!(!key.has_scope("orders:write"));

        let key = key_with_scopes(&["*"]);
        assert!(key.has_scope("anything:at_all"));
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut key = key_with_scopes(&[]);
        assert!(!key.is_expired(now));

        key.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(key.is_expired(now));

        key.expires_at = Some(now + chrono::Duration::seconds(60));
        assert!(!key.is_expired(now));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [KeyStatus::Active, KeyStatus::Revoked, KeyStatus::Deprecated] {
            let parsed = KeyStatus::try_from(status.as_str().to_string()).unwrap();
            assert_eq!(parsed, status);
        }
    }
}
