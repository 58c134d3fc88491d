//! User accounts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Error;

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    /// Wire/storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Role {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(Error::Validation(format!("unknown role: {other}"))),
        }
    }
}

/// Subscription tier, used for rate-limit policy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    /// Wire/storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Tier {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(Error::Validation(format!("unknown tier: {other}"))),
        }
    }
}

/// A gateway account
///
/// `token_version` is a monotone counter bumped on password change or forced
/// revocation; access tokens carrying an older version fail validation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,

    /// Unique, stored lowercased
    pub email: String,

    /// Argon2id PHC hash; never serialized to clients
    #[serde(skip_serializing)]
    pub password_digest: String,

    #[sqlx(try_from = "String")]
    pub role: Role,

    #[sqlx(try_from = "String")]
    pub tier: Tier,

    pub token_version: i32,

    pub created_at: DateTime<Utc>,
}

impl User {
    /// True when the account can perform admin-surface operations
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::User, Role::Admin] {
            let parsed = Role::try_from(role.as_str().to_string()).unwrap();
            assert_eq!(parsed, role);
        }
        assert!(Role::try_from("root".to_string()).is_err());
    }

    #[test]
    fn test_tier_round_trip() {
        for tier in [Tier::Free, Tier::Pro, Tier::Enterprise] {
            let parsed = Tier::try_from(tier.as_str().to_string()).unwrap();
            assert_eq!(parsed, tier);
        }
        assert!(Tier::try_from("platinum".to_string()).is_err());
    }

    #[test]
    fn test_password_digest_not_serialized() {
        let user = User {
            id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            password_digest: "$argon2id$...".to_string(),
            role: Role::User,
            tier: Tier::Free,
            token_version: 1,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password_digest").is_none());
    }
}
