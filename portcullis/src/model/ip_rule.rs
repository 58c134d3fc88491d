//! IP allow/block rules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Error;

/// Rule direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Block,
    Allow,
}

impl RuleType {
    /// Wire/storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Allow => "allow",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for RuleType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "block" => Ok(Self::Block),
            "allow" => Ok(Self::Allow),
            other => Err(Error::Validation(format!("unknown rule type: {other}"))),
        }
    }
}

/// An IP rule
///
/// A rule is active iff `expires_at` is null or in the future. Auto-created
/// rules always carry an expiry and `auto_blocked = true`, which lets
/// operators tell them apart from manual rules.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IpRule {
    pub id: Uuid,

    /// v4 or v6 address, canonical string form
    pub ip_address: String,

    #[sqlx(try_from = "String")]
    pub rule_type: RuleType,

    pub reason: Option<String>,

    pub auto_blocked: bool,

    pub expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl IpRule {
    /// True while the rule is in force
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(expires_at: Option<DateTime<Utc>>) -> IpRule {
        IpRule {
            id: Uuid::new_v4(),
            ip_address: "203.0.113.7".to_string(),
            rule_type: RuleType::Block,
            reason: None,
            auto_blocked: false,
            expires_at,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_rule_without_expiry_is_active() {
        assert!(rule(None).is_active(Utc::now()));
    }

    #[test]
    fn test_rule_activity_window() {
        let now = Utc::now();
        assert!(rule(Some(now + chrono::Duration::minutes(5))).is_active(now));
        assert!(!rule(Some(now - chrono::Duration::seconds(1))).is_active(now));
    }
}
