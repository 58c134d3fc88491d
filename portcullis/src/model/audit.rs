//! Audit trail records
//!
//! Append-only. Records reference users by id without owning them; a deleted
//! user leaves its audit entries dangling by design of the data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single audit record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: Uuid,

    pub timestamp: DateTime<Utc>,

    /// Dotted event name, e.g. "security.ip.auto_blocked"
    pub event_type: String,

    pub actor_user_id: Option<Uuid>,

    pub actor_ip: Option<String>,

    pub resource_type: Option<String>,

    pub resource_id: Option<String>,

    /// Structured before/after or action payload
    pub changes: serde_json::Value,

    /// Structured context (thresholds hit, counters, request ids)
    pub metadata: serde_json::Value,
}

impl AuditRecord {
    /// Start a record for an event type
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            actor_user_id: None,
            actor_ip: None,
            resource_type: None,
            resource_id: None,
            changes: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the acting user
    pub fn by_user(mut self, user_id: Uuid) -> Self {
        self.actor_user_id = Some(user_id);
        self
    }

    /// Set the acting IP
    pub fn from_ip(mut self, ip: impl Into<String>) -> Self {
        self.actor_ip = Some(ip.into());
        self
    }

    /// Set the affected resource
    pub fn on_resource(mut self, resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(id.into());
        self
    }

    /// Attach the change payload
    pub fn with_changes(mut self, changes: serde_json::Value) -> Self {
        self.changes = changes;
        self
    }

    /// Attach context metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let user_id = Uuid::new_v4();
        let record = AuditRecord::new("security.ip.auto_blocked")
            .by_user(user_id)
            .from_ip("203.0.113.7")
            .on_resource("ip_rule", "abc")
            .with_metadata(serde_json::json!({"violations": 10}));

        assert_eq!(record.event_type, "security.ip.auto_blocked");
        assert_eq!(record.actor_user_id, Some(user_id));
        assert_eq!(record.actor_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(record.resource_type.as_deref(), Some("ip_rule"));
        assert_eq!(record.metadata["violations"], 10);
    }
}
