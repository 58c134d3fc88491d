//! Audit writer
//!
//! Audit records are the one durable write the hot path is not allowed to
//! drop, so inserts are synchronous (unlike request logging, which is
//! fire-and-forget tracing output). The table is append-only; there is no
//! update or delete method on purpose.

use sqlx::PgPool;

use crate::error::Result;
use crate::model::AuditRecord;

/// Synchronous, append-only audit log writer
#[derive(Clone)]
pub struct AuditWriter {
    pool: PgPool,
}

impl AuditWriter {
    /// Create a writer over the shared pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a record
    pub async fn append(&self, record: AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs
                (id, timestamp, event_type, actor_user_id, actor_ip,
                 resource_type, resource_id, changes, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.timestamp)
        .bind(&record.event_type)
        .bind(record.actor_user_id)
        .bind(&record.actor_ip)
        .bind(&record.resource_type)
        .bind(&record.resource_id)
        .bind(&record.changes)
        .bind(&record.metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
