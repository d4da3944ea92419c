use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use uuid::Uuid;

use crate::entities::batch_audit_log::{self, AuditAction};
use crate::errors::ServiceError;

/// What gets recorded for one batch mutation or deletion.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub batch_id: i64,
    pub user_id: Option<Uuid>,
    pub action: AuditAction,
    pub quantity_before: i32,
    pub quantity_after: i32,
    pub details: Option<serde_json::Value>,
}

/// Append-only writer and reader for `batch_audit_logs`.
///
/// `append` is generic over the connection so it runs inside the ledger's
/// transactions; a mutation and its audit entry commit or roll back together.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditTrail;

impl AuditTrail {
    pub fn new() -> Self {
        Self
    }

    /// Appends one entry inside the caller's transaction.
    pub async fn append<C: ConnectionTrait>(
        &self,
        conn: &C,
        entry: AuditEntry,
    ) -> Result<batch_audit_log::Model, ServiceError> {
        let active = batch_audit_log::ActiveModel {
            batch_id: Set(entry.batch_id),
            user_id: Set(entry.user_id),
            action: Set(entry.action),
            quantity_before: Set(entry.quantity_before),
            quantity_after: Set(entry.quantity_after),
            details: Set(entry.details),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        let log = active.insert(conn).await?;
        Ok(log)
    }

    /// Chronological trail for a batch, oldest first. Entries are keyed by
    /// batch id value, so the trail remains readable after the batch row is
    /// deleted; an id with no history yields an empty list.
    pub async fn for_batch<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch_id: i64,
    ) -> Result<Vec<batch_audit_log::Model>, ServiceError> {
        let logs = batch_audit_log::Entity::find()
            .filter(batch_audit_log::Column::BatchId.eq(batch_id))
            .order_by_asc(batch_audit_log::Column::CreatedAt)
            .order_by_asc(batch_audit_log::Column::Id)
            .all(conn)
            .await?;
        Ok(logs)
    }
}
