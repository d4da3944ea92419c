use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The action recorded by an audit entry.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[strum(serialize_all = "lowercase")]
pub enum AuditAction {
    #[sea_orm(string_value = "adjust")]
    Adjust,
    #[sea_orm(string_value = "sell")]
    Sell,
    #[sea_orm(string_value = "return")]
    Return,
    #[sea_orm(string_value = "delete")]
    Delete,
}

/// Append-only record of a batch quantity mutation or deletion.
///
/// `batch_id` is a plain indexed column, not a foreign key: the trail must
/// remain readable after the batch row is gone.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "batch_audit_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub batch_id: i64,
    pub user_id: Option<Uuid>,
    pub action: AuditAction,
    pub quantity_before: i32,
    pub quantity_after: i32,
    pub details: Option<Json>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
