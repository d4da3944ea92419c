use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row per (store, product) pair, created lazily on first batch receipt.
/// `quantity` is denormalized and always equals the sum of the item's batch
/// quantities after a committed operation.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub store_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub min_stock: i32,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::batch::Entity")]
    Batches,
}

impl Related<super::batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batches.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether this item sits at or below its configured low-stock threshold.
    pub fn is_low_stock(&self) -> bool {
        self.min_stock > 0 && self.quantity <= self.min_stock
    }
}
