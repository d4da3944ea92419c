use crate::{
    allocator::{self, BatchAllocation},
    audit::{AuditEntry, AuditTrail},
    db::DbPool,
    entities::{
        batch::{self, Entity as Batch},
        batch_audit_log::{self, AuditAction},
        inventory_item::{self, Entity as InventoryItem},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    item_locks::{ItemLockMap, DEFAULT_LOCK_WAIT},
};
use chrono::{NaiveDate, Utc};
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{Set, TransactionTrait, *};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

lazy_static! {
    static ref BATCHES_ADDED: IntCounter = IntCounter::new(
        "batches_added_total",
        "Total number of batches received into the ledger"
    )
    .expect("metric can be created");
    static ref BATCH_ADJUSTMENTS: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "batch_adjustments_total",
            "Total number of batch quantity mutations"
        ),
        &["action"]
    )
    .expect("metric can be created");
    static ref BATCH_MUTATION_FAILURES: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "batch_mutation_failures_total",
            "Total number of failed batch mutations"
        ),
        &["error_type"]
    )
    .expect("metric can be created");
    static ref FIFO_SALES: IntCounter = IntCounter::new(
        "fifo_sales_total",
        "Total number of completed FIFO sales"
    )
    .expect("metric can be created");
    static ref FIFO_SALE_FAILURES: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "fifo_sale_failures_total",
            "Total number of failed FIFO sales"
        ),
        &["error_type"]
    )
    .expect("metric can be created");
    static ref BATCHES_DELETED: IntCounter = IntCounter::new(
        "batches_deleted_total",
        "Total number of batches deleted from the ledger"
    )
    .expect("metric can be created");
}

/// Input for receiving a new batch of stock.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewBatch {
    pub store_id: Uuid,
    pub product_id: Uuid,
    #[validate(length(min = 1, max = 100))]
    pub batch_number: String,
    #[validate(range(min = 0))]
    pub quantity: i32,
    /// Defaults to today when absent.
    pub received_date: Option<NaiveDate>,
    pub manufacturing_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub cost_per_unit: Option<Decimal>,
}

/// Metadata-only update for an existing batch. `None` leaves a field
/// unchanged; quantity is not updatable here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct BatchMetadataUpdate {
    #[validate(length(min = 1, max = 100))]
    pub batch_number: Option<String>,
    pub received_date: Option<NaiveDate>,
    pub manufacturing_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub cost_per_unit: Option<Decimal>,
}

/// Outcome of a single-batch quantity mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAdjustment {
    pub batch: batch::Model,
    pub action: AuditAction,
    pub quantity_before: i32,
    pub quantity_after: i32,
    /// Recomputed item total after the mutation.
    pub item_quantity: i32,
}

/// Outcome of a FIFO sale across batches. `batches` holds the updated rows
/// in depletion order, matching `allocations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FifoSaleResult {
    pub allocations: Vec<BatchAllocation>,
    pub batches: Vec<batch::Model>,
    pub item_quantity: i32,
}

/// Batch-level inventory ledger.
///
/// Every mutating operation runs inside one database transaction under the
/// per-(store, product) lock, keeps the item total equal to the sum of its
/// batch quantities, and appends audit entries for quantity mutations and
/// deletions. Domain events are emitted after commit. Clones share the same
/// lock registry.
#[derive(Clone)]
pub struct InventoryLedger {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    audit: AuditTrail,
    locks: ItemLockMap,
}

impl InventoryLedger {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self::with_lock_wait(db_pool, event_sender, DEFAULT_LOCK_WAIT)
    }

    /// Like `new`, with an explicit bound on how long operations wait for a
    /// contended item before giving up with `Conflict`.
    pub fn with_lock_wait(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        lock_wait: Duration,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            audit: AuditTrail::new(),
            locks: ItemLockMap::new(lock_wait),
        }
    }

    /// Receives a new batch, creating the (store, product) item row on first
    /// contact. Batch creation writes no audit entry.
    #[instrument(skip(self, input), fields(store_id = %input.store_id, product_id = %input.product_id))]
    pub async fn add_batch(&self, input: NewBatch) -> Result<batch::Model, ServiceError> {
        input.validate().map_err(|e| {
            BATCH_MUTATION_FAILURES
                .with_label_values(&["validation_error"])
                .inc();
            let msg = format!("Invalid input: {}", e);
            error!("{}", msg);
            ServiceError::ValidationError(msg)
        })?;
        check_date_order(input.manufacturing_date, input.expiry_date)?;
        if let Some(cost) = input.cost_per_unit {
            if cost < Decimal::ZERO {
                return Err(ServiceError::ValidationError(
                    "cost_per_unit cannot be negative".into(),
                ));
            }
        }

        let _guard = self.locks.acquire(input.store_id, input.product_id).await?;

        let db = self.db_pool.as_ref();
        let input_for_txn = input.clone();
        let (created, item) = db
            .transaction::<_, (batch::Model, inventory_item::Model), ServiceError>(move |txn| {
                Box::pin(async move {
                    let now = Utc::now();
                    let item = match InventoryItem::find()
                        .filter(inventory_item::Column::StoreId.eq(input_for_txn.store_id))
                        .filter(inventory_item::Column::ProductId.eq(input_for_txn.product_id))
                        .one(txn)
                        .await?
                    {
                        Some(existing) => existing,
                        None => {
                            inventory_item::ActiveModel {
                                store_id: Set(input_for_txn.store_id),
                                product_id: Set(input_for_txn.product_id),
                                quantity: Set(0),
                                min_stock: Set(0),
                                version: Set(1),
                                created_at: Set(now),
                                updated_at: Set(now),
                                ..Default::default()
                            }
                            .insert(txn)
                            .await?
                        }
                    };

                    let created = batch::ActiveModel {
                        inventory_id: Set(item.id),
                        batch_number: Set(input_for_txn.batch_number.clone()),
                        quantity: Set(input_for_txn.quantity),
                        received_date: Set(input_for_txn
                            .received_date
                            .unwrap_or_else(|| Utc::now().date_naive())),
                        manufacturing_date: Set(input_for_txn.manufacturing_date),
                        expiry_date: Set(input_for_txn.expiry_date),
                        cost_per_unit: Set(input_for_txn.cost_per_unit),
                        created_at: Set(now),
                        updated_at: Set(now),
                        ..Default::default()
                    }
                    .insert(txn)
                    .await?;

                    let item = recompute_item_quantity(txn, item.id).await?;

                    Ok((created, item))
                })
            })
            .await
            .map_err(unwrap_transaction_error)?;

        BATCHES_ADDED.inc();
        info!(
            batch_id = %created.id,
            batch_number = %created.batch_number,
            quantity = %created.quantity,
            item_quantity = %item.quantity,
            "Received batch"
        );

        self.event_sender
            .send(Event::BatchAdded {
                store_id: item.store_id,
                product_id: item.product_id,
                batch_id: created.id,
                quantity: created.quantity,
            })
            .await
            .map_err(ServiceError::EventError)?;
        self.emit_low_stock_if_needed(&item).await?;

        Ok(created)
    }

    /// The aggregate (store, product) row.
    pub async fn get_inventory_item(
        &self,
        store_id: Uuid,
        product_id: Uuid,
    ) -> Result<inventory_item::Model, ServiceError> {
        let db = self.db_pool.as_ref();
        InventoryItem::find()
            .filter(inventory_item::Column::StoreId.eq(store_id))
            .filter(inventory_item::Column::ProductId.eq(product_id))
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Inventory item not found for store {} product {}",
                    store_id, product_id
                ))
            })
    }

    /// Lists an item's batches in depletion order. With
    /// `include_expired = false`, batches already expired as of today are
    /// filtered out of the listing; undated batches always appear.
    #[instrument(skip(self))]
    pub async fn get_batches(
        &self,
        store_id: Uuid,
        product_id: Uuid,
        include_expired: bool,
    ) -> Result<Vec<batch::Model>, ServiceError> {
        let item = self.get_inventory_item(store_id, product_id).await?;

        let db = self.db_pool.as_ref();
        let mut batches = Batch::find()
            .filter(batch::Column::InventoryId.eq(item.id))
            .all(db)
            .await?;

        if !include_expired {
            let today = Utc::now().date_naive();
            batches.retain(|b| !b.is_expired_as_of(today));
        }
        batches.sort_by(|a, b| allocator::depletion_order(a, b));

        Ok(batches)
    }

    /// Single batch lookup.
    pub async fn get_batch(&self, batch_id: i64) -> Result<batch::Model, ServiceError> {
        let db = self.db_pool.as_ref();
        Batch::find_by_id(batch_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Batch {} not found", batch_id)))
    }

    /// Updates batch metadata. Quantity is untouched and no audit entry is
    /// written; stock movements go through the adjustment operations.
    #[instrument(skip(self, update))]
    pub async fn update_batch(
        &self,
        batch_id: i64,
        update: BatchMetadataUpdate,
    ) -> Result<batch::Model, ServiceError> {
        update.validate().map_err(|e| {
            BATCH_MUTATION_FAILURES
                .with_label_values(&["validation_error"])
                .inc();
            let msg = format!("Invalid input: {}", e);
            error!("{}", msg);
            ServiceError::ValidationError(msg)
        })?;

        let (_, item) = self.item_for_batch(batch_id).await?;
        let _guard = self.locks.acquire(item.store_id, item.product_id).await?;

        let db = self.db_pool.as_ref();
        let updated = db
            .transaction::<_, batch::Model, ServiceError>(move |txn| {
                Box::pin(async move {
                    let existing = Batch::find_by_id(batch_id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!("Batch {} not found", batch_id))
                        })?;

                    let manufacturing = update
                        .manufacturing_date
                        .or(existing.manufacturing_date);
                    let expiry = update.expiry_date.or(existing.expiry_date);
                    check_date_order(manufacturing, expiry)?;

                    let mut active: batch::ActiveModel = existing.into();
                    if let Some(batch_number) = update.batch_number {
                        active.batch_number = Set(batch_number);
                    }
                    if let Some(received_date) = update.received_date {
                        active.received_date = Set(received_date);
                    }
                    if let Some(manufacturing_date) = update.manufacturing_date {
                        active.manufacturing_date = Set(Some(manufacturing_date));
                    }
                    if let Some(expiry_date) = update.expiry_date {
                        active.expiry_date = Set(Some(expiry_date));
                    }
                    if let Some(cost_per_unit) = update.cost_per_unit {
                        if cost_per_unit < Decimal::ZERO {
                            return Err(ServiceError::ValidationError(
                                "cost_per_unit cannot be negative".into(),
                            ));
                        }
                        active.cost_per_unit = Set(Some(cost_per_unit));
                    }
                    active.updated_at = Set(Utc::now());

                    Ok(active.update(txn).await?)
                })
            })
            .await
            .map_err(unwrap_transaction_error)?;

        info!(batch_id = %updated.id, "Updated batch metadata");

        Ok(updated)
    }

    /// Applies a signed quantity delta to one batch. Zero deltas are
    /// rejected, and a negative delta may not take the batch below zero.
    #[instrument(skip(self))]
    pub async fn adjust_batch_stock(
        &self,
        batch_id: i64,
        delta: i32,
        reason: Option<String>,
        user_id: Option<Uuid>,
    ) -> Result<BatchAdjustment, ServiceError> {
        if delta == 0 {
            BATCH_MUTATION_FAILURES
                .with_label_values(&["validation_error"])
                .inc();
            return Err(ServiceError::ValidationError(
                "adjustment delta must be non-zero".into(),
            ));
        }

        let details = reason.map(|r| json!({ "reason": r }));
        self.apply_batch_adjustment(batch_id, delta, AuditAction::Adjust, details, user_id)
            .await
    }

    /// Depletes one specific batch, bypassing FIFO ordering.
    #[instrument(skip(self))]
    pub async fn sell_from_batch(
        &self,
        batch_id: i64,
        quantity: i32,
        user_id: Option<Uuid>,
    ) -> Result<BatchAdjustment, ServiceError> {
        check_positive_quantity(quantity)?;
        self.apply_batch_adjustment(batch_id, -quantity, AuditAction::Sell, None, user_id)
            .await
    }

    /// Returns stock into one specific batch.
    #[instrument(skip(self))]
    pub async fn return_to_batch(
        &self,
        batch_id: i64,
        quantity: i32,
        user_id: Option<Uuid>,
    ) -> Result<BatchAdjustment, ServiceError> {
        check_positive_quantity(quantity)?;
        self.apply_batch_adjustment(batch_id, quantity, AuditAction::Return, None, user_id)
            .await
    }

    /// Sells across an item's batches in depletion order, all-or-nothing.
    ///
    /// Planning considers every batch, expired ones included; what exists is
    /// sellable, and expiry filtering is a listing concern. On shortfall the
    /// sale fails with `InsufficientStock` and nothing is written.
    #[instrument(skip(self))]
    pub async fn sell_from_batches_fifo(
        &self,
        store_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        user_id: Option<Uuid>,
    ) -> Result<FifoSaleResult, ServiceError> {
        if quantity <= 0 {
            FIFO_SALE_FAILURES
                .with_label_values(&["validation_error"])
                .inc();
            return Err(ServiceError::ValidationError(
                "sale quantity must be positive".into(),
            ));
        }

        let _guard = self.locks.acquire(store_id, product_id).await?;

        let db = self.db_pool.as_ref();
        let audit = self.audit;
        let result = db
            .transaction::<_, FifoSaleResult, ServiceError>(move |txn| {
                Box::pin(async move {
                    let item = InventoryItem::find()
                        .filter(inventory_item::Column::StoreId.eq(store_id))
                        .filter(inventory_item::Column::ProductId.eq(product_id))
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Inventory item not found for store {} product {}",
                                store_id, product_id
                            ))
                        })?;

                    let batches = Batch::find()
                        .filter(batch::Column::InventoryId.eq(item.id))
                        .all(txn)
                        .await?;

                    let plan = allocator::plan(&batches, quantity)?;

                    let mut by_id: HashMap<i64, batch::Model> =
                        batches.into_iter().map(|b| (b.id, b)).collect();
                    let mut updated_batches = Vec::with_capacity(plan.allocations.len());
                    let now = Utc::now();

                    for allocation in &plan.allocations {
                        let source = by_id.remove(&allocation.batch_id).ok_or_else(|| {
                            ServiceError::InternalError(format!(
                                "allocation references unknown batch {}",
                                allocation.batch_id
                            ))
                        })?;

                        let quantity_before = source.quantity;
                        let mut active: batch::ActiveModel = source.into();
                        active.quantity = Set(allocation.resulting_quantity);
                        active.updated_at = Set(now);
                        let updated = active.update(txn).await?;

                        audit
                            .append(
                                txn,
                                AuditEntry {
                                    batch_id: updated.id,
                                    user_id,
                                    action: AuditAction::Sell,
                                    quantity_before,
                                    quantity_after: allocation.resulting_quantity,
                                    details: Some(json!({
                                        "fifo_sale": true,
                                        "requested": quantity,
                                    })),
                                },
                            )
                            .await?;

                        updated_batches.push(updated);
                    }

                    let item = recompute_item_quantity(txn, item.id).await?;

                    Ok(FifoSaleResult {
                        allocations: plan.allocations,
                        batches: updated_batches,
                        item_quantity: item.quantity,
                    })
                })
            })
            .await
            .map_err(unwrap_transaction_error);

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                if let ServiceError::InsufficientStock { .. } = &err {
                    FIFO_SALE_FAILURES
                        .with_label_values(&["insufficient_stock"])
                        .inc();
                }
                return Err(err);
            }
        };

        FIFO_SALES.inc();
        info!(
            store_id = %store_id,
            product_id = %product_id,
            quantity = %quantity,
            batches_touched = %result.batches.len(),
            remaining = %result.item_quantity,
            "Completed FIFO sale"
        );

        self.event_sender
            .send(Event::FifoSaleCompleted {
                store_id,
                product_id,
                quantity,
                batches_touched: result.batches.len(),
            })
            .await
            .map_err(ServiceError::EventError)?;
        let item = self.get_inventory_item(store_id, product_id).await?;
        self.emit_low_stock_if_needed(&item).await?;

        Ok(result)
    }

    /// Deletes a batch. A batch still holding stock is only deleted with
    /// `force = true`; either way the deletion is recorded in the audit
    /// trail before the row goes away.
    #[instrument(skip(self))]
    pub async fn delete_batch(
        &self,
        batch_id: i64,
        force: bool,
        user_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        let (_, item) = self.item_for_batch(batch_id).await?;
        let _guard = self.locks.acquire(item.store_id, item.product_id).await?;

        let db = self.db_pool.as_ref();
        let audit = self.audit;
        let item_after = db
            .transaction::<_, inventory_item::Model, ServiceError>(move |txn| {
                Box::pin(async move {
                    let existing = Batch::find_by_id(batch_id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!("Batch {} not found", batch_id))
                        })?;

                    if existing.quantity > 0 && !force {
                        return Err(ServiceError::Conflict(format!(
                            "cannot delete batch {} with non-zero quantity {}",
                            batch_id, existing.quantity
                        )));
                    }

                    audit
                        .append(
                            txn,
                            AuditEntry {
                                batch_id: existing.id,
                                user_id,
                                action: AuditAction::Delete,
                                quantity_before: existing.quantity,
                                quantity_after: 0,
                                details: Some(json!({ "forced": force })),
                            },
                        )
                        .await?;

                    let inventory_id = existing.inventory_id;
                    let active: batch::ActiveModel = existing.into();
                    active.delete(txn).await?;

                    recompute_item_quantity(txn, inventory_id).await
                })
            })
            .await
            .map_err(unwrap_transaction_error)?;

        BATCHES_DELETED.inc();
        info!(batch_id = %batch_id, forced = %force, "Deleted batch");

        self.event_sender
            .send(Event::BatchDeleted {
                batch_id,
                forced: force,
            })
            .await
            .map_err(ServiceError::EventError)?;
        self.emit_low_stock_if_needed(&item_after).await?;

        Ok(())
    }

    /// Chronological audit trail for a batch. Works for deleted batches too;
    /// an id with no recorded history yields an empty list.
    pub async fn get_batch_audit_logs(
        &self,
        batch_id: i64,
    ) -> Result<Vec<batch_audit_log::Model>, ServiceError> {
        let db = self.db_pool.as_ref();
        self.audit.for_batch(db, batch_id).await
    }

    /// Sets the low-stock threshold for an item.
    #[instrument(skip(self))]
    pub async fn set_min_stock(
        &self,
        store_id: Uuid,
        product_id: Uuid,
        min_stock: i32,
    ) -> Result<inventory_item::Model, ServiceError> {
        if min_stock < 0 {
            return Err(ServiceError::ValidationError(
                "min_stock cannot be negative".into(),
            ));
        }

        let _guard = self.locks.acquire(store_id, product_id).await?;

        let db = self.db_pool.as_ref();
        let item = db
            .transaction::<_, inventory_item::Model, ServiceError>(move |txn| {
                Box::pin(async move {
                    let item = InventoryItem::find()
                        .filter(inventory_item::Column::StoreId.eq(store_id))
                        .filter(inventory_item::Column::ProductId.eq(product_id))
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Inventory item not found for store {} product {}",
                                store_id, product_id
                            ))
                        })?;

                    let version = item.version;
                    let mut active: inventory_item::ActiveModel = item.into();
                    active.min_stock = Set(min_stock);
                    active.version = Set(version + 1);
                    active.updated_at = Set(Utc::now());

                    Ok(active.update(txn).await?)
                })
            })
            .await
            .map_err(unwrap_transaction_error)?;

        info!(store_id = %store_id, product_id = %product_id, min_stock = %min_stock, "Set low-stock threshold");
        self.emit_low_stock_if_needed(&item).await?;

        Ok(item)
    }

    /// Items at or below their low-stock threshold, for replenishment
    /// reporting. Items with no threshold configured are excluded.
    pub async fn low_stock_items(&self) -> Result<Vec<inventory_item::Model>, ServiceError> {
        let db = self.db_pool.as_ref();
        let items = InventoryItem::find()
            .filter(inventory_item::Column::MinStock.gt(0))
            .filter(
                Expr::col(inventory_item::Column::Quantity)
                    .lte(Expr::col(inventory_item::Column::MinStock)),
            )
            .all(db)
            .await?;
        Ok(items)
    }

    /// Shared core for adjust/sell/return: load, bounds-check, write, audit,
    /// recompute, all in one transaction under the item lock.
    async fn apply_batch_adjustment(
        &self,
        batch_id: i64,
        delta: i32,
        action: AuditAction,
        details: Option<serde_json::Value>,
        user_id: Option<Uuid>,
    ) -> Result<BatchAdjustment, ServiceError> {
        let (_, item) = self.item_for_batch(batch_id).await?;
        let _guard = self.locks.acquire(item.store_id, item.product_id).await?;

        let db = self.db_pool.as_ref();
        let audit = self.audit;
        let adjustment = db
            .transaction::<_, BatchAdjustment, ServiceError>(move |txn| {
                Box::pin(async move {
                    let existing = Batch::find_by_id(batch_id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!("Batch {} not found", batch_id))
                        })?;

                    let quantity_before = existing.quantity;
                    let quantity_after = quantity_before + delta;
                    if quantity_after < 0 {
                        return Err(match action {
                            AuditAction::Sell => {
                                ServiceError::insufficient_stock(-delta, quantity_before)
                            }
                            _ => ServiceError::ValidationError(format!(
                                "adjustment of {} would take batch {} below zero (current {})",
                                delta, batch_id, quantity_before
                            )),
                        });
                    }

                    let inventory_id = existing.inventory_id;
                    let mut active: batch::ActiveModel = existing.into();
                    active.quantity = Set(quantity_after);
                    active.updated_at = Set(Utc::now());
                    let updated = active.update(txn).await?;

                    audit
                        .append(
                            txn,
                            AuditEntry {
                                batch_id,
                                user_id,
                                action,
                                quantity_before,
                                quantity_after,
                                details,
                            },
                        )
                        .await?;

                    let item = recompute_item_quantity(txn, inventory_id).await?;

                    Ok(BatchAdjustment {
                        batch: updated,
                        action,
                        quantity_before,
                        quantity_after,
                        item_quantity: item.quantity,
                    })
                })
            })
            .await
            .map_err(unwrap_transaction_error)
            .map_err(|err| {
                if let ServiceError::InsufficientStock { .. } = &err {
                    BATCH_MUTATION_FAILURES
                        .with_label_values(&["insufficient_stock"])
                        .inc();
                }
                err
            })?;

        let action_label = action.to_string();
        BATCH_ADJUSTMENTS
            .with_label_values(&[action_label.as_str()])
            .inc();
        info!(
            batch_id = %batch_id,
            action = %action,
            delta = %delta,
            quantity_after = %adjustment.quantity_after,
            item_quantity = %adjustment.item_quantity,
            "Applied batch adjustment"
        );

        let event = match action {
            AuditAction::Sell => Event::BatchSold {
                batch_id,
                quantity: -delta,
                new_quantity: adjustment.quantity_after,
            },
            AuditAction::Return => Event::BatchReturned {
                batch_id,
                quantity: delta,
                new_quantity: adjustment.quantity_after,
            },
            _ => Event::BatchAdjusted {
                batch_id,
                delta,
                new_quantity: adjustment.quantity_after,
            },
        };
        self.event_sender
            .send(event)
            .await
            .map_err(ServiceError::EventError)?;

        let item = InventoryItem::find_by_id(item.id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Inventory item {} not found", item.id))
            })?;
        self.emit_low_stock_if_needed(&item).await?;

        Ok(adjustment)
    }

    /// Resolves the owning item for a batch-keyed operation so its lock can
    /// be taken before the transaction opens.
    async fn item_for_batch(
        &self,
        batch_id: i64,
    ) -> Result<(batch::Model, inventory_item::Model), ServiceError> {
        let db = self.db_pool.as_ref();
        let found = Batch::find_by_id(batch_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Batch {} not found", batch_id)))?;
        let item = InventoryItem::find_by_id(found.inventory_id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Inventory item {} not found",
                    found.inventory_id
                ))
            })?;
        Ok((found, item))
    }

    async fn emit_low_stock_if_needed(
        &self,
        item: &inventory_item::Model,
    ) -> Result<(), ServiceError> {
        if item.is_low_stock() {
            self.event_sender
                .send(Event::LowStock {
                    store_id: item.store_id,
                    product_id: item.product_id,
                    quantity: item.quantity,
                    min_stock: item.min_stock,
                })
                .await
                .map_err(ServiceError::EventError)?;
        }
        Ok(())
    }
}

/// Recomputes an item's denormalized total from its batch rows and bumps the
/// version. Runs inside the caller's transaction; the total is never adjusted
/// incrementally.
async fn recompute_item_quantity<C: ConnectionTrait>(
    conn: &C,
    item_id: i64,
) -> Result<inventory_item::Model, ServiceError> {
    let item = InventoryItem::find_by_id(item_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Inventory item {} not found", item_id)))?;

    let batches = Batch::find()
        .filter(batch::Column::InventoryId.eq(item_id))
        .all(conn)
        .await?;
    let total: i64 = batches.iter().map(|b| i64::from(b.quantity)).sum();
    let total = i32::try_from(total).map_err(|_| {
        ServiceError::ValidationError(format!(
            "inventory total for item {} exceeds representable range",
            item_id
        ))
    })?;

    let version = item.version;
    let mut active: inventory_item::ActiveModel = item.into();
    active.quantity = Set(total);
    active.version = Set(version + 1);
    active.updated_at = Set(Utc::now());

    Ok(active.update(conn).await?)
}

fn check_positive_quantity(quantity: i32) -> Result<(), ServiceError> {
    if quantity <= 0 {
        BATCH_MUTATION_FAILURES
            .with_label_values(&["validation_error"])
            .inc();
        return Err(ServiceError::ValidationError(
            "quantity must be positive".into(),
        ));
    }
    Ok(())
}

fn check_date_order(
    manufacturing: Option<NaiveDate>,
    expiry: Option<NaiveDate>,
) -> Result<(), ServiceError> {
    if let (Some(manufactured), Some(expires)) = (manufacturing, expiry) {
        if expires < manufactured {
            return Err(ServiceError::ValidationError(format!(
                "expiry_date {} precedes manufacturing_date {}",
                expires, manufactured
            )));
        }
    }
    Ok(())
}

fn unwrap_transaction_error(err: TransactionError<ServiceError>) -> ServiceError {
    match err {
        TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
        TransactionError::Transaction(service_err) => service_err,
    }
}
