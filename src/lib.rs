//! Batch Ledger Library
//!
//! This crate provides batch-level inventory tracking with expiry-first FIFO
//! depletion, per-item serialization, and an append-only audit trail.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod allocator;
pub mod audit;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod item_locks;
pub mod migrator;
pub mod services;

pub use allocator::{AllocationPlan, BatchAllocation};
pub use audit::{AuditEntry, AuditTrail};
pub use entities::batch_audit_log::AuditAction;
pub use errors::ServiceError;
pub use events::{Event, EventSender};
pub use item_locks::{ItemLockMap, DEFAULT_LOCK_WAIT};
pub use services::ledger::{
    BatchAdjustment, BatchMetadataUpdate, FifoSaleResult, InventoryLedger, NewBatch,
};

pub mod prelude {
    pub use crate::allocator::*;
    pub use crate::audit::*;
    pub use crate::db::*;
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::item_locks::*;
    pub use crate::services::*;
}
