pub mod batch;
pub mod batch_audit_log;
pub mod inventory_item;
