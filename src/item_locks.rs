use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::errors::ServiceError;

pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Serializes ledger operations per (store, product) pair within this
/// process.
///
/// Entries are created on first touch and kept for the life of the registry,
/// so the map grows with the number of distinct items handled. Guards must be
/// dropped before an operation returns; they are never held across calls.
/// Clones share the same underlying map.
#[derive(Debug, Clone)]
pub struct ItemLockMap {
    locks: Arc<DashMap<(Uuid, Uuid), Arc<Mutex<()>>>>,
    wait: Duration,
}

impl ItemLockMap {
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            wait,
        }
    }

    /// Acquires the lock for one item, waiting at most the configured
    /// duration. Timing out is a retryable `Conflict`, not a failure of the
    /// underlying operation.
    pub async fn acquire(
        &self,
        store_id: Uuid,
        product_id: Uuid,
    ) -> Result<OwnedMutexGuard<()>, ServiceError> {
        let lock = self
            .locks
            .entry((store_id, product_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match timeout(self.wait, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                warn!(
                    store_id = %store_id,
                    product_id = %product_id,
                    wait = ?self.wait,
                    "Timed out waiting for item lock"
                );
                Err(ServiceError::Conflict(
                    "inventory item is busy, retry".into(),
                ))
            }
        }
    }
}
