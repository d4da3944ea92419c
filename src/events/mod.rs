use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// Define the various events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    BatchAdded {
        store_id: Uuid,
        product_id: Uuid,
        batch_id: i64,
        quantity: i32,
    },
    BatchAdjusted {
        batch_id: i64,
        delta: i32,
        new_quantity: i32,
    },
    BatchSold {
        batch_id: i64,
        quantity: i32,
        new_quantity: i32,
    },
    BatchReturned {
        batch_id: i64,
        quantity: i32,
        new_quantity: i32,
    },
    FifoSaleCompleted {
        store_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        batches_touched: usize,
    },
    BatchDeleted {
        batch_id: i64,
        forced: bool,
    },
    LowStock {
        store_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        min_stock: i32,
    },
}

/// Consumes events from the channel until all senders are dropped.
///
/// Embedding applications usually spawn this on their runtime; tests keep a
/// receiver alive instead and assert on what was emitted.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Event processor started");
    while let Some(event) = rx.recv().await {
        match &event {
            Event::LowStock {
                store_id,
                product_id,
                quantity,
                min_stock,
            } => {
                warn!(
                    store_id = %store_id,
                    product_id = %product_id,
                    quantity = %quantity,
                    min_stock = %min_stock,
                    "Inventory item at or below its low-stock threshold"
                );
            }
            other => debug!("Processing event: {:?}", other),
        }
    }
    info!("Event channel closed, stopping event processor");
}
