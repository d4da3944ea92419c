use std::sync::Arc;
use std::time::Duration;

use batchledger::{
    db::{self, DbConfig, DbPool},
    events::{Event, EventSender},
    services::ledger::InventoryLedger,
};
use tokio::sync::mpsc;

/// Ledger harness backed by a private in-memory SQLite database.
///
/// The pool is pinned to a single connection so the in-memory database
/// survives for the whole test. The event receiver is kept on the harness;
/// tests drain it to assert on emitted events.
pub struct TestLedger {
    pub db: Arc<DbPool>,
    pub ledger: InventoryLedger,
    pub events: mpsc::Receiver<Event>,
}

impl TestLedger {
    pub async fn new() -> Self {
        Self::with_lock_wait(Duration::from_secs(5)).await
    }

    pub async fn with_lock_wait(lock_wait: Duration) -> Self {
        let cfg = DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let pool = db::establish_connection_with_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db = Arc::new(pool);
        let (tx, rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(tx));
        let ledger = InventoryLedger::with_lock_wait(db.clone(), event_sender, lock_wait);

        Self {
            db,
            ledger,
            events: rx,
        }
    }

    /// Everything emitted since the last drain.
    #[allow(dead_code)]
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}
