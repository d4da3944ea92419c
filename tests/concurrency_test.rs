mod common;

use std::time::Duration;

use batchledger::{NewBatch, ServiceError};
use common::TestLedger;
use uuid::Uuid;

fn new_batch(store_id: Uuid, product_id: Uuid, batch_number: &str, quantity: i32) -> NewBatch {
    NewBatch {
        store_id,
        product_id,
        batch_number: batch_number.to_string(),
        quantity,
        received_date: None,
        manufacturing_date: None,
        expiry_date: None,
        cost_per_unit: None,
    }
}

#[tokio::test]
async fn concurrent_fifo_sales_never_oversell() {
    let app = TestLedger::new().await;
    let store = Uuid::new_v4();
    let product = Uuid::new_v4();

    for (number, quantity) in [("LOT-A", 4), ("LOT-B", 3), ("LOT-C", 3)] {
        app.ledger
            .add_batch(new_batch(store, product, number, quantity))
            .await
            .unwrap();
    }

    // 20 buyers race for 10 units; exactly 10 single-unit sales can land.
    let mut tasks = Vec::new();
    for _ in 0..20 {
        let ledger = app.ledger.clone();
        tasks.push(tokio::spawn(async move {
            ledger.sell_from_batches_fifo(store, product, 1, None).await
        }));
    }

    let mut successes = 0;
    for task in tasks {
        match task.await.expect("task should not panic") {
            Ok(_) => successes += 1,
            Err(ServiceError::InsufficientStock { requested: 1, .. }) => {}
            Err(other) => panic!("unexpected failure: {}", other),
        }
    }
    assert_eq!(
        successes, 10,
        "exactly 10 sales should succeed; got {}",
        successes
    );

    let item = app.ledger.get_inventory_item(store, product).await.unwrap();
    assert_eq!(item.quantity, 0);
    let batches = app.ledger.get_batches(store, product, true).await.unwrap();
    assert!(batches.iter().all(|b| b.quantity == 0));
}

#[tokio::test]
async fn contended_items_fail_fast_with_conflict_and_exact_books() {
    let app = TestLedger::with_lock_wait(Duration::from_millis(1)).await;
    let store = Uuid::new_v4();
    let product = Uuid::new_v4();

    let received = app
        .ledger
        .add_batch(new_batch(store, product, "LOT-A", 1000))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let ledger = app.ledger.clone();
        let batch_id = received.id;
        tasks.push(tokio::spawn(async move {
            ledger.sell_from_batch(batch_id, 1, None).await
        }));
    }

    let mut sold = 0;
    for task in tasks {
        match task.await.expect("task should not panic") {
            Ok(_) => sold += 1,
            Err(ServiceError::Conflict(message)) => {
                assert!(message.contains("busy, retry"), "got: {}", message);
            }
            Err(other) => panic!("unexpected failure: {}", other),
        }
    }
    assert!(sold >= 1, "the first acquirer always proceeds");

    // Whatever mix of outcomes occurred, the books are exact.
    let batch = app.ledger.get_batch(received.id).await.unwrap();
    assert_eq!(batch.quantity, 1000 - sold);
    let item = app.ledger.get_inventory_item(store, product).await.unwrap();
    assert_eq!(item.quantity, 1000 - sold);
    let logs = app.ledger.get_batch_audit_logs(received.id).await.unwrap();
    assert_eq!(logs.len(), sold as usize);
}

#[tokio::test]
async fn sales_on_distinct_items_proceed_independently() {
    let app = TestLedger::new().await;
    let store = Uuid::new_v4();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    app.ledger
        .add_batch(new_batch(store, first, "LOT-A", 10))
        .await
        .unwrap();
    app.ledger
        .add_batch(new_batch(store, second, "LOT-A", 10))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for product in [first, second] {
        for _ in 0..10 {
            let ledger = app.ledger.clone();
            tasks.push(tokio::spawn(async move {
                ledger.sell_from_batches_fifo(store, product, 1, None).await
            }));
        }
    }

    for task in tasks {
        task.await
            .expect("task should not panic")
            .expect("every sale is covered by its own item");
    }

    assert_eq!(
        app.ledger.get_inventory_item(store, first).await.unwrap().quantity,
        0
    );
    assert_eq!(
        app.ledger.get_inventory_item(store, second).await.unwrap().quantity,
        0
    );
}

#[tokio::test]
async fn interleaved_sales_and_returns_keep_the_item_total_exact() {
    let app = TestLedger::new().await;
    let store = Uuid::new_v4();
    let product = Uuid::new_v4();

    let received = app
        .ledger
        .add_batch(new_batch(store, product, "LOT-A", 1000))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let ledger = app.ledger.clone();
        let batch_id = received.id;
        tasks.push(tokio::spawn(async move {
            for _ in 0..3 {
                ledger.sell_from_batch(batch_id, 5, None).await?;
                ledger.return_to_batch(batch_id, 5, None).await?;
            }
            Ok::<(), ServiceError>(())
        }));
    }

    for task in tasks {
        task.await
            .expect("task should not panic")
            .expect("stock never runs out in this schedule");
    }

    let batch = app.ledger.get_batch(received.id).await.unwrap();
    assert_eq!(batch.quantity, 1000);
    let item = app.ledger.get_inventory_item(store, product).await.unwrap();
    assert_eq!(item.quantity, 1000);

    let logs = app.ledger.get_batch_audit_logs(received.id).await.unwrap();
    assert_eq!(logs.len(), 48);
}
