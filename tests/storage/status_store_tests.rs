//! StatusStore interface tests.
//!
//! These tests verify the contract of the StatusStore trait.
//! Each storage implementation should run these tests.

use msgflow::contract::Payload;
use msgflow::storage::{MessageStatus, StatusStore, StorageError};
use serde_json::json;

fn unique_key(prefix: &str) -> String {
    format!("test_{}_{}", prefix, uuid::Uuid::new_v4())
}

fn payload(content: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("content".to_string(), json!(content));
    payload.insert("metadata".to_string(), json!({ "source": "test" }));
    payload
}

// =============================================================================
// StatusStore::create_or_get tests
// =============================================================================

pub async fn test_create_new_message<S: StatusStore>(store: &S) {
    let key = unique_key("create");

    let result = store
        .create_or_get(&key, "corr-1", &payload("hello"))
        .await
        .expect("create_or_get should succeed");

    assert!(!result.existed, "first sight should not report existed");
    assert_eq!(result.message.idempotency_id, key);
    assert_eq!(result.message.correlation_id, "corr-1");
    assert_eq!(result.message.status, MessageStatus::Pending);
    assert_eq!(result.message.payload["content"], json!("hello"));
    assert_eq!(result.message.payload["metadata"]["source"], json!("test"));
}

pub async fn test_create_existing_keeps_row<S: StatusStore>(store: &S) {
    let key = unique_key("existing");

    let first = store
        .create_or_get(&key, "corr-1", &payload("first"))
        .await
        .unwrap();
    let second = store
        .create_or_get(&key, "corr-2", &payload("second"))
        .await
        .unwrap();

    assert!(second.existed, "second call should report existed");
    assert_eq!(second.message.correlation_id, "corr-1");
    assert_eq!(second.message.payload["content"], json!("first"));
    assert_eq!(second.message.created_at, first.message.created_at);
    assert!(second.message.updated_at >= first.message.updated_at);
}

pub async fn test_concurrent_create_single_winner<S: StatusStore>(store: &S) {
    let key = unique_key("race");
    let callers = racing_callers(8);

    let results = futures::future::join_all(
        callers
            .iter()
            .map(|(correlation_id, body)| store.create_or_get(&key, correlation_id, body)),
    )
    .await;

    let results: Vec<_> = results
        .into_iter()
        .map(|result| result.expect("concurrent create_or_get should succeed"))
        .collect();
    assert_single_winner(&key, &callers, &results);
}

/// Distinct correlation IDs and payloads, so the winner is identifiable.
pub fn racing_callers(count: usize) -> Vec<(String, Payload)> {
    (0..count)
        .map(|i| (format!("corr-race-{}", i), payload(&format!("race {}", i))))
        .collect()
}

/// Exactly one caller inserted, and every caller saw the winner's row.
pub fn assert_single_winner(
    key: &str,
    callers: &[(String, Payload)],
    results: &[msgflow::storage::CreateOrGet],
) {
    let winners: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, result)| !result.existed)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(winners.len(), 1, "exactly one caller should create the row");

    let winner = &results[winners[0]].message;
    let (correlation_id, body) = &callers[winners[0]];
    assert_eq!(winner.idempotency_id, key);
    assert_eq!(&winner.correlation_id, correlation_id);
    assert_eq!(winner.payload, serde_json::to_value(body).unwrap());
    assert_eq!(winner.status, MessageStatus::Pending);

    // Losers touch updated_at, everything else must match the winner.
    for result in results {
        let message = &result.message;
        assert_eq!(message.idempotency_id, winner.idempotency_id);
        assert_eq!(message.correlation_id, winner.correlation_id);
        assert_eq!(message.payload, winner.payload);
        assert_eq!(message.status, winner.status);
        assert_eq!(message.created_at, winner.created_at);
    }
}

// =============================================================================
// StatusStore::update_status tests
// =============================================================================

pub async fn test_update_status_appends_history<S: StatusStore>(store: &S) {
    let key = unique_key("update");
    store
        .create_or_get(&key, "corr-1", &payload("hello"))
        .await
        .unwrap();

    store
        .update_status(
            &key,
            "corr-1",
            MessageStatus::Processing,
            "message-processor",
            "evt-1",
            None,
        )
        .await
        .expect("update_status should succeed");

    let message = store.get_message(&key).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Processing);
    assert!(message.updated_at >= message.created_at);

    let history = store.get_history(&key).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MessageStatus::Processing);
    assert_eq!(history[0].correlation_id, "corr-1");
    assert_eq!(history[0].service_name, "message-processor");
    assert_eq!(history[0].event_id, "evt-1");
    assert_eq!(history[0].error_message, None);
}

pub async fn test_update_unknown_key<S: StatusStore>(store: &S) {
    let key = unique_key("unknown");

    let result = store
        .update_status(&key, "corr-1", MessageStatus::Processing, "svc", "evt-1", None)
        .await;

    assert!(
        matches!(result, Err(StorageError::NotFound(ref k)) if *k == key),
        "unknown key should be NotFound, got {:?}",
        result
    );
    assert!(store.get_message(&key).await.unwrap().is_none());
    assert!(
        store.get_history(&key).await.unwrap().is_empty(),
        "no history should be written for an unknown key"
    );
}

pub async fn test_history_oldest_first<S: StatusStore>(store: &S) {
    let key = unique_key("history");
    store
        .create_or_get(&key, "corr-1", &payload("hello"))
        .await
        .unwrap();

    let transitions = [
        (MessageStatus::Processing, None),
        (MessageStatus::Failed, Some("store unavailable")),
        (MessageStatus::Processing, None),
        (MessageStatus::Processed, None),
    ];
    for (i, (status, error)) in transitions.iter().enumerate() {
        store
            .update_status(&key, "corr-1", *status, "svc", &format!("evt-{}", i), *error)
            .await
            .unwrap();
    }

    let history = store.get_history(&key).await.unwrap();
    let statuses: Vec<_> = history.iter().map(|h| h.status).collect();
    assert_eq!(
        statuses,
        vec![
            MessageStatus::Processing,
            MessageStatus::Failed,
            MessageStatus::Processing,
            MessageStatus::Processed,
        ]
    );
    assert_eq!(history[1].error_message.as_deref(), Some("store unavailable"));
    assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    assert_eq!(
        store.get_message(&key).await.unwrap().unwrap().status,
        MessageStatus::Processed
    );
}

// =============================================================================
// Read accessor tests
// =============================================================================

pub async fn test_get_missing<S: StatusStore>(store: &S) {
    let key = unique_key("missing");

    assert!(store.get_message(&key).await.unwrap().is_none());
    assert!(store.get_history(&key).await.unwrap().is_empty());
}

pub async fn test_history_isolated_per_key<S: StatusStore>(store: &S) {
    let a = unique_key("iso_a");
    let b = unique_key("iso_b");
    for key in [&a, &b] {
        store
            .create_or_get(key, "corr", &payload("x"))
            .await
            .unwrap();
    }

    store
        .update_status(&a, "corr", MessageStatus::Processing, "svc", "evt-a", None)
        .await
        .unwrap();

    assert_eq!(store.get_history(&a).await.unwrap().len(), 1);
    assert!(store.get_history(&b).await.unwrap().is_empty());
    assert_eq!(
        store.get_message(&b).await.unwrap().unwrap().status,
        MessageStatus::Pending
    );
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all StatusStore interface tests against a store implementation.
#[macro_export]
macro_rules! run_status_store_tests {
    ($store:expr) => {
        use $crate::storage::status_store_tests::*;

        // create_or_get tests
        test_create_new_message($store).await;
        println!("  test_create_new_message: PASSED");

        test_create_existing_keeps_row($store).await;
        println!("  test_create_existing_keeps_row: PASSED");

        test_concurrent_create_single_winner($store).await;
        println!("  test_concurrent_create_single_winner: PASSED");

        // update_status tests
        test_update_status_appends_history($store).await;
        println!("  test_update_status_appends_history: PASSED");

        test_update_unknown_key($store).await;
        println!("  test_update_unknown_key: PASSED");

        test_history_oldest_first($store).await;
        println!("  test_history_oldest_first: PASSED");

        // read accessor tests
        test_get_missing($store).await;
        println!("  test_get_missing: PASSED");

        test_history_isolated_per_key($store).await;
        println!("  test_history_isolated_per_key: PASSED");
    };
}
