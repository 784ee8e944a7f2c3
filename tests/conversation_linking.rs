// tests/conversation_linking.rs
// End-to-end exercise of the Storage Adapter + Conversation Linker through a
// real (in-memory) SQLite pool, rather than the linker's own unit tests
// which stub `LinkQueries` directly.

mod common;

use serde_json::json;
use threadwire::model::RequestClassification;
use threadwire::storage::writer::ResponseUpdate;

use common::{assistant, in_memory_storage, user};

#[tokio::test]
async fn first_message_in_a_domain_starts_a_new_conversation() {
    let storage = in_memory_storage().await;
    let short_id = storage.new_short_id(uuid::Uuid::new_v4());

    let linkage = storage
        .store_request(
            &short_id,
            "example.com",
            "acct_1",
            chrono::Utc::now(),
            "POST",
            "/v1/messages",
            json!({}),
            json!({"model": "model-x"}),
            Some("model-x".to_string()),
            false,
            &[user("hello")],
            None,
            RequestClassification::QueryEvaluation,
        )
        .await
        .expect("store_request should succeed");

    assert_eq!(linkage.branch_id, "main");
    assert!(linkage.parent_request_id.is_none());
    assert!(!linkage.is_subtask);
}

#[tokio::test]
async fn continuing_the_same_message_history_links_to_the_same_conversation() {
    let storage = in_memory_storage().await;

    let first_request_id = uuid::Uuid::new_v4();
    let first_short_id = storage.new_short_id(first_request_id);
    let first = storage
        .store_request(
            &first_short_id,
            "example.com",
            "acct_1",
            chrono::Utc::now(),
            "POST",
            "/v1/messages",
            json!({}),
            json!({}),
            Some("model-x".to_string()),
            false,
            &[user("hello")],
            None,
            RequestClassification::QueryEvaluation,
        )
        .await
        .unwrap();

    storage
        .store_response(
            &first_short_id,
            ResponseUpdate {
                status: 200,
                response_body: Some(json!({"content": [{"type": "text", "text": "hi there"}]})),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let second_short_id = storage.new_short_id(uuid::Uuid::new_v4());
    let second = storage
        .store_request(
            &second_short_id,
            "example.com",
            "acct_1",
            chrono::Utc::now(),
            "POST",
            "/v1/messages",
            json!({}),
            json!({}),
            Some("model-x".to_string()),
            false,
            &[user("hello"), assistant("hi there"), user("and then?")],
            None,
            RequestClassification::QueryEvaluation,
        )
        .await
        .unwrap();

    assert_eq!(second.conversation_id, first.conversation_id);
    assert_eq!(second.branch_id, "main");
    assert_eq!(second.parent_request_id, Some(first_request_id));
}

#[tokio::test]
async fn store_response_on_unknown_short_id_is_a_no_op() {
    let storage = in_memory_storage().await;
    let result = storage
        .store_response("never-issued", ResponseUpdate::default())
        .await;
    assert!(result.is_ok());
}
