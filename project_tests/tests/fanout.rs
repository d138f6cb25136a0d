use std::sync::Arc;
use std::time::Duration;

use lib_realtime::{GatewayConfig, Identity, RealtimeError, Topic};
use project_tests::{FlakyPersister, Harness, PNG, SlowSubscribeBroker, TestClient};
use serde_json::json;

fn settle() -> tokio::time::Sleep {
    tokio::time::sleep(Duration::from_millis(50))
}

#[tokio::test]
async fn attachment_then_text_becomes_one_item() {
    let harness = Harness::new();
    let gateway = harness.gateway(GatewayConfig::default());
    let mut writer = TestClient::connect(&gateway, harness.post_request("42", "u1"));
    let mut reader = TestClient::connect(&gateway, harness.post_request("42", "u2"));
    settle().await;

    writer.send_binary(PNG);
    writer.send_json(json!({ "content": "look at this" }));

    for client in [&mut reader, &mut writer] {
        let envelope = client.next_json().await;
        assert_eq!(envelope["action"], "create");
        assert_eq!(envelope["topic"], "post:42");
        assert_eq!(envelope["payload"]["text"], "look at this");
        assert_eq!(envelope["payload"]["author"], "u1");
        assert_eq!(envelope["payload"]["attachments"].as_array().unwrap().len(), 1);
    }
    assert!(reader.stays_quiet(Duration::from_millis(100)).await);

    let stored = harness.history(&Topic::entity("post", "42").unwrap()).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].attachments.len(), 1);
    assert!(harness.blobs.contains(&stored[0].attachments[0]).await);

    assert!(writer.hang_up().await.is_ok());
    assert!(reader.hang_up().await.is_ok());
}

#[tokio::test]
async fn both_sides_of_a_chat_share_the_pair_topic() {
    let harness = Harness::new();
    let gateway = harness.gateway(GatewayConfig::default());
    let mut u2 = TestClient::connect(&gateway, harness.chat_request("u2", "u1"));
    let mut u1 = TestClient::connect(&gateway, harness.chat_request("u1", "u2"));
    settle().await;

    u2.send_json(json!({ "content": "hi u1" }));
    let at_u1 = u1.next_json().await;
    let at_u2 = u2.next_json().await;
    assert_eq!(at_u1["topic"], "pair:u1:u2");
    assert_eq!(at_u1, at_u2);
    assert_eq!(at_u1["payload"]["author"], "u2");

    let topic = Topic::pair(&Identity::from("u1"), &Identity::from("u2"));
    assert_eq!(harness.history(&topic).await.len(), 1);
}

#[tokio::test]
async fn other_topics_see_nothing() {
    let harness = Harness::new();
    let gateway = harness.gateway(GatewayConfig::default());
    let mut on_42 = TestClient::connect(&gateway, harness.post_request("42", "u1"));
    let mut on_43 = TestClient::connect(&gateway, harness.post_request("43", "u2"));
    settle().await;

    on_42.send_json(json!({ "content": "only for 42" }));
    assert_eq!(on_42.next_json().await["topic"], "post:42");
    assert!(on_43.stays_quiet(Duration::from_millis(150)).await);
}

#[tokio::test]
async fn hang_up_releases_subscription_and_staged_uploads() {
    let harness = Harness::new();
    let gateway = harness.gateway(GatewayConfig::default());
    let client = TestClient::connect(&gateway, harness.post_request("42", "u1"));
    settle().await;
    assert_eq!(harness.broker.topic_count(), 1);

    client.send_binary(PNG);
    settle().await;
    assert_eq!(harness.blobs.len().await, 1);

    assert!(client.hang_up().await.is_ok());
    assert!(harness.wait_for_released_topics().await);
    assert!(harness.blobs.is_empty().await);
    assert!(harness.history(&Topic::entity("post", "42").unwrap()).await.is_empty());
}

#[tokio::test]
async fn failed_persist_is_retried_by_the_next_text_frame() {
    let persister = Arc::new(FlakyPersister::failing(1));
    let harness = Harness::with_persister(persister.clone());
    let gateway = harness.gateway(GatewayConfig::default());
    let mut client = TestClient::connect(&gateway, harness.post_request("42", "u1"));
    settle().await;

    client.send_binary(PNG);
    client.send_json(json!({ "content": "draft" }));
    let error = client.next_json().await;
    assert_eq!(error["kind"], "dependency");

    // Nothing was published for the failed attempt.
    assert!(client.stays_quiet(Duration::from_millis(100)).await);

    client.send_json(json!({ "content": "final" }));
    let created = client.next_json().await;
    assert_eq!(created["action"], "create");
    assert_eq!(created["payload"]["text"], "final");
    assert_eq!(created["payload"]["attachments"].as_array().unwrap().len(), 1);

    let stored = harness.history(&Topic::entity("post", "42").unwrap()).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(persister.store_calls(), 2);
    assert_eq!(harness.blobs.len().await, 1);
}

#[tokio::test]
async fn bad_parent_discards_the_pending_item() {
    let harness = Harness::new();
    let gateway = harness.gateway(GatewayConfig::default());
    let mut on_42 = TestClient::connect(&gateway, harness.post_request("42", "u1"));
    let mut on_99 = TestClient::connect(&gateway, harness.post_request("99", "u1"));
    settle().await;

    on_99.send_json(json!({ "content": "elsewhere" }));
    let foreign_id = on_99.next_json().await["payload"]["id"].as_str().unwrap().to_string();

    on_42.send_binary(PNG);
    on_42.send_json(json!({ "content": "reply", "reply_to": foreign_id }));
    let error = on_42.next_json().await;
    assert_eq!(error["kind"], "validation");
    assert!(error["error"].as_str().unwrap().contains("another topic"));

    on_42.send_json(json!({ "content": "reply", "reply_to": "missing" }));
    assert!(on_42.next_json().await["error"].as_str().unwrap().contains("not found"));

    // The staged upload went with the discarded item.
    assert_eq!(harness.blobs.len().await, 0);

    on_42.send_json(json!({ "content": "fresh start" }));
    let created = on_42.next_json().await;
    assert_eq!(created["payload"]["text"], "fresh start");
    assert!(created["payload"]["attachments"].as_array().unwrap().is_empty());
    assert!(created["payload"].get("reply_to").is_none());

    on_42.send_json(json!({ "content": "threaded", "reply_to": created["payload"]["id"] }));
    let reply = on_42.next_json().await;
    assert_eq!(reply["payload"]["reply_to"], created["payload"]["id"]);
}

#[tokio::test]
async fn bad_frames_keep_the_connection_open() {
    let harness = Harness::new();
    let gateway = harness.gateway(GatewayConfig::default());
    let mut client = TestClient::connect(&gateway, harness.post_request("42", "u1"));
    settle().await;

    client.send_json(json!({ "content": "" }));
    assert_eq!(client.next_json().await["kind"], "validation");
    client.send_binary(b"plain text is not an image");
    assert!(
        client.next_json().await["error"]
            .as_str()
            .unwrap()
            .contains("unsupported")
    );

    client.send_json(json!({ "content": "still here" }));
    assert_eq!(client.next_json().await["payload"]["text"], "still here");
}

#[tokio::test]
async fn failed_client_write_ends_the_connection_and_frees_the_topic() {
    let harness = Harness::new();
    let gateway = harness.gateway(GatewayConfig::default());
    let mut gone = TestClient::connect(&gateway, harness.post_request("42", "u1"));
    let mut talker = TestClient::connect(&gateway, harness.post_request("42", "u2"));
    settle().await;

    gone.stop_reading();
    talker.send_json(json!({ "content": "anyone there?" }));
    assert_eq!(talker.next_json().await["payload"]["text"], "anyone there?");

    // The inbound side is still open; the failed write alone ends the session.
    assert!(gone.finished().await.is_ok());
    assert!(talker.hang_up().await.is_ok());
    assert!(harness.wait_for_released_topics().await);
}

#[tokio::test]
async fn setup_timeout_releases_a_subscription_already_taken() {
    let harness = Harness::new();
    let slow = Arc::new(SlowSubscribeBroker::new(
        harness.broker.clone(),
        Duration::from_millis(500),
    ));
    let config = GatewayConfig {
        setup_timeout_ms: 50,
        ..Default::default()
    };
    let gateway = harness.gateway_with_broker(config, slow);
    let mut client = TestClient::connect(&gateway, harness.post_request("42", "u1"));

    assert_eq!(client.next_json().await["kind"], "timeout");
    assert!(matches!(client.finished().await, Err(RealtimeError::Timeout)));
    assert!(harness.wait_for_released_topics().await);
}
