//! Endpoint integration: a real server/client pair over loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use gator::domain::errors::{GatorError, GatorResult};
use gator::domain::ports::ActionHandler;
use gator::infrastructure::protocol::{client, WsClient, WsServer};

/// Records posted payloads and answers `echo` and `slow` requests.
struct TestHandler {
    posted: tokio::sync::Mutex<Vec<Value>>,
}

impl TestHandler {
    fn new() -> Self {
        Self {
            posted: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ActionHandler for TestHandler {
    async fn handle(&self, action: &str, payload: Value) -> GatorResult<Value> {
        match action {
            "echo" => Ok(payload),
            "slow" => {
                let delay = payload["delay_ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(payload)
            }
            "note" => {
                self.posted.lock().await.push(payload);
                Ok(json!({}))
            }
            other => Err(GatorError::Protocol(format!("unknown action '{other}'"))),
        }
    }
}

async fn endpoint() -> (WsServer, Arc<TestHandler>) {
    let handler = Arc::new(TestHandler::new());
    let server = WsServer::bind(handler.clone()).await.expect("bind failed");
    (server, handler)
}

#[tokio::test]
async fn test_call_round_trip() {
    let (server, _handler) = endpoint().await;
    let client = WsClient::connect(&server.address(), None).await.unwrap();

    let reply = client
        .call("echo", json!({"value": 42}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply["value"], 42);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_posted_request_reaches_handler_without_reply() {
    let (server, handler) = endpoint().await;
    let client = WsClient::connect(&server.address(), None).await.unwrap();

    client.post("note", json!({"n": 1})).await.unwrap();
    client.post("note", json!({"n": 2})).await.unwrap();

    // A follow-up call flushes the connection, proving the posts landed.
    client
        .call("echo", json!({}), Duration::from_secs(5))
        .await
        .unwrap();
    let posted = handler.posted.lock().await;
    assert_eq!(posted.len(), 2);
    assert_eq!(posted[0]["n"], 1);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_action_yields_error_and_connection_survives() {
    let (server, _handler) = endpoint().await;
    let client = WsClient::connect(&server.address(), None).await.unwrap();

    let err = client
        .call("nonsense", json!({}), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nonsense"));

    // The same connection still services requests.
    let reply = client
        .call("echo", json!({"alive": true}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply["alive"], true);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_multiple_outstanding_requests_correlate() {
    let (server, _handler) = endpoint().await;
    let client = Arc::new(WsClient::connect(&server.address(), None).await.unwrap());

    // Two requests are in flight at once; correlation by req_id must keep
    // the answers straight regardless of completion order.
    let slow = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call("slow", json!({"delay_ms": 200, "tag": "slow"}), Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = client
        .call("echo", json!({"tag": "fast"}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(fast["tag"], "fast");

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow["tag"], "slow");

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_request_once_helper() {
    let (server, _handler) = endpoint().await;
    let reply = client::request_once(
        &server.address(),
        "echo",
        json!({"oneshot": true}),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(reply["oneshot"], true);
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_stays_open() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    let (server, _handler) = endpoint().await;
    let (mut socket, _) = connect_async(format!("ws://{}/", server.address()))
        .await
        .unwrap();

    socket.send(Message::text("this is not json")).await.unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["result"], "error");

    // A missing action is a decode error too, posted or not.
    socket
        .send(Message::text("{\"posted\": true, \"payload\": {}}"))
        .await
        .unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["result"], "error");

    // The connection is still serviceable afterwards.
    socket
        .send(Message::text(
            "{\"action\": \"echo\", \"req_id\": 9, \"payload\": {\"ok\": 1}}",
        ))
        .await
        .unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["result"], "success");
    assert_eq!(reply["rsp_id"], 9);

    server.stop().await;
}

#[tokio::test]
async fn test_connect_with_backoff_eventually_fails() {
    // Nothing listens on this port; all attempts must be exhausted.
    let result = WsClient::connect_with_backoff(
        "127.0.0.1:9",
        None,
        2,
        Duration::from_millis(10),
        Duration::from_millis(20),
    )
    .await;
    assert!(matches!(result, Err(GatorError::Transport(_))));
}
