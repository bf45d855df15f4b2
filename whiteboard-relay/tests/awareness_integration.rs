//! Integration tests for presence relaying.
//!
//! Cursor and selection state travels as awareness frames and never
//! touches the room replica.

use serde_json::json;
use tokio::time::Duration;

use whiteboard_relay::{ClientEvent, RelayClient, RelayServer, ServerConfig};

/// Start a server with the given presence timing, return its base URL.
async fn start_test_server(awareness_timeout: Duration, sweep_interval: Duration) -> String {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        awareness_timeout,
        sweep_interval,
        ..ServerConfig::default()
    };
    let server = RelayServer::bind(config).await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    url
}

/// Poll a condition until it holds or two seconds pass.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..100 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        held
    }};
}

#[tokio::test]
async fn test_presence_update_reaches_peer() {
    let url = start_test_server(Duration::from_secs(30), Duration::from_secs(3)).await;
    let alice = RelayClient::connect(&url, "board").await.unwrap();
    let bob = RelayClient::connect(&url, "board").await.unwrap();
    let id = alice.client_id();

    alice.set_presence(&json!({"cursor": {"x": 10, "y": 20}})).await.unwrap();
    assert!(eventually!(bob.awareness_states().await.get(&id).is_some()));

    alice.set_presence(&json!({"cursor": {"x": 11, "y": 20}})).await.unwrap();
    assert!(eventually!(bob.presence(id).await == Some(json!({"cursor": {"x": 11, "y": 20}}))));
    assert!(bob.records().await.is_empty());
}

#[tokio::test]
async fn test_clear_presence_removes_entry() {
    let url = start_test_server(Duration::from_secs(30), Duration::from_secs(3)).await;
    let alice = RelayClient::connect(&url, "board").await.unwrap();
    let mut bob = RelayClient::connect(&url, "board").await.unwrap();
    let mut events = bob.take_event_rx().unwrap();
    let id = alice.client_id();

    alice.set_presence(&json!({})).await.unwrap();
    assert!(eventually!(bob.awareness_states().await.contains_key(&id)));

    alice.clear_presence().await.unwrap();
    assert!(eventually!(!bob.awareness_states().await.contains_key(&id)));

    let removed = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::Awareness(change) = event {
                if change.removed.contains(&id) {
                    return true;
                }
            }
        }
        false
    })
    .await;
    assert!(matches!(removed, Ok(true)));
}

#[tokio::test]
async fn test_stale_presence_expires() {
    let url = start_test_server(Duration::from_millis(300), Duration::from_millis(50)).await;
    let alice = RelayClient::connect(&url, "board").await.unwrap();
    let bob = RelayClient::connect(&url, "board").await.unwrap();
    let id = alice.client_id();

    alice.set_presence(&json!({"name": "alice"})).await.unwrap();
    assert!(eventually!(bob.awareness_states().await.contains_key(&id)));

    // No renewal: the relay tombstones the entry after the timeout
    assert!(eventually!(!bob.awareness_states().await.contains_key(&id)));
}

#[tokio::test]
async fn test_presence_is_per_room() {
    let url = start_test_server(Duration::from_secs(30), Duration::from_secs(3)).await;
    let alice = RelayClient::connect(&url, "one").await.unwrap();
    let bob = RelayClient::connect(&url, "two").await.unwrap();
    let carol = RelayClient::connect(&url, "one").await.unwrap();

    alice.set_presence(&json!({})).await.unwrap();
    assert!(eventually!(carol.awareness_states().await.contains_key(&alice.client_id())));
    assert!(bob.awareness_states().await.is_empty());
}
