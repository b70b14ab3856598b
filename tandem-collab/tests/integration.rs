//! End-to-end tests: a real coordinator and real client sessions over
//! localhost WebSockets, exercising the full sync pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tandem_collab::{
    ClientConfig, ClientError, CollabClient, Coordinator, CoordinatorConfig, ReconnectionConfig,
    SessionEvent, SessionState,
};
use tandem_ot::Schema;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Boot a coordinator on a free port; returns its address.
async fn start_test_server(mut config: CoordinatorConfig) -> (SocketAddr, Arc<Coordinator>) {
    config.host = "127.0.0.1".into();
    config.port = 0;
    config.sweep_interval = Duration::from_secs(3600); // keep sweeps out of tests
    let coordinator = Coordinator::new(config).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = coordinator.clone();
    tokio::spawn(async move {
        serving
            .serve_on(listener, std::future::pending())
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, coordinator)
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    let mut config = ClientConfig::new(format!("ws://{addr}"));
    config.reconnection = ReconnectionConfig {
        enabled: false,
        ..ReconnectionConfig::default()
    };
    config
}

async fn wait_for<T>(
    rx: &mut mpsc::Receiver<SessionEvent>,
    mut pick: impl FnMut(SessionEvent) -> Option<T>,
) -> T {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if let Some(out) = pick(event) {
                return out;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_client_connects_and_authenticates() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;
    let mut client = CollabClient::new(client_config(addr));
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.state().await, SessionState::Connected);
    wait_for(&mut events, |e| matches!(e, SessionEvent::Connected).then_some(())).await;
}

#[tokio::test]
async fn test_auth_gate_rejects_wrong_token() {
    let mut config = CoordinatorConfig::default();
    config.auth_required = true;
    config.auth_secret = Some("sesame".into());
    let (addr, _server) = start_test_server(config).await;

    let mut bad = client_config(addr);
    bad.token = Some("wrong".into());
    let client = CollabClient::new(bad);
    match client.connect().await {
        Err(ClientError::AuthFailed(_)) => {}
        other => panic!("expected auth failure, got {other:?}"),
    }

    let mut good = client_config(addr);
    good.token = Some("sesame".into());
    let client = CollabClient::new(good);
    client.connect().await.unwrap();
    assert_eq!(client.state().await, SessionState::Connected);
}

#[tokio::test]
async fn test_open_document_edit_and_ack() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;
    let mut client = CollabClient::new(client_config(addr));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let doc = client.open_document("notes", Schema::Text).await.unwrap();
    assert_eq!(doc.version(), 0);

    let op = doc.insert_text(0, "hello").unwrap();
    assert_eq!(doc.pending_len(), 1);

    let (acked_id, version) = wait_for(&mut events, |e| match e {
        SessionEvent::OperationAcknowledged {
            operation_id,
            version,
            ..
        } => Some((operation_id, version)),
        _ => None,
    })
    .await;
    assert_eq!(acked_id, op.id);
    assert_eq!(version, 1);
    assert_eq!(doc.pending_len(), 0);
    assert_eq!(doc.text().unwrap(), "hello");
    assert_eq!(doc.version(), 1);
}

#[tokio::test]
async fn test_open_document_is_idempotent() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;
    let client = CollabClient::new(client_config(addr));
    client.connect().await.unwrap();

    let first = client.open_document("doc", Schema::Text).await.unwrap();
    first.insert_text(0, "x").unwrap();
    let second = client.open_document("doc", Schema::Text).await.unwrap();
    // Same underlying state, not a fresh join.
    assert_eq!(second.text().unwrap(), "x");
}

#[tokio::test]
async fn test_two_clients_converge_on_text() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;

    let mut alice = CollabClient::new(client_config(addr));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    let alice_doc = alice.open_document("shared", Schema::Text).await.unwrap();

    let mut bob = CollabClient::new(client_config(addr));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    let bob_doc = bob.open_document("shared", Schema::Text).await.unwrap();

    alice_doc.insert_text(0, "from alice ").unwrap();
    wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::RemoteOperation { .. }).then_some(())
    })
    .await;

    bob_doc.insert_text(11, "and bob").unwrap();
    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::RemoteOperation { .. }).then_some(())
    })
    .await;

    assert_eq!(alice_doc.text().unwrap(), "from alice and bob");
    assert_eq!(alice_doc.text().unwrap(), bob_doc.text().unwrap());
}

#[tokio::test]
async fn test_concurrent_inserts_converge() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;

    let mut alice = CollabClient::new(client_config(addr));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    let alice_doc = alice.open_document("race", Schema::Text).await.unwrap();

    let mut bob = CollabClient::new(client_config(addr));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    let bob_doc = bob.open_document("race", Schema::Text).await.unwrap();

    // Both edit at base version 0 without waiting for each other.
    alice_doc.insert_text(0, "AAA").unwrap();
    bob_doc.insert_text(0, "BBB").unwrap();

    // Each side needs its ack and the other's rebased operation.
    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::RemoteOperation { .. }).then_some(())
    })
    .await;
    wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::RemoteOperation { .. }).then_some(())
    })
    .await;
    // Let any stragglers settle.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let left = alice_doc.text().unwrap();
    let right = bob_doc.text().unwrap();
    assert_eq!(left, right, "replicas diverged");
    assert_eq!(left.len(), 6);
    assert_eq!(alice_doc.version(), bob_doc.version());
}

#[tokio::test]
async fn test_per_author_fifo_order() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;

    let mut alice = CollabClient::new(client_config(addr));
    alice.connect().await.unwrap();
    let alice_doc = alice.open_document("fifo", Schema::Text).await.unwrap();

    let mut bob = CollabClient::new(client_config(addr));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    let bob_doc = bob.open_document("fifo", Schema::Text).await.unwrap();

    // A rapid typing burst from one author.
    let mut sent_ids = Vec::new();
    for (i, ch) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        sent_ids.push(alice_doc.insert_text(i, *ch).unwrap().id);
    }

    let mut seen_ids = Vec::new();
    while seen_ids.len() < sent_ids.len() {
        let id = wait_for(&mut bob_events, |e| match e {
            SessionEvent::RemoteOperation { operation, .. } => Some(operation.id),
            _ => None,
        })
        .await;
        seen_ids.push(id);
    }
    assert_eq!(seen_ids, sent_ids, "peer observed a different order");
    assert_eq!(bob_doc.text().unwrap(), "abcde");
}

#[tokio::test]
async fn test_map_document_and_version_monotonicity() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;

    let mut alice = CollabClient::new(client_config(addr));
    alice.connect().await.unwrap();
    let alice_doc = alice.open_document("settings", Schema::Map).await.unwrap();

    let mut bob = CollabClient::new(client_config(addr));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    let bob_doc = bob.open_document("settings", Schema::Map).await.unwrap();

    alice_doc.map_set("theme", json!("dark")).unwrap();
    alice_doc.map_set("size", json!(14)).unwrap();

    let mut versions = Vec::new();
    while versions.len() < 2 {
        let base = wait_for(&mut bob_events, |e| match e {
            SessionEvent::RemoteOperation { operation, .. } => Some(operation.base_version),
            _ => None,
        })
        .await;
        versions.push(base + 1);
    }
    let mut sorted = versions.clone();
    sorted.sort_unstable();
    assert_eq!(versions, sorted, "versions regressed");
    assert_eq!(bob_doc.map_get("theme").unwrap(), Some(json!("dark")));
    assert_eq!(bob_doc.map_get("size").unwrap(), Some(json!(14)));
}

#[tokio::test]
async fn test_presence_broadcast_excludes_originator() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;

    let mut alice = CollabClient::new(client_config(addr));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    let _alice_doc = alice.open_document("cursors", Schema::Text).await.unwrap();

    let mut bob = CollabClient::new(client_config(addr));
    bob.connect().await.unwrap();
    let _bob_doc = bob.open_document("cursors", Schema::Text).await.unwrap();

    bob.update_presence("cursors", Some(tandem_collab::Cursor::at(3)))
        .unwrap();

    let presence = wait_for(&mut alice_events, |e| match e {
        SessionEvent::PresenceUpdated { presence, .. } => Some(presence),
        _ => None,
    })
    .await;
    assert_eq!(presence.client_id, bob.client_id());
    assert!(presence.is_online);
    assert_eq!(presence.cursor.unwrap().position, 3);
}

#[tokio::test]
async fn test_user_joined_and_left_notifications() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;

    let mut alice = CollabClient::new(client_config(addr));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    let _doc = alice.open_document("room", Schema::Text).await.unwrap();

    let bob = CollabClient::new(client_config(addr));
    bob.connect().await.unwrap();
    let _bob_doc = bob.open_document("room", Schema::Text).await.unwrap();
    let bob_id = bob.client_id().to_string();

    let joined = wait_for(&mut alice_events, |e| match e {
        SessionEvent::UserJoined { user, .. } => Some(user.client_id),
        _ => None,
    })
    .await;
    assert_eq!(joined, bob_id);

    bob.disconnect().await;
    let left = wait_for(&mut alice_events, |e| match e {
        SessionEvent::UserLeft { client_id, .. } => Some(client_id),
        _ => None,
    })
    .await;
    assert_eq!(left, bob_id);
}

#[tokio::test]
async fn test_rejoin_after_reconnect_resyncs_state() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;

    // Seed server state through a first client.
    let seeder = CollabClient::new(client_config(addr));
    seeder.connect().await.unwrap();
    let seed_doc = seeder.open_document("durable", Schema::Text).await.unwrap();
    seed_doc.insert_text(0, "server text").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Second client joins, disconnects, reconnects.
    let mut client = CollabClient::new(client_config(addr));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let doc = client.open_document("durable", Schema::Text).await.unwrap();
    assert_eq!(doc.text().unwrap(), "server text");

    client.disconnect().await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected).then_some(())
    })
    .await;

    // While offline, local edits stay pending.
    doc.insert_text(0, "offline ").unwrap();
    assert_eq!(doc.pending_len(), 1);

    client.connect().await.unwrap();
    let version = wait_for(&mut events, |e| match e {
        SessionEvent::DocumentJoined { version, .. } => Some(version),
        _ => None,
    })
    .await;
    // The snapshot replaced local state; the offline edit was dropped, not
    // duplicated.
    assert_eq!(version, 1);
    assert_eq!(doc.text().unwrap(), "server text");
    assert_eq!(doc.pending_len(), 0);

    // The session is fully usable after the rejoin.
    doc.insert_text(0, "back ").unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::OperationAcknowledged { .. }).then_some(())
    })
    .await;
    assert_eq!(doc.text().unwrap(), "back server text");
}

#[tokio::test]
async fn test_http_surface() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;

    let client = CollabClient::new(client_config(addr));
    client.connect().await.unwrap();
    let doc = client.open_document("visible", Schema::Text).await.unwrap();
    doc.insert_text(0, "x").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let http = reqwest::Client::new();
    let health: serde_json::Value = http
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connectedClients"], 1);
    assert_eq!(health["activeDocuments"], 1);
    assert_eq!(health["totalOperations"], 1);

    let docs: serde_json::Value = http
        .get(format!("http://{addr}/documents"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(docs["documents"], json!(["visible"]));

    let info: serde_json::Value = http
        .get(format!("http://{addr}/documents/visible"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["id"], "visible");
    assert_eq!(info["version"], 1);
    assert_eq!(info["clientCount"], 1);

    let missing = http
        .get(format!("http://{addr}/documents/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ping_keepalive() {
    let (addr, _server) = start_test_server(CoordinatorConfig::default()).await;
    let client = CollabClient::new(client_config(addr));
    client.connect().await.unwrap();
    client.ping().unwrap();
    // The pong is consumed silently; the session must stay healthy.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state().await, SessionState::Connected);
}
