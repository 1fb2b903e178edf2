//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real gateway and connect real clients,
//! verifying the full pipeline over tokio-tungstenite.

use std::sync::Arc;

use futures_util::StreamExt;
use notes_realtime::{
    AccessLevel, ClientConfig, ClientEvent, CursorRange, GatewayConfig, GrantTable, Identity,
    InMemoryNoteStore, NoteRecord, RealtimeClient, RealtimeGateway, RegistryConfig,
    TokenAuthenticator,
};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct TestServer {
    port: u16,
    gateway: Arc<RealtimeGateway>,
    store: Arc<InMemoryNoteStore>,
    note: NoteRecord,
    owner_token: &'static str,
    reader_token: &'static str,
}

impl TestServer {
    fn url(&self, note: &str) -> String {
        format!("ws://127.0.0.1:{}/realtime/{note}", self.port)
    }

    fn client(&self, token: Option<&str>) -> RealtimeClient {
        let mut config = ClientConfig::new(self.url(&self.note.id.to_string()));
        config.handshake_retry_interval = Duration::from_millis(50);
        config.token = token.map(str::to_string);
        RealtimeClient::new(config).unwrap()
    }
}

/// Start a gateway on a free port with one note owned by the owner token.
async fn start_test_server() -> TestServer {
    let store = Arc::new(InMemoryNoteStore::new());
    let owner = Identity::user("Olivia", "olivia");
    let reader = Identity::user("Ray", "ray");
    let note = store.insert_owned("Groceries", Some("groceries"), "- bread\n", owner.user_id);

    let authenticator = Arc::new(TokenAuthenticator::new(true));
    authenticator.register("owner-token", owner);
    authenticator.register("reader-token", reader.clone());

    let permissions = Arc::new(GrantTable::new(AccessLevel::Denied));
    permissions.grant(reader.user_id.unwrap(), note.id, AccessLevel::Read);

    let config = GatewayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        registry: RegistryConfig {
            handshake_retry_interval: Duration::from_millis(50),
            ..Default::default()
        },
    };
    let gateway = RealtimeGateway::new(config, store.clone(), permissions, authenticator);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let serving = gateway.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    TestServer {
        port,
        gateway,
        store,
        note,
        owner_token: "owner-token",
        reader_token: "reader-token",
    }
}

async fn until(what: &str, check: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_client_receives_note_content() {
    let server = start_test_server().await;
    let mut client = server.client(Some(server.owner_token));
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();
    assert!(client.wait_until_synced(Duration::from_secs(5)).await);
    assert_eq!(client.document().text(), "- bread\n");

    let first = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert_eq!(first, Some(ClientEvent::Connected));
    assert_eq!(server.gateway.accepted_connections(), 1);
}

#[tokio::test]
async fn test_edits_flow_between_clients() {
    let server = start_test_server().await;
    let alice = server.client(Some(server.owner_token));
    let guest_url = server.url("groceries");
    let mut guest_config = ClientConfig::new(guest_url).with_token(server.owner_token);
    guest_config.handshake_retry_interval = Duration::from_millis(50);
    let bob = RealtimeClient::new(guest_config).unwrap();

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    assert!(alice.wait_until_synced(Duration::from_secs(5)).await);
    assert!(bob.wait_until_synced(Duration::from_secs(5)).await);

    alice.document().insert_text(8, "- milk\n").unwrap();
    until("bob sees milk", || bob.document().text() == "- bread\n- milk\n").await;

    bob.document().insert_text(0, "# List\n").unwrap();
    until("alice sees title", || {
        alice.document().text() == "# List\n- bread\n- milk\n"
    })
    .await;
}

#[tokio::test]
async fn test_presence_over_websocket() {
    let server = start_test_server().await;
    let owner = server.client(Some(server.owner_token));
    let reader = server.client(Some(server.reader_token));

    owner.connect().await.unwrap();
    assert!(owner.wait_until_synced(Duration::from_secs(5)).await);
    reader.connect().await.unwrap();
    assert!(reader.wait_until_synced(Duration::from_secs(5)).await);

    until("owner sees reader", || {
        owner.users().iter().any(|u| u.display_name == "Ray")
    })
    .await;

    owner.send_cursor(Some(CursorRange::selection(2, 7))).unwrap();
    until("reader sees selection", || {
        reader
            .users()
            .iter()
            .any(|u| u.display_name == "Olivia" && u.cursor == Some(CursorRange::selection(2, 7)))
    })
    .await;
    assert_eq!(reader.own_user().map(|u| u.display_name), Some("Ray".to_string()));
}

#[tokio::test]
async fn test_reader_edits_do_not_reach_the_server() {
    let server = start_test_server().await;
    let owner = server.client(Some(server.owner_token));
    let reader = server.client(Some(server.reader_token));
    owner.connect().await.unwrap();
    reader.connect().await.unwrap();
    assert!(owner.wait_until_synced(Duration::from_secs(5)).await);
    assert!(reader.wait_until_synced(Duration::from_secs(5)).await);

    reader.document().insert_text(0, "spam ").unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(owner.document().text(), "- bread\n");
    let session = server.gateway.registry().session(server.note.id).unwrap();
    assert_eq!(session.document().text(), "- bread\n");
}

#[tokio::test]
async fn test_rejected_connections() {
    let server = start_test_server().await;

    // Unknown path fails the upgrade
    let bad_path = format!("ws://127.0.0.1:{}/api/notes", server.port);
    assert!(tokio_tungstenite::connect_async(bad_path).await.is_err());

    // Unknown note and anonymous access are closed with a close frame
    for url in [
        server.url("no-such-note"),
        server.url(&server.note.id.to_string()),
        format!("{}?token=forged", server.url("groceries")),
    ] {
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let frame = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
        match frame {
            Some(Ok(WsMessage::Close(Some(close)))) => {
                assert!(!close.reason.is_empty());
            }
            Some(Ok(WsMessage::Close(None))) | None | Some(Err(_)) => {}
            other => panic!("expected close, got {other:?}"),
        }
    }
    assert!(server.gateway.registry().session(server.note.id).is_none());
}

#[tokio::test]
async fn test_query_token_is_accepted() {
    let server = start_test_server().await;
    let url = format!("{}?token={}", server.url("groceries"), server.owner_token);
    let mut config = ClientConfig::new(url);
    config.handshake_retry_interval = Duration::from_millis(50);
    let client = RealtimeClient::new(config).unwrap();

    client.connect().await.unwrap();
    assert!(client.wait_until_synced(Duration::from_secs(5)).await);
    let connections = server
        .gateway
        .registry()
        .session(server.note.id)
        .unwrap()
        .connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].identity.display_name, "Olivia");
    assert!(connections[0].can_edit);
}

#[tokio::test]
async fn test_reconnect_folds_in_offline_edits() {
    let server = start_test_server().await;
    let steady = server.client(Some(server.owner_token));
    let flaky = server.client(Some(server.owner_token));
    steady.connect().await.unwrap();
    flaky.connect().await.unwrap();
    assert!(steady.wait_until_synced(Duration::from_secs(5)).await);
    assert!(flaky.wait_until_synced(Duration::from_secs(5)).await);

    flaky.disconnect();
    until("flaky down", || !flaky.transporter().is_connected()).await;

    steady.document().insert_text(8, "- eggs\n").unwrap();
    flaky.document().insert_text(0, "TODO\n").unwrap();

    flaky.connect().await.unwrap();
    assert!(flaky.wait_until_synced(Duration::from_secs(5)).await);
    until("converged", || {
        steady.document().text() == flaky.document().text()
            && steady.document().text().contains("TODO")
            && steady.document().text().contains("eggs")
    })
    .await;
}

#[tokio::test]
async fn test_deleted_note_disconnects_clients() {
    let server = start_test_server().await;
    let mut client = server.client(Some(server.owner_token));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert!(client.wait_until_synced(Duration::from_secs(5)).await);

    assert!(server.gateway.registry().close_document(server.note.id));
    let deleted = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if event == ClientEvent::DocumentDeleted {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(deleted);
    assert!(client.is_deleted());
    until("client closed", || !client.transporter().is_connected()).await;
    until("session gone", || {
        server.gateway.registry().session(server.note.id).is_none()
    })
    .await;
    assert_eq!(server.store.save_count(), 0);
}

#[tokio::test]
async fn test_last_client_leaving_saves_content() {
    let server = start_test_server().await;
    let client = server.client(Some(server.owner_token));
    client.connect().await.unwrap();
    assert!(client.wait_until_synced(Duration::from_secs(5)).await);

    client.document().insert_text(8, "- jam\n").unwrap();
    until("server has jam", || {
        server
            .gateway
            .registry()
            .session(server.note.id)
            .is_some_and(|s| s.document().text().contains("jam"))
    })
    .await;

    drop(client);
    until("saved", || {
        server.store.content(server.note.id).as_deref() == Some("- bread\n- jam\n")
    })
    .await;
}
