//! Integration tests for document convergence through the registry.
//!
//! Clients talk to the registry over in-memory adapter pairs, so the whole
//! pipeline (handshake, state exchange, fan-out, teardown) runs without
//! sockets.

use std::sync::{Arc, Mutex};

use notes_realtime::{
    Binding, DocumentSyncSession, Identity, InMemoryNoteStore, MemoryAdapter, Message,
    MessageTransporter, RealtimeDocumentRegistry, RegistryConfig, SharedDocument, SyncOptions,
    TransporterConfig,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

fn registry_config() -> RegistryConfig {
    RegistryConfig {
        handshake_retry_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Client side of one connection: local replica, transporter, sync session.
struct Replica {
    document: Arc<SharedDocument>,
    transporter: MessageTransporter,
    sync: DocumentSyncSession,
    inbox: mpsc::UnboundedReceiver<Message>,
    _binding: Binding,
}

impl Replica {
    fn new() -> Self {
        let transporter = MessageTransporter::new(TransporterConfig {
            handshake_retry_interval: Duration::from_millis(20),
        });
        let (tx, inbox) = mpsc::unbounded_channel();
        let binding = transporter.on_message(move |m| {
            let _ = tx.send(m.clone());
        });
        let document = Arc::new(SharedDocument::new());
        let sync =
            DocumentSyncSession::new(document.clone(), transporter.clone(), SyncOptions::initiator())
                .unwrap();
        Self {
            document,
            transporter,
            sync,
            inbox,
            _binding: binding,
        }
    }

    /// Open a new in-memory connection to the registry.
    async fn attach(&self, registry: &Arc<RealtimeDocumentRegistry>, note: Uuid, can_edit: bool) {
        let (server_end, client_end) = MemoryAdapter::pair();
        let server = registry.new_transporter();
        server.set_adapter(server_end).unwrap();
        registry
            .connect(note, server, Identity::user("Tester", "tester"), can_edit)
            .await
            .unwrap();
        self.transporter.set_adapter(client_end).unwrap();
        self.transporter.mark_as_ready();
    }

    fn drain(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(m) = self.inbox.try_recv() {
            messages.push(m);
        }
        messages
    }
}

async fn until(what: &str, check: impl Fn() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_two_connections_see_each_others_insert() {
    let store = Arc::new(InMemoryNoteStore::new());
    let note = store.insert("Empty", None, "");
    let registry = RealtimeDocumentRegistry::new(registry_config(), store);

    let first = Replica::new();
    let second = Replica::new();
    first.attach(&registry, note.id, true).await;
    second.attach(&registry, note.id, true).await;
    until("both synced", || first.sync.is_synced() && second.sync.is_synced()).await;

    first.document.insert_text(0, "Hello").unwrap();
    until("second replica", || second.document.text() == "Hello").await;

    let session = registry.session(note.id).unwrap();
    assert_eq!(session.document().text(), "Hello");
    assert_eq!(session.connection_count(), 2);
}

#[tokio::test]
async fn test_reconnect_reconverges_without_replay() {
    let store = Arc::new(InMemoryNoteStore::new());
    let note = store.insert("Draft", None, "start");
    let registry = RealtimeDocumentRegistry::new(registry_config(), store);

    let steady = Replica::new();
    let mut flaky = Replica::new();
    steady.attach(&registry, note.id, true).await;
    flaky.attach(&registry, note.id, true).await;
    until("synced", || steady.sync.is_synced() && flaky.sync.is_synced()).await;

    flaky.transporter.disconnect();
    until("flaky down", || !flaky.transporter.is_connected()).await;
    let session = registry.session(note.id).unwrap();
    until("server released flaky", || session.connection_count() == 1).await;

    // Missed by the disconnected replica
    steady.document.insert_text(5, " [steady]").unwrap();
    until("server has steady edit", || session.document().text() == "start [steady]").await;

    // Made while offline; the send fails and the edit stays local
    flaky.document.insert_text(0, "[offline] ").unwrap();
    flaky.drain();

    flaky.attach(&registry, note.id, true).await;
    until("flaky resynced", || flaky.sync.is_synced()).await;
    until("all equal", || {
        let shared = session.document().text();
        shared == flaky.document.text() && shared == steady.document.text()
    })
    .await;

    let text = session.document().text();
    assert!(text.contains("[offline]"));
    assert!(text.contains("[steady]"));

    let received = flaky.drain();
    assert!(received
        .iter()
        .any(|m| matches!(m, Message::StateAnswer { .. })));
    assert!(!received
        .iter()
        .any(|m| matches!(m, Message::ContentUpdate { .. })));
}

#[tokio::test]
async fn test_fan_out_reaches_every_other_connection_once() {
    let store = Arc::new(InMemoryNoteStore::new());
    let note = store.insert("Shared", None, "");
    let registry = RealtimeDocumentRegistry::new(registry_config(), store);

    let mut replicas = Vec::new();
    for _ in 0..4 {
        let replica = Replica::new();
        replica.attach(&registry, note.id, true).await;
        replicas.push(replica);
    }
    until("all synced", || replicas.iter().all(|r| r.sync.is_synced())).await;
    sleep(Duration::from_millis(50)).await;
    for replica in replicas.iter_mut() {
        replica.drain();
    }

    replicas[0].document.insert_text(0, "x").unwrap();
    until("fan-out", || replicas.iter().all(|r| r.document.text() == "x")).await;
    sleep(Duration::from_millis(50)).await;

    let updates: Vec<usize> = replicas
        .iter_mut()
        .map(|r| {
            r.drain()
                .iter()
                .filter(|m| matches!(m, Message::ContentUpdate { .. }))
                .count()
        })
        .collect();
    assert_eq!(updates, vec![0, 1, 1, 1]);
}

#[tokio::test]
async fn test_read_only_connection_cannot_change_the_document() {
    let store = Arc::new(InMemoryNoteStore::new());
    let note = store.insert("Locked", None, "original");
    let registry = RealtimeDocumentRegistry::new(registry_config(), store);

    let editor = Replica::new();
    let reader = Replica::new();
    editor.attach(&registry, note.id, true).await;
    reader.attach(&registry, note.id, false).await;
    until("synced", || editor.sync.is_synced() && reader.sync.is_synced()).await;
    assert_eq!(reader.document.text(), "original");

    reader.document.insert_text(0, "vandal ").unwrap();
    sleep(Duration::from_millis(80)).await;
    let session = registry.session(note.id).unwrap();
    assert_eq!(session.document().text(), "original");
    assert_eq!(editor.document.text(), "original");

    editor.document.insert_text(8, "!").unwrap();
    until("reader sees editor", || reader.document.text().ends_with("original!")).await;
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let store = Arc::new(InMemoryNoteStore::new());
    let note = store.insert("Race", None, "0123456789");
    let registry = RealtimeDocumentRegistry::new(registry_config(), store);

    let replicas: Vec<Replica> = (0..3).map(|_| Replica::new()).collect();
    for replica in &replicas {
        replica.attach(&registry, note.id, true).await;
    }
    until("all synced", || replicas.iter().all(|r| r.sync.is_synced())).await;

    for round in 0..5u32 {
        for (i, replica) in replicas.iter().enumerate() {
            let at = (round + i as u32) % replica.document.len().max(1);
            replica.document.insert_text(at, &format!("<{i}>")).unwrap();
        }
    }

    let session = registry.session(note.id).unwrap();
    until("converged", || {
        let shared = session.document().text();
        replicas.iter().all(|r| r.document.text() == shared)
    })
    .await;
    assert_eq!(session.document().text().matches('<').count(), 15);
}

#[tokio::test]
async fn test_updates_converge_under_duplication_and_reordering() {
    let peers: Vec<SharedDocument> = (0..3).map(|_| SharedDocument::new()).collect();
    let log = Arc::new(Mutex::new(Vec::new()));
    let _subscriptions: Vec<_> = peers
        .iter()
        .map(|p| {
            let log = log.clone();
            p.observe_updates(move |update, origin| {
                if origin.is_none() {
                    log.lock().unwrap().push(update.to_vec());
                }
            })
            .unwrap()
        })
        .collect();

    for (i, peer) in peers.iter().enumerate() {
        peer.insert_text(0, &format!("peer{i};")).unwrap();
        peer.insert_text(0, "+").unwrap();
    }
    let updates = log.lock().unwrap().clone();
    assert_eq!(updates.len(), 6);

    let origin = yrs::Origin::from("replay");
    for (i, peer) in peers.iter().enumerate() {
        let mut order: Vec<&Vec<u8>> = updates.iter().collect();
        order.rotate_left(i * 2);
        order.reverse();
        for update in order.iter().chain(order.iter()) {
            peer.apply_update(update, &origin).unwrap();
        }
    }

    let text = peers[0].text();
    assert!(peers.iter().all(|p| p.text() == text));
    for i in 0..3 {
        assert!(text.contains(&format!("peer{i};")));
    }
}

#[tokio::test]
async fn test_teardown_then_fresh_load() {
    let store = Arc::new(InMemoryNoteStore::new());
    let note = store.insert("Cycle", None, "v1");
    let registry = RealtimeDocumentRegistry::new(registry_config(), store.clone());

    let replica = Replica::new();
    replica.attach(&registry, note.id, true).await;
    until("synced", || replica.sync.is_synced()).await;
    replica.document.insert_text(2, "+v2").unwrap();
    until("server edit", || {
        registry
            .session(note.id)
            .is_some_and(|s| s.document().text() == "v1+v2")
    })
    .await;

    replica.transporter.disconnect();
    until("disposed", || registry.session(note.id).is_none()).await;
    until("saved", || store.content(note.id).as_deref() == Some("v1+v2")).await;

    let late = Replica::new();
    late.attach(&registry, note.id, true).await;
    until("late synced", || late.sync.is_synced()).await;
    assert_eq!(late.document.text(), "v1+v2");
    assert_eq!(registry.stats().sessions_created, 2);
}
