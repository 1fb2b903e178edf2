//! Per-process registry of live document sessions.
//!
//! ```text
//! connect(doc, transporter, identity, can_edit)
//!    │
//!    ├── get_or_create_session(doc)   single-flight load from the NoteStore
//!    │
//!    └── add_connection(session, …)   sync session + presence + teardown hook
//!
//! Disconnected ──► release_connection ──► last one? ──► save, remove, retire
//! ```
//!
//! A session owns its [`SharedDocument`] and every connection on it. The
//! map lock is never held while a session lock is taken, and no lock is
//! held while sending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{watch, OnceCell};
use uuid::Uuid;

use crate::collaborators::{CollaboratorError, Identity, NoteStore};
use crate::document::SharedDocument;
use crate::presence::{PresencePolicy, PresenceRoom};
use crate::protocol::{CursorRange, DocumentId, Message};
use crate::sync::{DocumentSyncSession, SyncError, SyncOptions};
use crate::transport::handlers::lock;
use crate::transport::{Binding, ConnectionState};
use crate::transporter::{MessageTransporter, TransporterConfig, TransporterEvent};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Handshake retry period of server-side transporters
    pub handshake_retry_interval: Duration,
    pub presence_policy: PresencePolicy,
    /// Write the document back to the note store when its last connection leaves
    pub save_on_dispose: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            handshake_retry_interval: Duration::from_secs(1),
            presence_policy: PresencePolicy::Everyone,
            save_on_dispose: true,
        }
    }
}

impl RegistryConfig {
    pub fn transporter_config(&self) -> TransporterConfig {
        TransporterConfig {
            handshake_retry_interval: self.handshake_retry_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to load document {id}: {source}")]
    Load {
        id: DocumentId,
        #[source]
        source: CollaboratorError,
    },
    #[error("Session for document {0} was disposed")]
    Disposed(DocumentId),
    #[error("Connection closed before it was admitted")]
    ConnectionClosed,
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub live_sessions: usize,
    pub live_connections: usize,
    pub sessions_created: u64,
    pub sessions_disposed: u64,
    pub connections_admitted: u64,
    pub connections_closed: u64,
}

#[derive(Default)]
struct Counters {
    sessions_created: AtomicU64,
    sessions_disposed: AtomicU64,
    connections_admitted: AtomicU64,
    connections_closed: AtomicU64,
}

/// Public view of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub identity: Identity,
    pub can_edit: bool,
    pub style_index: u8,
    pub cursor: Option<CursorRange>,
    pub active: bool,
}

struct ConnectionEntry {
    transporter: MessageTransporter,
    identity: Identity,
    can_edit: bool,
    sync: DocumentSyncSession,
    bindings: Vec<Binding>,
}

impl ConnectionEntry {
    fn close(self) {
        self.sync.destroy();
        for binding in &self.bindings {
            binding.unbind();
        }
    }
}

#[derive(Default)]
struct SessionState {
    connections: HashMap<Uuid, ConnectionEntry>,
    presence: PresenceRoom,
    disposed: bool,
    deleted: bool,
}

/// One live document and the connections editing it.
pub struct DocumentSession {
    document_id: DocumentId,
    document: Arc<SharedDocument>,
    created_at: Instant,
    policy: PresencePolicy,
    state: Mutex<SessionState>,
    retired: watch::Sender<bool>,
}

impl DocumentSession {
    fn new(document_id: DocumentId, document: SharedDocument, policy: PresencePolicy) -> Self {
        Self {
            document_id,
            document: Arc::new(document),
            created_at: Instant::now(),
            policy,
            state: Mutex::new(SessionState::default()),
            retired: watch::Sender::new(false),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.document
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Disposed sessions accept no new connections.
    pub fn is_disposed(&self) -> bool {
        lock(&self.state).disposed
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = lock(&self.state);
        state
            .presence
            .participants()
            .iter()
            .filter_map(|p| {
                let entry = state.connections.get(&p.connection_id)?;
                Some(ConnectionInfo {
                    id: p.connection_id,
                    identity: entry.identity.clone(),
                    can_edit: entry.can_edit,
                    style_index: p.style_index,
                    cursor: p.cursor,
                    active: p.active,
                })
            })
            .collect()
    }

    /// Send `message` to every connection. Returns how many accepted it.
    pub fn broadcast(&self, message: &Message) -> usize {
        let transporters: Vec<MessageTransporter> = lock(&self.state)
            .connections
            .values()
            .map(|c| c.transporter.clone())
            .collect();
        let mut delivered = 0;
        for transporter in transporters {
            match transporter.send_message(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => log::debug!("{} not delivered: {e}", message.kind()),
            }
        }
        delivered
    }

    /// Disconnect every connection. Teardown follows from their close events.
    pub fn disconnect_all(&self) {
        let transporters: Vec<MessageTransporter> = lock(&self.state)
            .connections
            .values()
            .map(|c| c.transporter.clone())
            .collect();
        for transporter in transporters {
            transporter.disconnect();
        }
    }

    fn handle_presence(&self, connection_id: Uuid, message: &Message) {
        match message {
            Message::PresenceSingleUpdate { cursor } => {
                let changed = lock(&self.state)
                    .presence
                    .update_cursor(connection_id, *cursor, self.policy);
                if changed {
                    self.broadcast_presence(Some(connection_id));
                }
            }
            Message::PresenceActivity { active } => {
                let changed = lock(&self.state)
                    .presence
                    .set_active(connection_id, *active, self.policy);
                if changed {
                    self.broadcast_presence(Some(connection_id));
                }
            }
            Message::PresenceStateRequest => self.push_presence(connection_id),
            _ => {}
        }
    }

    fn push_presence(&self, connection_id: Uuid) {
        let outgoing = {
            let state = lock(&self.state);
            let transporter = state
                .connections
                .get(&connection_id)
                .map(|c| c.transporter.clone());
            transporter.zip(state.presence.snapshot_for(connection_id))
        };
        if let Some((transporter, snapshot)) = outgoing {
            if let Err(e) = transporter.send_message(snapshot) {
                log::debug!("Presence snapshot not delivered: {e}");
            }
        }
    }

    /// Send every connection except `skip` its own snapshot.
    fn broadcast_presence(&self, skip: Option<Uuid>) {
        let outgoing: Vec<(MessageTransporter, Message)> = {
            let state = lock(&self.state);
            state
                .connections
                .iter()
                .filter(|(id, _)| Some(**id) != skip)
                .filter_map(|(id, c)| {
                    let snapshot = state.presence.snapshot_for(*id)?;
                    Some((c.transporter.clone(), snapshot))
                })
                .collect()
        };
        for (transporter, snapshot) in outgoing {
            if let Err(e) = transporter.send_message(snapshot) {
                log::debug!("Presence snapshot not delivered: {e}");
            }
        }
    }

    /// Remove a connection. Returns `Some(true)` when it was the last one
    /// and the session is now disposed.
    fn remove_connection(&self, connection_id: Uuid) -> Option<bool> {
        let (entry, last) = {
            let mut state = lock(&self.state);
            let entry = state.connections.remove(&connection_id)?;
            state.presence.leave(connection_id);
            let last = state.connections.is_empty() && !state.disposed;
            if last {
                state.disposed = true;
            }
            (entry, last)
        };
        entry.close();
        if !last {
            self.broadcast_presence(None);
        }
        Some(last)
    }

    fn retire(&self) {
        self.retired.send_replace(true);
    }

    async fn wait_retired(&self) {
        let mut retired = self.retired.subscribe();
        let _ = retired.wait_for(|r| *r).await;
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("document_id", &self.document_id)
            .field("connections", &self.connection_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Result of [`RealtimeDocumentRegistry::connect`].
#[derive(Debug, Clone)]
pub struct Admission {
    pub session: Arc<DocumentSession>,
    pub connection_id: Uuid,
}

type PendingSession = Arc<OnceCell<Arc<DocumentSession>>>;

/// Owns every live [`DocumentSession`] of the process.
pub struct RealtimeDocumentRegistry {
    config: RegistryConfig,
    note_store: Arc<dyn NoteStore>,
    sessions: Mutex<HashMap<DocumentId, Arc<DocumentSession>>>,
    pending: Mutex<HashMap<DocumentId, PendingSession>>,
    counters: Counters,
}

impl RealtimeDocumentRegistry {
    pub fn new(config: RegistryConfig, note_store: Arc<dyn NoteStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            note_store,
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn note_store(&self) -> &Arc<dyn NoteStore> {
        &self.note_store
    }

    /// Transporter configured for server-side connections.
    pub fn new_transporter(&self) -> MessageTransporter {
        MessageTransporter::new(self.config.transporter_config())
    }

    /// Live session of `document_id`, if any.
    pub fn session(&self, document_id: DocumentId) -> Option<Arc<DocumentSession>> {
        lock(&self.sessions)
            .get(&document_id)
            .filter(|s| !s.is_disposed())
            .cloned()
    }

    /// Return the live session or load the document and create one.
    ///
    /// Concurrent calls for one document share a single load. A failed load
    /// leaves nothing behind.
    pub async fn get_or_create_session(
        &self,
        document_id: DocumentId,
    ) -> Result<Arc<DocumentSession>, RegistryError> {
        loop {
            let existing = lock(&self.sessions).get(&document_id).cloned();
            match existing {
                Some(session) if !session.is_disposed() => return Ok(session),
                // Wait until the previous session is saved and gone
                Some(session) => session.wait_retired().await,
                None => break,
            }
        }

        let cell = lock(&self.pending)
            .entry(document_id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_try_init(|| self.create_session(document_id))
            .await
            .cloned();

        {
            let mut pending = lock(&self.pending);
            if pending
                .get(&document_id)
                .is_some_and(|c| Arc::ptr_eq(c, &cell))
            {
                pending.remove(&document_id);
            }
        }
        result
    }

    async fn create_session(
        &self,
        document_id: DocumentId,
    ) -> Result<Arc<DocumentSession>, RegistryError> {
        if let Some(session) = self.session(document_id) {
            return Ok(session);
        }
        let content = self
            .note_store
            .load_content(document_id)
            .await
            .map_err(|source| {
                log::error!("Failed to load document {document_id}: {source}");
                RegistryError::Load {
                    id: document_id,
                    source,
                }
            })?;

        let session = Arc::new(DocumentSession::new(
            document_id,
            SharedDocument::from_content(&content),
            self.config.presence_policy,
        ));
        lock(&self.sessions).insert(document_id, session.clone());
        self.counters.sessions_created.fetch_add(1, Ordering::Relaxed);
        log::info!("Created document session {document_id}");
        Ok(session)
    }

    /// Admit a connection whose transporter already carries an adapter.
    pub fn add_connection(
        self: &Arc<Self>,
        session: &Arc<DocumentSession>,
        transporter: MessageTransporter,
        identity: Identity,
        can_edit: bool,
    ) -> Result<Uuid, RegistryError> {
        if transporter.state() == ConnectionState::Disconnected {
            return Err(RegistryError::ConnectionClosed);
        }
        if session.is_disposed() {
            return Err(RegistryError::Disposed(session.document_id));
        }

        let connection_id = Uuid::new_v4();
        let options = if can_edit {
            SyncOptions::initiator()
        } else {
            SyncOptions::read_only()
        };
        let sync = DocumentSyncSession::new(session.document.clone(), transporter.clone(), options)?;

        let weak_session = Arc::downgrade(session);
        let presence = transporter.on_message({
            let weak_session = weak_session.clone();
            move |message| {
                if let Some(session) = weak_session.upgrade() {
                    session.handle_presence(connection_id, message);
                }
            }
        });
        let lifecycle = transporter.on_event({
            let weak_registry = Arc::downgrade(self);
            move |event| match event {
                TransporterEvent::Ready => {
                    if let Some(session) = weak_session.upgrade() {
                        session.push_presence(connection_id);
                    }
                }
                TransporterEvent::Disconnected => {
                    Self::schedule_release(&weak_registry, &weak_session, connection_id)
                }
                TransporterEvent::Connected => {}
            }
        });

        let entry = ConnectionEntry {
            transporter: transporter.clone(),
            identity: identity.clone(),
            can_edit,
            sync,
            bindings: vec![presence, lifecycle],
        };
        let admitted = {
            let mut state = lock(&session.state);
            if state.disposed {
                Err(entry)
            } else {
                let style_index = state.presence.join(
                    connection_id,
                    identity.display_name.clone(),
                    identity.username.clone(),
                    can_edit,
                );
                state.connections.insert(connection_id, entry);
                Ok(style_index)
            }
        };
        let style_index = match admitted {
            Ok(style_index) => style_index,
            Err(entry) => {
                entry.close();
                return Err(RegistryError::Disposed(session.document_id));
            }
        };

        self.counters
            .connections_admitted
            .fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Connection {connection_id} ({}) admitted to {} with {} access, style {style_index}",
            identity.display_name,
            session.document_id,
            if can_edit { "write" } else { "read" },
        );

        session.broadcast_presence(Some(connection_id));
        transporter.mark_as_ready();
        if transporter.state() == ConnectionState::Disconnected {
            Self::schedule_release(&Arc::downgrade(self), &Arc::downgrade(session), connection_id);
        }
        Ok(connection_id)
    }

    /// Get or create the session and admit the connection, retrying once if
    /// the session was disposed in between.
    pub async fn connect(
        self: &Arc<Self>,
        document_id: DocumentId,
        transporter: MessageTransporter,
        identity: Identity,
        can_edit: bool,
    ) -> Result<Admission, RegistryError> {
        let mut retried = false;
        loop {
            let session = self.get_or_create_session(document_id).await?;
            match self.add_connection(&session, transporter.clone(), identity.clone(), can_edit) {
                Ok(connection_id) => {
                    return Ok(Admission {
                        session,
                        connection_id,
                    })
                }
                Err(RegistryError::Disposed(_)) if !retried => {
                    log::debug!("Session {document_id} disposed during admission, retrying");
                    retried = true;
                }
                Err(e) => {
                    self.dispose_if_idle(&session).await;
                    return Err(e);
                }
            }
        }
    }

    fn schedule_release(
        registry: &Weak<Self>,
        session: &Weak<DocumentSession>,
        connection_id: Uuid,
    ) {
        let (Some(registry), Some(session)) = (registry.upgrade(), session.upgrade()) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    registry.release_connection(&session, connection_id).await;
                });
            }
            Err(_) => log::warn!("No runtime to release connection {connection_id}"),
        }
    }

    async fn release_connection(&self, session: &Arc<DocumentSession>, connection_id: Uuid) {
        let Some(last) = session.remove_connection(connection_id) else {
            return;
        };
        self.counters
            .connections_closed
            .fetch_add(1, Ordering::Relaxed);
        log::info!("Connection {connection_id} left {}", session.document_id);
        if last {
            self.dispose(session).await;
        }
    }

    async fn dispose_if_idle(&self, session: &Arc<DocumentSession>) {
        let idle = {
            let mut state = lock(&session.state);
            let idle = state.connections.is_empty() && !state.disposed;
            if idle {
                state.disposed = true;
            }
            idle
        };
        if idle {
            self.dispose(session).await;
        }
    }

    async fn dispose(&self, session: &Arc<DocumentSession>) {
        let document_id = session.document_id;
        let deleted = lock(&session.state).deleted;
        if self.config.save_on_dispose && !deleted {
            let content = session.document.text();
            if let Err(e) = self.note_store.save_content(document_id, &content).await {
                log::error!("Failed to save document {document_id}: {e}");
            }
        }
        {
            let mut sessions = lock(&self.sessions);
            if sessions
                .get(&document_id)
                .is_some_and(|s| Arc::ptr_eq(s, session))
            {
                sessions.remove(&document_id);
            }
        }
        session.retire();
        self.counters.sessions_disposed.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Disposed document session {document_id} after {:?}",
            session.created_at.elapsed()
        );
    }

    /// Tell every connection of the document that its metadata changed.
    pub fn notify_metadata_updated(&self, document_id: DocumentId) -> usize {
        self.session(document_id)
            .map_or(0, |s| s.broadcast(&Message::MetadataUpdated))
    }

    /// Announce deletion and disconnect everyone. The content is not saved.
    pub fn close_document(&self, document_id: DocumentId) -> bool {
        let Some(session) = self.session(document_id) else {
            return false;
        };
        lock(&session.state).deleted = true;
        session.broadcast(&Message::DocumentDeleted);
        session.disconnect_all();
        log::info!("Closed document {document_id}");
        true
    }

    /// Disconnect every connection of every session.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<DocumentSession>> = lock(&self.sessions).values().cloned().collect();
        log::info!("Shutting down {} document sessions", sessions.len());
        for session in sessions {
            session.disconnect_all();
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions: Vec<Arc<DocumentSession>> = lock(&self.sessions).values().cloned().collect();
        RegistryStats {
            live_sessions: sessions.iter().filter(|s| !s.is_disposed()).count(),
            live_connections: sessions.iter().map(|s| s.connection_count()).sum(),
            sessions_created: self.counters.sessions_created.load(Ordering::Relaxed),
            sessions_disposed: self.counters.sessions_disposed.load(Ordering::Relaxed),
            connections_admitted: self.counters.connections_admitted.load(Ordering::Relaxed),
            connections_closed: self.counters.connections_closed.load(Ordering::Relaxed),
        }
    }
}
