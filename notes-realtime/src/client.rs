//! WebSocket client for the realtime gateway.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Initial state reconciliation and live updates of a local document
//! - Cursor and activity presence
//! - Edits made while disconnected, folded in on the next connection
//!
//! Reconnecting attaches a fresh adapter to the same transporter. The local
//! document is kept, so nothing has to be replayed: the state exchange after
//! the handshake moves whatever each side is missing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::document::SharedDocument;
use crate::protocol::{CursorRange, Message, OwnUser, RealtimeUser};
use crate::sync::{DocumentSyncSession, SyncError, SyncOptions};
use crate::transport::handlers::lock;
use crate::transport::{Binding, WebSocketAdapter};
use crate::transporter::{MessageTransporter, TransporterConfig, TransporterError, TransporterEvent};

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Socket open
    Connected,
    /// Handshake complete, state exchange started
    Ready,
    /// Connection lost
    Disconnected,
    /// New presence snapshot from the server
    PresenceChanged {
        users: Vec<RealtimeUser>,
        own_user: OwnUser,
    },
    MetadataUpdated,
    /// The note was deleted; the server closes the connection next
    DocumentDeleted,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error(transparent)]
    Transporter(#[from] TransporterError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port/realtime/<note id or alias>`
    pub url: String,
    /// Sent as `Authorization: Bearer <token>`
    pub token: Option<String>,
    pub handshake_retry_interval: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            handshake_retry_interval: Duration::from_secs(1),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Default)]
struct Presence {
    users: Vec<RealtimeUser>,
    own_user: Option<OwnUser>,
}

/// Realtime client editing one note.
pub struct RealtimeClient {
    config: ClientConfig,
    document: Arc<SharedDocument>,
    transporter: MessageTransporter,
    sync: DocumentSyncSession,
    presence: Arc<Mutex<Presence>>,
    deleted: Arc<AtomicBool>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    bindings: Vec<Binding>,
}

impl RealtimeClient {
    /// Client with an empty local document.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_document(config, Arc::new(SharedDocument::new()))
    }

    pub fn with_document(
        config: ClientConfig,
        document: Arc<SharedDocument>,
    ) -> Result<Self, ClientError> {
        let transporter = MessageTransporter::new(TransporterConfig {
            handshake_retry_interval: config.handshake_retry_interval,
        });
        let sync =
            DocumentSyncSession::new(document.clone(), transporter.clone(), SyncOptions::initiator())?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let presence = Arc::new(Mutex::new(Presence::default()));
        let deleted = Arc::new(AtomicBool::new(false));

        let lifecycle = transporter.on_event({
            let event_tx = event_tx.clone();
            move |event| {
                let event = match event {
                    TransporterEvent::Connected => ClientEvent::Connected,
                    TransporterEvent::Ready => ClientEvent::Ready,
                    TransporterEvent::Disconnected => ClientEvent::Disconnected,
                };
                let _ = event_tx.send(event);
            }
        });
        let messages = transporter.on_message({
            let presence = presence.clone();
            let deleted = deleted.clone();
            move |message| {
                let event = match message {
                    Message::PresenceStateSet { users, own_user } => {
                        let mut current = lock(&presence);
                        current.users = users.clone();
                        current.own_user = Some(own_user.clone());
                        ClientEvent::PresenceChanged {
                            users: users.clone(),
                            own_user: own_user.clone(),
                        }
                    }
                    Message::MetadataUpdated => ClientEvent::MetadataUpdated,
                    Message::DocumentDeleted => {
                        deleted.store(true, Ordering::SeqCst);
                        ClientEvent::DocumentDeleted
                    }
                    _ => return,
                };
                let _ = event_tx.send(event);
            }
        });

        Ok(Self {
            config,
            document,
            transporter,
            sync,
            presence,
            deleted,
            event_rx: Some(event_rx),
            bindings: vec![lifecycle, messages],
        })
    }

    /// Take the event receiver. Only the first call returns it.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Open a websocket and attach it, replacing any previous connection.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::InvalidToken(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        log::info!("Connected to {}", self.config.url);

        let adapter = WebSocketAdapter::new(ws_stream);
        self.transporter.set_adapter(adapter.clone())?;
        self.transporter.mark_as_ready();
        adapter.start();
        Ok(())
    }

    /// Wait for the first state answer on the current connection.
    pub async fn wait_until_synced(&self, limit: Duration) -> bool {
        let waiting = async {
            while !self.sync.is_synced() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(limit, waiting).await.is_ok()
    }

    pub fn send_cursor(&self, cursor: Option<CursorRange>) -> Result<(), ClientError> {
        self.transporter
            .send_message(Message::PresenceSingleUpdate { cursor })?;
        Ok(())
    }

    pub fn set_active(&self, active: bool) -> Result<(), ClientError> {
        self.transporter
            .send_message(Message::PresenceActivity { active })?;
        Ok(())
    }

    pub fn request_presence(&self) -> Result<(), ClientError> {
        self.transporter
            .send_message(Message::PresenceStateRequest)?;
        Ok(())
    }

    /// Other users from the last presence snapshot.
    pub fn users(&self) -> Vec<RealtimeUser> {
        lock(&self.presence).users.clone()
    }

    pub fn own_user(&self) -> Option<OwnUser> {
        lock(&self.presence).own_user.clone()
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.document
    }

    pub fn transporter(&self) -> &MessageTransporter {
        &self.transporter
    }

    pub fn is_ready(&self) -> bool {
        self.transporter.is_ready()
    }

    pub fn is_synced(&self) -> bool {
        self.sync.is_synced()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn disconnect(&self) {
        self.transporter.disconnect();
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        for binding in &self.bindings {
            binding.unbind();
        }
        self.sync.destroy();
        self.transporter.disconnect();
    }
}
