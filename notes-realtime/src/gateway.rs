//! WebSocket entry point for realtime connections.
//!
//! ```text
//! TCP accept ──► upgrade /realtime/<note> ──► authenticate ──► find note
//!                                                                  │
//!        registry.connect ◄── transporter ◄── adapter ◄── access level
//! ```
//!
//! A rejected upgrade gets an HTTP error. A request that fails after the
//! upgrade is closed with a policy close frame.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::collaborators::{
    AccessLevel, Authenticator, CollaboratorError, Identity, NoteRecord, NoteStore, PermissionCheck,
};
use crate::registry::{RealtimeDocumentRegistry, RegistryConfig, RegistryError};
use crate::transport::{TransportAdapter, WebSocketAdapter};
use crate::transporter::TransporterError;

/// Path prefix of realtime websocket upgrades.
pub const REALTIME_PATH: &str = "/realtime/";

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub registry: RegistryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            registry: RegistryConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden by `NOTES_BIND_ADDR`, `NOTES_HANDSHAKE_RETRY_MS`
    /// and `NOTES_PRESENCE_POLICY`.
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GatewayError> {
        let mut config = Self::default();
        if let Some(addr) = lookup("NOTES_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(ms) = lookup("NOTES_HANDSHAKE_RETRY_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|e| GatewayError::Config(format!("NOTES_HANDSHAKE_RETRY_MS: {e}")))?;
            if ms == 0 {
                return Err(GatewayError::Config(
                    "NOTES_HANDSHAKE_RETRY_MS must be positive".into(),
                ));
            }
            config.registry.handshake_retry_interval = Duration::from_millis(ms);
        }
        if let Some(policy) = lookup("NOTES_PRESENCE_POLICY") {
            config.registry.presence_policy = policy
                .parse()
                .map_err(|e| GatewayError::Config(format!("NOTES_PRESENCE_POLICY: {e}")))?;
        }
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Not a realtime path: {0}")]
    BadPath(String),
    #[error("Note not found: {0}")]
    NoteNotFound(String),
    #[error("Access denied to note {0}")]
    Forbidden(uuid::Uuid),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transporter(#[from] TransporterError),
}

/// Target of an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeTarget {
    /// Note id or alias
    pub note: String,
    pub token: Option<String>,
}

/// Parse `/realtime/<note>?token=…` plus an optional `Authorization` header.
/// The header wins over the query parameter.
pub fn parse_upgrade(
    path_and_query: &str,
    authorization: Option<&str>,
) -> Result<UpgradeTarget, GatewayError> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    let note = path
        .strip_prefix(REALTIME_PATH)
        .map(|rest| rest.trim_end_matches('/'))
        .filter(|note| !note.is_empty() && !note.contains('/'))
        .ok_or_else(|| GatewayError::BadPath(path.to_string()))?;

    let from_header = authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());
    let from_query = query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
    });

    Ok(UpgradeTarget {
        note: note.to_string(),
        token: from_header.or(from_query).filter(|t| !t.is_empty()),
    })
}

/// Accepts websocket connections and hands them to the registry.
pub struct RealtimeGateway {
    config: GatewayConfig,
    registry: Arc<RealtimeDocumentRegistry>,
    permissions: Arc<dyn PermissionCheck>,
    authenticator: Arc<dyn Authenticator>,
    accepted: AtomicU64,
}

impl RealtimeGateway {
    pub fn new(
        config: GatewayConfig,
        note_store: Arc<dyn NoteStore>,
        permissions: Arc<dyn PermissionCheck>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        let registry = RealtimeDocumentRegistry::new(config.registry.clone(), note_store);
        Arc::new(Self {
            config,
            registry,
            permissions,
            authenticator,
            accepted: AtomicU64::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<RealtimeDocumentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Connections that completed the websocket upgrade.
    pub fn accepted_connections(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Realtime gateway listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), GatewayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream, addr).await {
                    log::warn!("Realtime connection from {addr} rejected: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), GatewayError> {
        let mut target = None;
        let callback = |request: &Request, response: Response| {
            let path_and_query = request
                .uri()
                .path_and_query()
                .map_or(request.uri().path(), |pq| pq.as_str());
            let authorization = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok());
            match parse_upgrade(path_and_query, authorization) {
                Ok(parsed) => {
                    target = Some(parsed);
                    Ok(response)
                }
                Err(e) => {
                    let mut error = ErrorResponse::new(Some(e.to_string()));
                    *error.status_mut() = StatusCode::NOT_FOUND;
                    Err(error)
                }
            }
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let Some(target) = target else {
            return Err(GatewayError::BadPath(String::new()));
        };
        self.accepted.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket upgrade from {addr} for note '{}'", target.note);

        let (note, identity, access) = match self.admit(&target).await {
            Ok(admitted) => admitted,
            Err(e) => {
                reject(&mut ws, &e).await;
                return Err(e);
            }
        };

        let adapter = WebSocketAdapter::new(ws);
        let transporter = self.registry.new_transporter();
        transporter.set_adapter(adapter.clone())?;
        let admitted = self
            .registry
            .connect(note.id, transporter, identity, access.can_edit())
            .await;
        if let Err(e) = admitted {
            adapter.disconnect();
            return Err(e.into());
        }
        adapter.start();
        Ok(())
    }

    async fn admit(
        &self,
        target: &UpgradeTarget,
    ) -> Result<(NoteRecord, Identity, AccessLevel), GatewayError> {
        let identity = self
            .authenticator
            .authenticate(target.token.as_deref())
            .await?;
        let note = self
            .registry
            .note_store()
            .find_note(&target.note)
            .await?
            .ok_or_else(|| GatewayError::NoteNotFound(target.note.clone()))?;
        let access = self.permissions.access_level(&identity, &note).await;
        if !access.can_read() {
            return Err(GatewayError::Forbidden(note.id));
        }
        Ok((note, identity, access))
    }
}

async fn reject<S>(ws: &mut WebSocketStream<S>, error: &GatewayError)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: error.to_string().into(),
    };
    if let Err(e) = ws.send(WsMessage::Close(Some(frame))).await {
        log::debug!("Failed to send close frame: {e}");
    }
    let _ = ws.close(None).await;
}
