//! Reconciliation of one shared document over one transporter.
//!
//! ```text
//! initiator                          responder
//!    │ ── STATE_REQUEST(sv_i) ──────────► │
//!    │ ◄────────── STATE_ANSWER(diff) ─── │
//!    │ ◄──────── CONTENT_UPDATE ────────► │   (every later change)
//! ```
//!
//! Each session tags the transactions it applies with its own origin and
//! skips those when forwarding document updates, so a change is never
//! echoed back over the connection it arrived on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;
use yrs::{Origin, Subscription};

use crate::document::{DocumentError, SharedDocument};
use crate::protocol::Message;
use crate::transport::handlers::lock;
use crate::transport::Binding;
use crate::transporter::{MessageTransporter, TransporterError, TransporterEvent};

/// Role of a session on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Send a `StateRequest` whenever the transporter becomes ready
    pub initiate_on_ready: bool,
    /// Apply `StateAnswer` and `ContentUpdate` messages from the peer
    pub accept_remote_updates: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::initiator()
    }
}

impl SyncOptions {
    pub fn initiator() -> Self {
        Self {
            initiate_on_ready: true,
            accept_remote_updates: true,
        }
    }

    pub fn responder() -> Self {
        Self {
            initiate_on_ready: false,
            accept_remote_updates: true,
        }
    }

    /// Receives nothing from the peer, still forwards local changes to it.
    pub fn read_only() -> Self {
        Self {
            initiate_on_ready: false,
            accept_remote_updates: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Sync session was destroyed")]
    Destroyed,
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Transporter(#[from] TransporterError),
}

struct Subscriptions {
    _document: Subscription,
    messages: Binding,
    events: Binding,
}

#[derive(Default)]
struct SyncState {
    synced: AtomicBool,
}

struct Handler {
    document: Arc<SharedDocument>,
    transporter: MessageTransporter,
    origin: Origin,
    options: SyncOptions,
    state: Arc<SyncState>,
}

impl Handler {
    fn request_state(&self) -> Result<(), TransporterError> {
        let state_vector = self.document.encode_state_vector();
        log::debug!("Requesting state ({} byte state vector)", state_vector.len());
        self.transporter
            .send_message(Message::StateRequest { state_vector })
    }

    fn on_event(&self, event: &TransporterEvent) {
        match event {
            TransporterEvent::Ready if self.options.initiate_on_ready => {
                if let Err(e) = self.request_state() {
                    log::warn!("STATE_REQUEST failed: {e}");
                }
            }
            TransporterEvent::Disconnected => self.state.synced.store(false, Ordering::SeqCst),
            _ => {}
        }
    }

    fn on_message(&self, message: &Message) {
        match message {
            Message::StateRequest { state_vector } => {
                match self.document.encode_state_as_update(state_vector) {
                    Ok(update) => {
                        if let Err(e) = self
                            .transporter
                            .send_message(Message::StateAnswer { update })
                        {
                            log::warn!("STATE_ANSWER failed: {e}");
                        }
                    }
                    Err(e) => log::warn!("Ignoring STATE_REQUEST: {e}"),
                }
            }
            Message::StateAnswer { update } => {
                if self.apply(update, "STATE_ANSWER")
                    && !self.state.synced.swap(true, Ordering::SeqCst)
                {
                    log::debug!("Document synced");
                }
            }
            Message::ContentUpdate { update } => {
                self.apply(update, "CONTENT_UPDATE");
            }
            _ => {}
        }
    }

    fn apply(&self, update: &[u8], kind: &str) -> bool {
        if !self.options.accept_remote_updates {
            log::debug!("Dropping {kind} from a connection that may not edit");
            return false;
        }
        match self.document.apply_update(update, &self.origin) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Dropping {kind}: {e}");
                false
            }
        }
    }
}

/// Keeps one document and one peer converged.
pub struct DocumentSyncSession {
    id: Uuid,
    handler: Arc<Handler>,
    subscriptions: Mutex<Option<Subscriptions>>,
}

impl DocumentSyncSession {
    pub fn new(
        document: Arc<SharedDocument>,
        transporter: MessageTransporter,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let id = Uuid::new_v4();
        let handler = Arc::new(Handler {
            document: document.clone(),
            transporter: transporter.clone(),
            origin: Origin::from(format!("sync-{id}").as_str()),
            options,
            state: Arc::new(SyncState::default()),
        });

        let forward = {
            let transporter = transporter.clone();
            let own = handler.origin.clone();
            move |update: &[u8], origin: Option<&Origin>| {
                if origin == Some(&own) {
                    return;
                }
                let message = Message::ContentUpdate {
                    update: update.to_vec(),
                };
                if let Err(e) = transporter.send_message(message) {
                    log::debug!("CONTENT_UPDATE not sent: {e}");
                }
            }
        };
        let document_subscription = document.observe_updates(forward)?;

        let messages = transporter.on_message({
            let handler = handler.clone();
            move |message| handler.on_message(message)
        });
        let events = transporter.on_event({
            let handler = handler.clone();
            move |event| handler.on_event(event)
        });

        let session = Self {
            id,
            handler,
            subscriptions: Mutex::new(Some(Subscriptions {
                _document: document_subscription,
                messages,
                events,
            })),
        };

        if options.initiate_on_ready && transporter.is_ready() {
            session.request_state()?;
        }
        Ok(session)
    }

    /// Ask the peer for everything this side is missing.
    pub fn request_state(&self) -> Result<(), SyncError> {
        if self.is_destroyed() {
            return Err(SyncError::Destroyed);
        }
        self.handler.request_state()?;
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Transaction origin used for updates received from the peer.
    pub fn origin(&self) -> &Origin {
        &self.handler.origin
    }

    pub fn options(&self) -> SyncOptions {
        self.handler.options
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.handler.document
    }

    pub fn transporter(&self) -> &MessageTransporter {
        &self.handler.transporter
    }

    /// True once a `StateAnswer` was applied on the current connection.
    pub fn is_synced(&self) -> bool {
        self.handler.state.synced.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.subscriptions).is_none()
    }

    /// Stop observing the document and the transporter. Idempotent.
    pub fn destroy(&self) {
        let subscriptions = lock(&self.subscriptions).take();
        if let Some(subscriptions) = subscriptions {
            subscriptions.messages.unbind();
            subscriptions.events.unbind();
            log::trace!("Sync session {} destroyed", self.id);
        }
    }
}

impl Drop for DocumentSyncSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for DocumentSyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSyncSession")
            .field("id", &self.id)
            .field("options", &self.handler.options)
            .field("synced", &self.is_synced())
            .finish()
    }
}
