//! Readiness handshake and typed message dispatch over one adapter.
//!
//! ```text
//! NO_ADAPTER ──set_adapter──► WAITING_FOR_OPEN ──open──► CONNECTED (handshake)
//!                                                          │ READY_ANSWER
//!                                                          ▼
//!                         DISCONNECTED ◄──close/error── CONNECTED (ready)
//! ```
//!
//! Opening on one side can race the other side being able to process
//! frames, so `mark_as_ready` keeps sending `ReadyRequest` on a fixed period
//! until a `ReadyAnswer` arrives. Both handshake kinds are idempotent.
//! Everything else waits until both sides are ready.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::protocol::{Message, MessageKind};
use crate::transport::handlers::lock;
use crate::transport::{Binding, ConnectionState, HandlerSet, TransportAdapter, TransportError};

/// Lifecycle notifications of a transporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransporterEvent {
    /// The current adapter is open
    Connected,
    /// Both sides completed the handshake; fired once per adapter
    Ready,
    /// The current adapter closed
    Disconnected,
}

/// Transporter configuration.
#[derive(Debug, Clone)]
pub struct TransporterConfig {
    /// Period between `ReadyRequest` retransmissions
    pub handshake_retry_interval: Duration,
}

impl Default for TransporterConfig {
    fn default() -> Self {
        Self {
            handshake_retry_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransporterError {
    #[error("Adapter is already disconnected")]
    AdapterClosed,
    #[error("Connection is not open")]
    NotConnected,
    #[error("Cannot send {0} before both sides are ready")]
    NotReady(MessageKind),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Default)]
struct Link {
    adapter: Option<Arc<dyn TransportAdapter>>,
    bindings: Vec<Binding>,
    /// Bumped on every `set_adapter`; events from older adapters are ignored
    generation: u64,
    opened: bool,
    closed: bool,
    local_ready: bool,
    remote_ready: bool,
    ready_fired: bool,
    handshake: Option<JoinHandle<()>>,
}

struct Inner {
    config: TransporterConfig,
    link: Mutex<Link>,
    messages: Arc<HandlerSet<Message>>,
    events: Arc<HandlerSet<TransporterEvent>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = link.handshake.take() {
            task.abort();
        }
        for binding in link.bindings.drain(..) {
            binding.unbind();
        }
    }
}

/// Message transporter for one logical connection.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct MessageTransporter {
    inner: Arc<Inner>,
}

impl Default for MessageTransporter {
    fn default() -> Self {
        Self::new(TransporterConfig::default())
    }
}

impl MessageTransporter {
    pub fn new(config: TransporterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                link: Mutex::new(Link::default()),
                messages: HandlerSet::new(),
                events: HandlerSet::new(),
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Attach an adapter that is connected or about to connect.
    ///
    /// A previous adapter is detached without being closed and readiness
    /// starts over.
    pub fn set_adapter(&self, adapter: Arc<dyn TransportAdapter>) -> Result<(), TransporterError> {
        if adapter.state() == ConnectionState::Disconnected {
            return Err(TransporterError::AdapterClosed);
        }

        let (old_bindings, old_task, generation) = {
            let mut link = lock(&self.inner.link);
            link.generation += 1;
            link.adapter = Some(adapter.clone());
            link.opened = false;
            link.closed = false;
            link.local_ready = false;
            link.remote_ready = false;
            link.ready_fired = false;
            (
                std::mem::take(&mut link.bindings),
                link.handshake.take(),
                link.generation,
            )
        };
        for binding in old_bindings {
            binding.unbind();
        }
        if let Some(task) = old_task {
            task.abort();
        }

        let weak = Arc::downgrade(&self.inner);
        let bindings = vec![
            adapter.bind_on_open(Box::new({
                let weak = weak.clone();
                move || {
                    if let Some(t) = Self::from_weak(&weak) {
                        t.on_open(generation);
                    }
                }
            })),
            adapter.bind_on_close(Box::new({
                let weak = weak.clone();
                move || {
                    if let Some(t) = Self::from_weak(&weak) {
                        t.on_close(generation);
                    }
                }
            })),
            adapter.bind_on_error(Box::new({
                let weak = weak.clone();
                move |error| {
                    if let Some(t) = Self::from_weak(&weak) {
                        t.on_error(generation, error);
                    }
                }
            })),
            adapter.bind_on_message(Box::new(move |message| {
                if let Some(t) = Self::from_weak(&weak) {
                    t.receive_message(generation, message);
                }
            })),
        ];

        let stale = {
            let mut link = lock(&self.inner.link);
            if link.generation == generation {
                link.bindings = bindings;
                Vec::new()
            } else {
                bindings
            }
        };
        for binding in stale {
            binding.unbind();
        }

        match adapter.state() {
            ConnectionState::Connected => self.on_open(generation),
            ConnectionState::Disconnected => self.on_close(generation),
            ConnectionState::Connecting => log::debug!("Waiting for adapter to open"),
        }
        Ok(())
    }

    /// Declare this side ready and start the handshake. Idempotent.
    pub fn mark_as_ready(&self) {
        let generation = {
            let mut link = lock(&self.inner.link);
            if link.local_ready || link.closed || link.adapter.is_none() {
                return;
            }
            link.local_ready = true;
            link.generation
        };

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.handshake_retry_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(transporter) = Self::from_weak(&weak) else {
                    break;
                };
                if !transporter.handshake_pending(generation) {
                    break;
                }
                if transporter.is_connected() {
                    log::trace!("Sending READY_REQUEST");
                    if let Err(e) = transporter.send_message(Message::ReadyRequest) {
                        log::debug!("READY_REQUEST failed: {e}");
                    }
                }
            }
        });

        let mut link = lock(&self.inner.link);
        if link.generation == generation && !link.remote_ready && !link.closed {
            link.handshake = Some(task);
        } else {
            task.abort();
        }
    }

    fn handshake_pending(&self, generation: u64) -> bool {
        let link = lock(&self.inner.link);
        link.generation == generation && link.local_ready && !link.remote_ready && !link.closed
    }

    /// Send a message through the current adapter.
    pub fn send_message(&self, message: Message) -> Result<(), TransporterError> {
        let kind = message.kind();
        let (adapter, ready) = {
            let link = lock(&self.inner.link);
            (link.adapter.clone(), link.local_ready && link.remote_ready)
        };
        let Some(adapter) = adapter else {
            log::warn!("Tried to send {kind} without an adapter");
            return Ok(());
        };
        if adapter.state() != ConnectionState::Connected {
            self.disconnect();
            return Err(TransporterError::NotConnected);
        }
        if !kind.is_handshake() && !ready {
            return Err(TransporterError::NotReady(kind));
        }
        if let Err(e) = adapter.send(&message) {
            log::warn!("Sending {kind} failed, disconnecting: {e}");
            self.disconnect();
            return Err(e.into());
        }
        Ok(())
    }

    fn receive_message(&self, generation: u64, message: &Message) {
        let local_ready = {
            let link = lock(&self.inner.link);
            if link.generation != generation {
                return;
            }
            link.local_ready
        };

        if let Message::ReadyRequest = message {
            if let Err(e) = self.send_message(Message::ReadyAnswer) {
                log::debug!("READY_ANSWER failed: {e}");
            }
            return;
        }
        if !local_ready {
            log::debug!("Dropping {} received before local readiness", message.kind());
            return;
        }
        match message {
            Message::ReadyAnswer => self.on_ready_answer(generation),
            other => {
                // Only a ready peer sends content, so it stands in for a lost answer
                self.on_ready_answer(generation);
                self.inner.messages.emit(other);
            }
        }
    }

    fn on_ready_answer(&self, generation: u64) {
        let (task, fire) = {
            let mut link = lock(&self.inner.link);
            if link.generation != generation || link.closed {
                return;
            }
            link.remote_ready = true;
            let fire = !link.ready_fired;
            link.ready_fired = true;
            (link.handshake.take(), fire)
        };
        if let Some(task) = task {
            task.abort();
        }
        if fire {
            log::debug!("Transporter ready");
            self.inner.events.emit(&TransporterEvent::Ready);
        }
    }

    fn on_open(&self, generation: u64) {
        let resend = {
            let mut link = lock(&self.inner.link);
            if link.generation != generation || link.opened || link.closed {
                return;
            }
            link.opened = true;
            link.local_ready && !link.remote_ready
        };
        self.inner.events.emit(&TransporterEvent::Connected);
        if resend {
            if let Err(e) = self.send_message(Message::ReadyRequest) {
                log::debug!("READY_REQUEST after open failed: {e}");
            }
        }
    }

    fn on_close(&self, generation: u64) {
        let (bindings, task) = {
            let mut link = lock(&self.inner.link);
            if link.generation != generation || link.closed {
                return;
            }
            link.closed = true;
            link.local_ready = false;
            link.remote_ready = false;
            (std::mem::take(&mut link.bindings), link.handshake.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        for binding in bindings {
            binding.unbind();
        }
        log::debug!("Transporter disconnected");
        self.inner.events.emit(&TransporterEvent::Disconnected);
    }

    fn on_error(&self, generation: u64, error: &TransportError) {
        if lock(&self.inner.link).generation != generation {
            return;
        }
        log::warn!("Transport error, disconnecting: {error}");
        self.disconnect();
    }

    /// Close the current adapter. Teardown happens in its close event.
    pub fn disconnect(&self) {
        let adapter = lock(&self.inner.link).adapter.clone();
        if let Some(adapter) = adapter {
            adapter.disconnect();
        }
    }

    /// Subscribe to non-handshake messages delivered after local readiness.
    pub fn on_message(&self, handler: impl Fn(&Message) + Send + Sync + 'static) -> Binding {
        self.inner.messages.bind(handler)
    }

    /// Subscribe to lifecycle events.
    pub fn on_event(&self, handler: impl Fn(&TransporterEvent) + Send + Sync + 'static) -> Binding {
        self.inner.events.bind(handler)
    }

    pub fn is_ready(&self) -> bool {
        let link = lock(&self.inner.link);
        link.local_ready && link.remote_ready
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn has_adapter(&self) -> bool {
        lock(&self.inner.link).adapter.is_some()
    }

    /// State of the current adapter; `Disconnected` without one.
    pub fn state(&self) -> ConnectionState {
        let adapter = lock(&self.inner.link).adapter.clone();
        adapter.map_or(ConnectionState::Disconnected, |a| a.state())
    }

    /// Whether two handles share the same transporter.
    pub fn same_as(&self, other: &MessageTransporter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MessageTransporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTransporter")
            .field("state", &self.state())
            .field("ready", &self.is_ready())
            .finish()
    }
}
