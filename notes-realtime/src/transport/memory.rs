//! In-process adapter pair.
//!
//! Each side runs a pump task that delivers its inbound events one at a
//! time, so handlers of one connection never run concurrently with each
//! other and a handler that sends never re-enters the peer synchronously.
//! Frames go through the real codec on the way across.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::handlers::{lock, AdapterEvents, Binding};
use super::{ConnectionState, TransportAdapter, TransportError};
use crate::protocol::Message;

enum Inbound {
    Open,
    Frame(Vec<u8>),
    Close,
}

/// One end of an in-memory connection.
///
/// Each end tracks its own state. A close travels to the peer in order
/// behind the frames sent before it.
pub struct MemoryAdapter {
    state: Arc<Mutex<ConnectionState>>,
    peer_state: Arc<Mutex<ConnectionState>>,
    endpoint: Arc<AdapterEvents>,
    own_tx: mpsc::UnboundedSender<Inbound>,
    peer_tx: mpsc::UnboundedSender<Inbound>,
    drop_outgoing: AtomicUsize,
    frames_sent: AtomicUsize,
}

impl MemoryAdapter {
    /// Two already-open ends of one connection. Requires a tokio runtime.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        Self::with_state(ConnectionState::Connected)
    }

    /// Two ends that stay `Connecting` until [`MemoryAdapter::open`].
    pub fn pending_pair() -> (Arc<Self>, Arc<Self>) {
        Self::with_state(ConnectionState::Connecting)
    }

    fn with_state(initial: ConnectionState) -> (Arc<Self>, Arc<Self>) {
        let state_a = Arc::new(Mutex::new(initial));
        let state_b = Arc::new(Mutex::new(initial));
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let endpoint_a = AdapterEvents::new();
        let endpoint_b = AdapterEvents::new();
        tokio::spawn(pump(rx_a, endpoint_a.clone(), state_a.clone()));
        tokio::spawn(pump(rx_b, endpoint_b.clone(), state_b.clone()));

        let a = Arc::new(Self {
            state: state_a.clone(),
            peer_state: state_b.clone(),
            endpoint: endpoint_a,
            own_tx: tx_a.clone(),
            peer_tx: tx_b.clone(),
            drop_outgoing: AtomicUsize::new(0),
            frames_sent: AtomicUsize::new(0),
        });
        let b = Arc::new(Self {
            state: state_b,
            peer_state: state_a,
            endpoint: endpoint_b,
            own_tx: tx_b,
            peer_tx: tx_a,
            drop_outgoing: AtomicUsize::new(0),
            frames_sent: AtomicUsize::new(0),
        });
        (a, b)
    }

    /// Open a pending pair; both ends receive their open event.
    pub fn open(&self) {
        for (state, tx) in [(&self.state, &self.own_tx), (&self.peer_state, &self.peer_tx)] {
            let opened = {
                let mut state = lock(state);
                let opened = *state == ConnectionState::Connecting;
                if opened {
                    *state = ConnectionState::Connected;
                }
                opened
            };
            if opened {
                let _ = tx.send(Inbound::Open);
            }
        }
    }

    /// Silently lose the next `count` outgoing frames.
    pub fn drop_next_outgoing(&self, count: usize) {
        self.drop_outgoing.store(count, Ordering::SeqCst);
    }

    /// Frames handed to the link, including dropped ones.
    pub fn frames_sent(&self) -> usize {
        self.frames_sent.load(Ordering::SeqCst)
    }

    /// Simulate a transport fault on this end: error, then close.
    pub fn fail(&self, reason: impl Into<String>) {
        self.endpoint.error.emit(&TransportError::Io(reason.into()));
        self.disconnect();
    }
}

/// Deliver inbound events in arrival order until the peer closes. Frames
/// arriving after this end disconnected itself are discarded.
async fn pump(
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    endpoint: Arc<AdapterEvents>,
    state: Arc<Mutex<ConnectionState>>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            Inbound::Open => endpoint.open.emit(&()),
            Inbound::Frame(frame) => {
                if *lock(&state) != ConnectionState::Connected {
                    continue;
                }
                match Message::decode(&frame) {
                    Ok(message) => endpoint.message.emit(&message),
                    Err(e) => log::warn!("Dropping undecodable in-memory frame: {e}"),
                }
            }
            Inbound::Close => {
                *lock(&state) = ConnectionState::Disconnected;
                endpoint.fire_close();
                break;
            }
        }
    }
}

impl TransportAdapter for MemoryAdapter {
    fn bind_on_open(&self, handler: Box<dyn Fn() + Send + Sync>) -> Binding {
        self.endpoint.bind_open(handler)
    }

    fn bind_on_close(&self, handler: Box<dyn Fn() + Send + Sync>) -> Binding {
        self.endpoint.bind_close(handler)
    }

    fn bind_on_error(&self, handler: Box<dyn Fn(&TransportError) + Send + Sync>) -> Binding {
        self.endpoint.bind_error(handler)
    }

    fn bind_on_message(&self, handler: Box<dyn Fn(&Message) + Send + Sync>) -> Binding {
        self.endpoint.bind_message(handler)
    }

    fn send(&self, message: &Message) -> Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotOpen(state));
        }
        let frame = message.encode()?;
        self.frames_sent.fetch_add(1, Ordering::SeqCst);

        let dropped = self
            .drop_outgoing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            log::trace!("Dropping in-memory {} frame", message.kind());
            return Ok(());
        }

        self.peer_tx
            .send(Inbound::Frame(frame))
            .map_err(|_| TransportError::Io("peer endpoint is gone".into()))
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn disconnect(&self) {
        let was_up = {
            let mut state = lock(&self.state);
            let was_up = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            was_up
        };
        self.endpoint.fire_close();
        if was_up {
            let _ = self.peer_tx.send(Inbound::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn recorder(adapter: &MemoryAdapter) -> (Binding, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let binding = adapter.bind_on_message(Box::new(move |m| {
            let _ = tx.send(m.clone());
        }));
        (binding, rx)
    }

    #[tokio::test]
    async fn test_pair_delivers_messages() {
        let (a, b) = MemoryAdapter::pair();
        let (_binding, mut rx) = recorder(&b);

        a.send(&Message::ReadyRequest).unwrap();
        let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(received, Some(Message::ReadyRequest));
    }

    #[tokio::test]
    async fn test_send_fails_when_not_open() {
        let (a, _b) = MemoryAdapter::pending_pair();
        assert_eq!(a.state(), ConnectionState::Connecting);
        assert!(matches!(
            a.send(&Message::ReadyRequest),
            Err(TransportError::NotOpen(ConnectionState::Connecting))
        ));
    }

    #[tokio::test]
    async fn test_open_fires_on_both_ends() {
        let (a, b) = MemoryAdapter::pending_pair();
        let opened = Arc::new(AtomicUsize::new(0));
        let o = opened.clone();
        let _ba = a.bind_on_open(Box::new(move || {
            o.fetch_add(1, Ordering::SeqCst);
        }));
        let o = opened.clone();
        let _bb = b.bind_on_open(Box::new(move || {
            o.fetch_add(1, Ordering::SeqCst);
        }));

        a.open();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(b.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_fires_close_once_per_end() {
        let (a, b) = MemoryAdapter::pair();
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        let _ba = a.bind_on_close(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let c = closes.clone();
        let _bb = b.bind_on_close(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        a.disconnect();
        a.disconnect();
        b.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert_eq!(a.state(), ConnectionState::Disconnected);
        assert!(a.send(&Message::ReadyAnswer).is_err());
    }

    #[tokio::test]
    async fn test_frames_before_close_are_delivered() {
        let (a, b) = MemoryAdapter::pair();
        let (_binding, mut rx) = recorder(&b);
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let _bc = b.bind_on_close(Box::new(move || {
            let _ = closed_tx.send(());
        }));

        a.send(&Message::DocumentDeleted).unwrap();
        a.disconnect();
        assert_eq!(b.state(), ConnectionState::Connected);

        let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(received, Some(Message::DocumentDeleted));
        timeout(Duration::from_secs(1), closed_rx.recv())
            .await
            .unwrap();
        assert_eq!(b.state(), ConnectionState::Disconnected);
        assert!(b.send(&Message::ReadyRequest).is_err());
    }

    #[tokio::test]
    async fn test_frames_after_own_disconnect_are_discarded() {
        let (a, b) = MemoryAdapter::pair();
        let (_binding, mut rx) = recorder(&b);

        b.disconnect();
        a.send(&Message::DocumentDeleted).unwrap();
        let received = timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn test_dropped_frames_are_lost() {
        let (a, b) = MemoryAdapter::pair();
        let (_binding, mut rx) = recorder(&b);

        a.drop_next_outgoing(1);
        a.send(&Message::ReadyRequest).unwrap();
        a.send(&Message::ReadyAnswer).unwrap();

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(Message::ReadyAnswer));
        assert_eq!(a.frames_sent(), 2);
    }

    #[tokio::test]
    async fn test_fail_emits_error_then_close() {
        let (a, _b) = MemoryAdapter::pair();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let _be = a.bind_on_error(Box::new(move |_| lock(&o).push("error")));
        let o = order.clone();
        let _bc = a.bind_on_close(Box::new(move || lock(&o).push("close")));

        a.fail("cable cut");
        assert_eq!(*lock(&order), vec!["error", "close"]);
    }
}
