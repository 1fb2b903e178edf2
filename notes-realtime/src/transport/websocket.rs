//! WebSocket adapter over tokio-tungstenite.
//!
//! ```text
//! send() ──► unbounded queue ──► writer task ──► SplitSink
//! handlers ◄── reader task ◄── SplitStream
//! ```
//!
//! One binary frame carries one [`Message`]. The reader and writer tasks
//! only start on [`WebSocketAdapter::start`], so the transporter can bind
//! its handlers before the first inbound frame is read.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use super::handlers::{lock, AdapterEvents, Binding};
use super::{ConnectionState, TransportAdapter, TransportError};
use crate::protocol::Message;

type Starter = Box<dyn FnOnce(Arc<Shared>, mpsc::UnboundedReceiver<WsMessage>) -> Tasks + Send>;

struct Tasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct Shared {
    state: Mutex<ConnectionState>,
    events: Arc<AdapterEvents>,
}

impl Shared {
    fn is_connected(&self) -> bool {
        *lock(&self.state) == ConnectionState::Connected
    }

    fn mark_closed(&self) {
        *lock(&self.state) = ConnectionState::Disconnected;
        self.events.fire_close();
    }

    fn fail(&self, error: TransportError) {
        log::warn!("WebSocket transport error: {error}");
        self.events.error.emit(&error);
        self.mark_closed();
    }
}

/// Adapter around an accepted or connected WebSocket stream.
pub struct WebSocketAdapter {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<WsMessage>,
    pending: Mutex<Option<(Starter, mpsc::UnboundedReceiver<WsMessage>)>>,
    tasks: Mutex<Option<Tasks>>,
}

impl WebSocketAdapter {
    /// Wrap an open stream. Nothing is read until [`start`](Self::start).
    pub fn new<S>(stream: WebSocketStream<S>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let starter: Starter = Box::new(move |shared, outgoing_rx| {
            let (sink, stream) = stream.split();
            Tasks {
                writer: tokio::spawn(write_loop(sink, outgoing_rx, shared.clone())),
                reader: tokio::spawn(read_loop(stream, shared)),
            }
        });

        Arc::new(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Connected),
                events: AdapterEvents::new(),
            }),
            outgoing,
            pending: Mutex::new(Some((starter, outgoing_rx))),
            tasks: Mutex::new(None),
        })
    }

    /// Spawn the reader and writer tasks. Later calls are no-ops.
    pub fn start(&self) {
        let pending = lock(&self.pending).take();
        if let Some((starter, outgoing_rx)) = pending {
            if !self.shared.is_connected() {
                return;
            }
            let tasks = starter(self.shared.clone(), outgoing_rx);
            *lock(&self.tasks) = Some(tasks);
        }
    }

    /// Whether the reader task has finished.
    pub fn is_finished(&self) -> bool {
        lock(&self.tasks)
            .as_ref()
            .map_or(false, |t| t.reader.is_finished())
    }
}

async fn write_loop<S>(
    mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, WsMessage>,
    mut outgoing: mpsc::UnboundedReceiver<WsMessage>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = outgoing.recv().await {
        let closing = matches!(frame, WsMessage::Close(_));
        if let Err(e) = sink.send(frame).await {
            if shared.is_connected() {
                shared.fail(TransportError::Io(e.to_string()));
            }
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(
    mut stream: futures_util::stream::SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Binary(data)) => {
                if !shared.is_connected() {
                    break;
                }
                let bytes: Vec<u8> = data.into();
                match Message::decode(&bytes) {
                    Ok(message) => shared.events.message.emit(&message),
                    Err(e) => log::warn!("Dropping malformed frame ({} bytes): {e}", bytes.len()),
                }
            }
            Ok(WsMessage::Close(_)) => {
                log::debug!("WebSocket closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if shared.is_connected() {
                    shared.fail(TransportError::Io(e.to_string()));
                }
                return;
            }
        }
    }
    shared.mark_closed();
}

impl TransportAdapter for WebSocketAdapter {
    fn bind_on_open(&self, handler: Box<dyn Fn() + Send + Sync>) -> Binding {
        self.shared.events.bind_open(handler)
    }

    fn bind_on_close(&self, handler: Box<dyn Fn() + Send + Sync>) -> Binding {
        self.shared.events.bind_close(handler)
    }

    fn bind_on_error(&self, handler: Box<dyn Fn(&TransportError) + Send + Sync>) -> Binding {
        self.shared.events.bind_error(handler)
    }

    fn bind_on_message(&self, handler: Box<dyn Fn(&Message) + Send + Sync>) -> Binding {
        self.shared.events.bind_message(handler)
    }

    fn send(&self, message: &Message) -> Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotOpen(state));
        }
        let frame = message.encode()?;
        self.outgoing
            .send(WsMessage::Binary(frame.into()))
            .map_err(|_| TransportError::Io("writer task stopped".into()))
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    fn disconnect(&self) {
        let was_connected = {
            let mut state = lock(&self.shared.state);
            let was = *state == ConnectionState::Connected;
            *state = ConnectionState::Disconnected;
            was
        };
        if was_connected {
            let _ = self.outgoing.send(WsMessage::Close(None));
        }
        // Never started: the stream is dropped with the starter
        lock(&self.pending).take();
        if let Some(tasks) = lock(&self.tasks).as_ref() {
            tasks.reader.abort();
        }
        self.shared.events.fire_close();
    }
}

impl Drop for WebSocketAdapter {
    fn drop(&mut self) {
        if let Some(tasks) = lock(&self.tasks).take() {
            tasks.reader.abort();
            tasks.writer.abort();
        }
    }
}
