//! Uniform boundary around one physical duplex connection.
//!
//! The transporter never sees sockets, only a [`TransportAdapter`]:
//! - [`websocket::WebSocketAdapter`]: tokio-tungstenite stream (server and client)
//! - [`memory::MemoryAdapter`]: in-process pair used by tests
//!
//! Adapters neither buffer nor retry. A failed send is reported and the
//! caller decides what to do with the connection.

pub mod handlers;
pub mod memory;
pub mod websocket;

pub use handlers::{Binding, HandlerSet};
pub use memory::MemoryAdapter;
pub use websocket::WebSocketAdapter;

use crate::protocol::{Message, ProtocolError};

/// Connection state as reported by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection is not open ({0:?})")]
    NotOpen(ConnectionState),
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] ProtocolError),
    #[error("Transport error: {0}")]
    Io(String),
}

/// One duplex connection behind a swappable interface.
///
/// Close handlers fire exactly once per adapter. An error is always
/// followed by close.
pub trait TransportAdapter: Send + Sync {
    fn bind_on_open(&self, handler: Box<dyn Fn() + Send + Sync>) -> Binding;
    fn bind_on_close(&self, handler: Box<dyn Fn() + Send + Sync>) -> Binding;
    fn bind_on_error(&self, handler: Box<dyn Fn(&TransportError) + Send + Sync>) -> Binding;
    fn bind_on_message(&self, handler: Box<dyn Fn(&Message) + Send + Sync>) -> Binding;

    /// Best-effort send. Fails if the connection is not open.
    fn send(&self, message: &Message) -> Result<(), TransportError>;

    fn state(&self) -> ConnectionState;

    /// Close the connection. Idempotent.
    fn disconnect(&self);
}
