//! # notes-realtime: Realtime collaborative editing for notes
//!
//! Many connections converge on one shared document per note while every
//! editor mutates it concurrently.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐    WebSocket     ┌──────────────────┐
//! │ RealtimeClient │ ◄──────────────► │ RealtimeGateway  │
//! │ (per user)     │   Binary Proto   │ (upgrade + auth) │
//! └───────┬────────┘                  └────────┬─────────┘
//!         │                                    │
//!         ▼                                    ▼
//! ┌────────────────┐                  ┌──────────────────────────┐
//! │ SharedDocument │                  │ RealtimeDocumentRegistry │
//! │ (local)        │                  │  └─ DocumentSession      │
//! └────────────────┘                  │      ├─ SharedDocument   │
//!                                     │      └─ connections      │
//!                                     └──────────────────────────┘
//! ```
//!
//! Per connection, on both sides:
//!
//! ```text
//! TransportAdapter ──► MessageTransporter ──► DocumentSyncSession
//!  (socket)             (readiness handshake)  (state exchange + updates)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded `Message`)
//! - [`transport`]: Adapter trait, WebSocket and in-memory adapters
//! - [`transporter`]: Readiness handshake and typed dispatch
//! - [`document`]: yrs-backed shared text document
//! - [`sync`]: Per-connection document reconciliation
//! - [`presence`]: Cursor and activity state, style indices
//! - [`registry`]: Live document sessions and their connections
//! - [`collaborators`]: Note store, permission and authentication traits
//! - [`gateway`]: WebSocket server entry point
//! - [`client`]: WebSocket client with reconnect

pub mod protocol;
pub mod transport;
pub mod transporter;
pub mod document;
mod bounds;
pub mod sync;
pub mod presence;
pub mod registry;
pub mod collaborators;
pub mod gateway;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    CursorRange, DocumentId, Message, MessageKind, OwnUser, ProtocolError, RealtimeUser,
};
pub use transport::{
    Binding, ConnectionState, MemoryAdapter, TransportAdapter, TransportError, WebSocketAdapter,
};
pub use transporter::{MessageTransporter, TransporterConfig, TransporterError, TransporterEvent};
pub use document::{DocumentError, SharedDocument};
pub use sync::{DocumentSyncSession, SyncError, SyncOptions};
pub use presence::{PresencePolicy, PresenceRoom};
pub use registry::{
    Admission, ConnectionInfo, DocumentSession, RealtimeDocumentRegistry, RegistryConfig,
    RegistryError, RegistryStats,
};
pub use collaborators::{
    AccessLevel, Authenticator, CollaboratorError, GrantTable, Identity, InMemoryNoteStore,
    NoteRecord, NoteStore, PermissionCheck, TokenAuthenticator,
};
pub use gateway::{GatewayConfig, GatewayError, RealtimeGateway};
pub use client::{ClientConfig, ClientError, ClientEvent, RealtimeClient};
