//! Binary wire protocol for realtime note synchronization.
//!
//! Every frame carries exactly one bincode-encoded [`Message`]:
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ kind     │ payload                      │
//! │ varint   │ kind-specific, may be empty  │
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! The kind is the enum variant index, so the set of kinds is closed and
//! every consumer matches it exhaustively.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a shared note document.
pub type DocumentId = Uuid;

/// Fieldless mirror of [`Message`] used for gating and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Readiness check, answered unconditionally
    ReadyRequest = 0,
    /// Readiness acknowledgement
    ReadyAnswer = 1,
    /// State vector of the requesting replica
    StateRequest = 2,
    /// Update containing everything the requester is missing
    StateAnswer = 3,
    /// Incremental document update
    ContentUpdate = 4,
    /// Cursor of one connection
    PresenceSingleUpdate = 5,
    /// Focus/idle flag of one connection
    PresenceActivity = 6,
    /// Request for the current presence snapshot
    PresenceStateRequest = 7,
    /// Merged presence snapshot
    PresenceStateSet = 8,
    /// Note metadata changed
    MetadataUpdated = 9,
    /// Note was deleted, connection is about to close
    DocumentDeleted = 10,
}

impl MessageKind {
    /// Handshake kinds may flow before both sides are ready.
    pub fn is_handshake(self) -> bool {
        matches!(self, MessageKind::ReadyRequest | MessageKind::ReadyAnswer)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::ReadyRequest => "READY_REQUEST",
            MessageKind::ReadyAnswer => "READY_ANSWER",
            MessageKind::StateRequest => "STATE_REQUEST",
            MessageKind::StateAnswer => "STATE_ANSWER",
            MessageKind::ContentUpdate => "CONTENT_UPDATE",
            MessageKind::PresenceSingleUpdate => "PRESENCE_SINGLE_UPDATE",
            MessageKind::PresenceActivity => "PRESENCE_ACTIVITY",
            MessageKind::PresenceStateRequest => "PRESENCE_STATE_REQUEST",
            MessageKind::PresenceStateSet => "PRESENCE_STATE_SET",
            MessageKind::MetadataUpdated => "METADATA_UPDATED",
            MessageKind::DocumentDeleted => "DOCUMENT_DELETED",
        };
        f.write_str(name)
    }
}

/// Selection or caret inside the note text. `to` is absent for a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub from: u32,
    pub to: Option<u32>,
}

impl CursorRange {
    pub fn caret(at: u32) -> Self {
        Self { from: at, to: None }
    }

    pub fn selection(from: u32, to: u32) -> Self {
        Self { from, to: Some(to) }
    }
}

/// One remote participant as seen by the receiver of a presence snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeUser {
    pub display_name: String,
    /// Registered username, `None` for guests
    pub username: Option<String>,
    pub style_index: u8,
    pub cursor: Option<CursorRange>,
    pub active: bool,
}

/// The receiver's own presence identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnUser {
    pub display_name: String,
    pub style_index: u8,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    ReadyRequest,
    ReadyAnswer,
    StateRequest { state_vector: Vec<u8> },
    StateAnswer { update: Vec<u8> },
    ContentUpdate { update: Vec<u8> },
    PresenceSingleUpdate { cursor: Option<CursorRange> },
    PresenceActivity { active: bool },
    PresenceStateRequest,
    PresenceStateSet { users: Vec<RealtimeUser>, own_user: OwnUser },
    MetadataUpdated,
    DocumentDeleted,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ReadyRequest => MessageKind::ReadyRequest,
            Message::ReadyAnswer => MessageKind::ReadyAnswer,
            Message::StateRequest { .. } => MessageKind::StateRequest,
            Message::StateAnswer { .. } => MessageKind::StateAnswer,
            Message::ContentUpdate { .. } => MessageKind::ContentUpdate,
            Message::PresenceSingleUpdate { .. } => MessageKind::PresenceSingleUpdate,
            Message::PresenceActivity { .. } => MessageKind::PresenceActivity,
            Message::PresenceStateRequest => MessageKind::PresenceStateRequest,
            Message::PresenceStateSet { .. } => MessageKind::PresenceStateSet,
            Message::MetadataUpdated => MessageKind::MetadataUpdated,
            Message::DocumentDeleted => MessageKind::DocumentDeleted,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    ///
    /// Trailing bytes after a complete message are rejected; one frame
    /// carries exactly one envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes {
                expected: read,
                actual: bytes.len(),
            });
        }
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Frame has {actual} bytes but the message ends at {expected}")]
    TrailingBytes { expected: usize, actual: usize },
}
