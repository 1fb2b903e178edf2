//! Shared text document backed by a yrs `Doc`.
//!
//! Every note is one text root. Writers go through a single gate so local
//! edits and remote updates on one document never interleave.

use std::sync::Mutex;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, Origin, ReadTxn, StateVector, Subscription, Text, TextRef, Transact,
    TransactionMut, Update,
};

use crate::bounds;
use crate::transport::handlers::lock;

/// Name of the text root holding the note content.
pub const TEXT_ROOT: &str = "content";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),
    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
    #[error("Cannot observe a document inside one of its transactions")]
    Busy,
    #[error("Range {index}..{end} is outside the text (length {len})")]
    OutOfRange { index: u32, end: u32, len: u32 },
}

pub struct SharedDocument {
    doc: Doc,
    text: TextRef,
    gate: Mutex<()>,
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(TEXT_ROOT);
        Self {
            doc,
            text,
            gate: Mutex::new(()),
        }
    }

    /// New document seeded with `content`.
    pub fn from_content(content: &str) -> Self {
        let document = Self::new();
        if !content.is_empty() {
            let _gate = lock(&document.gate);
            let mut txn = document.doc.transact_mut();
            document.text.insert(&mut txn, 0, content);
        }
        document
    }

    /// Apply a v1-encoded update tagged with `origin`.
    ///
    /// Applying an update whose operations are already known is a no-op.
    pub fn apply_update(&self, update: &[u8], origin: &Origin) -> Result<(), DocumentError> {
        bounds::check_update(update).map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let update =
            Update::decode_v1(update).map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let _gate = lock(&self.gate);
        let mut txn = self.doc.transact_mut_with(origin.clone());
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        let _gate = lock(&self.gate);
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything the holder of `state_vector` is missing.
    pub fn encode_state_as_update(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        bounds::check_state_vector(state_vector)
            .map_err(|e| DocumentError::MalformedStateVector(e.to_string()))?;
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::MalformedStateVector(e.to_string()))?;
        let _gate = lock(&self.gate);
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    /// The whole document as a single update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let _gate = lock(&self.gate);
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Observe every committed update with the origin of its transaction.
    ///
    /// The callback runs inside the committing transaction and must not
    /// touch this document.
    pub fn observe_updates<F>(&self, callback: F) -> Result<Subscription, DocumentError>
    where
        F: Fn(&[u8], Option<&Origin>) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn: &TransactionMut, event| {
                callback(&event.update, txn.origin());
            })
            .map_err(|_| DocumentError::Busy)
    }

    pub fn text(&self) -> String {
        let _gate = lock(&self.gate);
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Text length in UTF-8 bytes.
    pub fn len(&self) -> u32 {
        let _gate = lock(&self.gate);
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert_text(&self, index: u32, chunk: &str) -> Result<(), DocumentError> {
        let _gate = lock(&self.gate);
        let mut txn = self.doc.transact_mut();
        let len = self.text.len(&txn);
        if index > len {
            return Err(DocumentError::OutOfRange {
                index,
                end: index,
                len,
            });
        }
        self.text.insert(&mut txn, index, chunk);
        Ok(())
    }

    pub fn delete_text(&self, index: u32, count: u32) -> Result<(), DocumentError> {
        let _gate = lock(&self.gate);
        let mut txn = self.doc.transact_mut();
        let len = self.text.len(&txn);
        let end = index.saturating_add(count);
        if end > len {
            return Err(DocumentError::OutOfRange { index, end, len });
        }
        if count > 0 {
            self.text.remove_range(&mut txn, index, count);
        }
        Ok(())
    }

    /// Replace the whole text in one transaction.
    pub fn replace(&self, content: &str) {
        let _gate = lock(&self.gate);
        let mut txn = self.doc.transact_mut();
        let len = self.text.len(&txn);
        if len > 0 {
            self.text.remove_range(&mut txn, 0, len);
        }
        if !content.is_empty() {
            self.text.insert(&mut txn, 0, content);
        }
    }

    /// Underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("client_id", &self.doc.client_id())
            .finish()
    }
}
