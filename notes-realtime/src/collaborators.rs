//! Services the realtime engine consumes but does not own.
//!
//! - [`NoteStore`]: note lookup, seed content, save on dispose
//! - [`PermissionCheck`]: access level of an identity on a note
//! - [`Authenticator`]: token to identity
//!
//! The in-memory implementations back the tests and the demo gateway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::protocol::DocumentId;
use crate::transport::handlers::lock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Note not found: {0}")]
    NotFound(String),
    #[error("Authentication failed")]
    Unauthorized,
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Note as known to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRecord {
    pub id: DocumentId,
    pub alias: Option<String>,
    pub title: String,
    pub owner: Option<Uuid>,
}

/// Authenticated user, or a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<Uuid>,
    pub display_name: String,
    pub username: Option<String>,
}

impl Identity {
    pub fn user(display_name: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: Some(Uuid::new_v4()),
            display_name: display_name.into(),
            username: Some(username.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            display_name: "Guest".to_string(),
            username: None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    Denied,
    Read,
    Write,
}

impl AccessLevel {
    pub fn can_read(self) -> bool {
        self >= AccessLevel::Read
    }

    pub fn can_edit(self) -> bool {
        self == AccessLevel::Write
    }
}

#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Resolve a note id or alias.
    async fn find_note(&self, id_or_alias: &str) -> Result<Option<NoteRecord>, CollaboratorError>;
    async fn load_content(&self, id: DocumentId) -> Result<String, CollaboratorError>;
    async fn save_content(&self, id: DocumentId, content: &str) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait PermissionCheck: Send + Sync {
    async fn access_level(&self, identity: &Identity, note: &NoteRecord) -> AccessLevel;
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `token` is the bearer token of the upgrade request, if any.
    async fn authenticate(&self, token: Option<&str>) -> Result<Identity, CollaboratorError>;
}

struct StoredNote {
    record: NoteRecord,
    content: String,
}

/// Note store kept in a hash map.
#[derive(Default)]
pub struct InMemoryNoteStore {
    notes: Mutex<HashMap<DocumentId, StoredNote>>,
    load_delay: Mutex<Option<Duration>>,
    fail_loads: AtomicBool,
    loads: AtomicUsize,
    saves: AtomicUsize,
}

impl InMemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, title: &str, alias: Option<&str>, content: &str) -> NoteRecord {
        self.insert_owned(title, alias, content, None)
    }

    pub fn insert_owned(
        &self,
        title: &str,
        alias: Option<&str>,
        content: &str,
        owner: Option<Uuid>,
    ) -> NoteRecord {
        let record = NoteRecord {
            id: Uuid::new_v4(),
            alias: alias.map(str::to_string),
            title: title.to_string(),
            owner,
        };
        lock(&self.notes).insert(
            record.id,
            StoredNote {
                record: record.clone(),
                content: content.to_string(),
            },
        );
        record
    }

    pub fn remove(&self, id: DocumentId) -> bool {
        lock(&self.notes).remove(&id).is_some()
    }

    pub fn content(&self, id: DocumentId) -> Option<String> {
        lock(&self.notes).get(&id).map(|n| n.content.clone())
    }

    /// Delay every load, to widen creation races in tests.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *lock(&self.load_delay) = delay;
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NoteStore for InMemoryNoteStore {
    async fn find_note(&self, id_or_alias: &str) -> Result<Option<NoteRecord>, CollaboratorError> {
        let by_id = Uuid::parse_str(id_or_alias).ok();
        let notes = lock(&self.notes);
        let found = notes.values().find(|n| {
            Some(n.record.id) == by_id || n.record.alias.as_deref() == Some(id_or_alias)
        });
        Ok(found.map(|n| n.record.clone()))
    }

    async fn load_content(&self, id: DocumentId) -> Result<String, CollaboratorError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.load_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Backend("load failed".into()));
        }
        lock(&self.notes)
            .get(&id)
            .map(|n| n.content.clone())
            .ok_or_else(|| CollaboratorError::NotFound(id.to_string()))
    }

    async fn save_content(&self, id: DocumentId, content: &str) -> Result<(), CollaboratorError> {
        let mut notes = lock(&self.notes);
        let note = notes
            .get_mut(&id)
            .ok_or_else(|| CollaboratorError::NotFound(id.to_string()))?;
        note.content = content.to_string();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Owners write, explicit grants override, everyone else gets the default.
pub struct GrantTable {
    default_level: AccessLevel,
    grants: Mutex<HashMap<(Uuid, DocumentId), AccessLevel>>,
}

impl GrantTable {
    pub fn new(default_level: AccessLevel) -> Self {
        Self {
            default_level,
            grants: Mutex::new(HashMap::new()),
        }
    }

    pub fn grant(&self, user_id: Uuid, note: DocumentId, level: AccessLevel) {
        lock(&self.grants).insert((user_id, note), level);
    }
}

#[async_trait]
impl PermissionCheck for GrantTable {
    async fn access_level(&self, identity: &Identity, note: &NoteRecord) -> AccessLevel {
        let Some(user_id) = identity.user_id else {
            return self.default_level.min(AccessLevel::Read);
        };
        if note.owner == Some(user_id) {
            return AccessLevel::Write;
        }
        lock(&self.grants)
            .get(&(user_id, note.id))
            .copied()
            .unwrap_or(self.default_level)
    }
}

/// Fixed token to identity table.
pub struct TokenAuthenticator {
    tokens: Mutex<HashMap<String, Identity>>,
    allow_anonymous: bool,
}

impl TokenAuthenticator {
    pub fn new(allow_anonymous: bool) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            allow_anonymous,
        }
    }

    pub fn register(&self, token: impl Into<String>, identity: Identity) {
        lock(&self.tokens).insert(token.into(), identity);
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, token: Option<&str>) -> Result<Identity, CollaboratorError> {
        match token {
            None if self.allow_anonymous => Ok(Identity::anonymous()),
            None => Err(CollaboratorError::Unauthorized),
            Some(token) => lock(&self.tokens)
                .get(token)
                .cloned()
                .ok_or(CollaboratorError::Unauthorized),
        }
    }
}
