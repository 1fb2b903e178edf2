//! Handler registry shared by the adapters and the transporter.
//!
//! Handlers are cloned out of the registry before they are invoked, so a
//! handler may bind, unbind or send without deadlocking on the registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::TransportError;
use crate::protocol::Message;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered set of handlers for one event type.
pub struct HandlerSet<T> {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<u64, Handler<T>>>,
}

impl<T: 'static> HandlerSet<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            handlers: Mutex::new(BTreeMap::new()),
        })
    }

    /// Register a handler. Dropping the returned [`Binding`] does not unbind.
    pub fn bind(self: &Arc<Self>, handler: impl Fn(&T) + Send + Sync + 'static) -> Binding {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.handlers).insert(id, Arc::new(handler));
        let weak: Weak<Self> = Arc::downgrade(self);
        Binding::new(move || {
            if let Some(set) = weak.upgrade() {
                lock(&set.handlers).remove(&id);
            }
        })
    }

    /// Invoke every handler bound at the time of the call, in bind order.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Handler<T>> = lock(&self.handlers).values().cloned().collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.handlers).clear();
    }
}

/// Handle returned by every `bind_*` call.
///
/// `unbind` may be called any number of times and never fails.
pub struct Binding {
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Binding {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// A binding that owns nothing.
    pub fn noop() -> Self {
        Self {
            release: Mutex::new(None),
        }
    }

    pub fn unbind(&self) {
        let release = lock(&self.release).take();
        if let Some(release) = release {
            release();
        }
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.release).is_some()
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// The four event sets every adapter exposes.
pub(crate) struct AdapterEvents {
    pub open: Arc<HandlerSet<()>>,
    pub close: Arc<HandlerSet<()>>,
    pub error: Arc<HandlerSet<TransportError>>,
    pub message: Arc<HandlerSet<Message>>,
    close_fired: AtomicBool,
}

impl AdapterEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: HandlerSet::new(),
            close: HandlerSet::new(),
            error: HandlerSet::new(),
            message: HandlerSet::new(),
            close_fired: AtomicBool::new(false),
        })
    }

    /// Fire close handlers; only the first call has an effect.
    pub fn fire_close(&self) {
        if !self.close_fired.swap(true, Ordering::SeqCst) {
            self.close.emit(&());
        }
    }

    pub fn bind_open(&self, handler: Box<dyn Fn() + Send + Sync>) -> Binding {
        self.open.bind(move |_| handler())
    }

    pub fn bind_close(&self, handler: Box<dyn Fn() + Send + Sync>) -> Binding {
        self.close.bind(move |_| handler())
    }

    pub fn bind_error(&self, handler: Box<dyn Fn(&TransportError) + Send + Sync>) -> Binding {
        self.error.bind(move |e| handler(e))
    }

    pub fn bind_message(&self, handler: Box<dyn Fn(&Message) + Send + Sync>) -> Binding {
        self.message.bind(move |m| handler(m))
    }
}
