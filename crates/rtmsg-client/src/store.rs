//! Shared key/value store with cross-context change notification.
//!
//! This is the only coordination primitive between execution contexts. Reads
//! and writes are synchronous; change notifications are delivered
//! asynchronously to every *other* attached context, and only when a value
//! actually transitions (writing the same value twice notifies once).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use rtmsg_core::prelude::*;
use rtmsg_core::{StoreBackend, StoreSettings};

use crate::file_store::FileStore;

/// A value transition observed by another context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Receiver half of a change subscription.
pub type ChangeReceiver = mpsc::UnboundedReceiver<StoreChange>;

/// Synchronous key/value store shared between execution contexts.
pub trait SharedStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Subscribe to changes made by other contexts.
    fn subscribe(&self) -> ChangeReceiver;

    /// `false` when this store is private to one context (degraded mode).
    fn is_shared(&self) -> bool;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, String>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<StoreChange>)>,
    next_origin: u64,
}

impl MemoryInner {
    fn notify(&mut self, writer: u64, change: StoreChange) {
        self.subscribers.retain(|(origin, tx)| {
            if *origin == writer {
                return !tx.is_closed();
            }
            tx.send(change.clone()).is_ok()
        });
    }
}

/// In-process store shared by every handle attached to it.
///
/// Each execution context calls [`MemoryStore::attach`] once and uses the
/// returned handle; writes through one handle notify all the others.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new context to this store.
    pub fn attach(&self) -> MemoryStoreHandle {
        let origin = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.next_origin += 1;
            inner.next_origin
        };
        MemoryStoreHandle {
            inner: Arc::clone(&self.inner),
            origin,
            shared: true,
        }
    }

    /// A store nobody else can see. Used when the shared backend is unavailable.
    pub fn private() -> MemoryStoreHandle {
        let mut handle = Self::new().attach();
        handle.shared = false;
        handle
    }
}

/// One context's view of a [`MemoryStore`].
pub struct MemoryStoreHandle {
    inner: Arc<Mutex<MemoryInner>>,
    origin: u64,
    shared: bool,
}

impl std::fmt::Debug for MemoryStoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStoreHandle")
            .field("origin", &self.origin)
            .field("shared", &self.shared)
            .finish()
    }
}

impl SharedStore for MemoryStoreHandle {
    fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.values.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let old_value = inner.values.insert(key.to_string(), value.to_string());
        if old_value.as_deref() != Some(value) {
            inner.notify(
                self.origin,
                StoreChange {
                    key: key.to_string(),
                    old_value,
                    new_value: Some(value.to_string()),
                },
            );
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old_value) = inner.values.remove(key) {
            inner.notify(
                self.origin,
                StoreChange {
                    key: key.to_string(),
                    old_value: Some(old_value),
                    new_value: None,
                },
            );
        }
        Ok(())
    }

    fn subscribe(&self) -> ChangeReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.push((self.origin, tx));
        rx
    }

    fn is_shared(&self) -> bool {
        self.shared
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Open the configured store, degrading to a private in-memory store when the
/// shared backend cannot be used.
pub fn open_store(settings: &StoreSettings) -> Arc<dyn SharedStore> {
    match settings.backend {
        StoreBackend::Memory => {
            info!("Using in-process store; no coordination with other processes");
            Arc::new(MemoryStore::new().attach())
        }
        StoreBackend::File => {
            let dir = settings.resolved_dir();
            match FileStore::open(&dir) {
                Ok(store) => {
                    info!("Using shared file store at {}", dir.display());
                    Arc::new(store)
                }
                Err(e) => {
                    warn!(
                        "Shared store at {} unavailable ({}), running without cross-context coordination",
                        dir.display(),
                        e
                    );
                    Arc::new(MemoryStore::private())
                }
            }
        }
    }
}
