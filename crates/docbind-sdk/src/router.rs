//! Routing of change-feed events to the sessions watching a document.
//!
//! The router does not own the sessions: it keeps weak references in an
//! arena keyed by [`WatchId`] plus an index from document id to watches.

use docbind_core::DocumentId;
use docbind_store::ChangeEvent;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use tracing::{debug, trace};

/// Something interested in the changes of one document.
pub trait ChangeWatcher: Send + Sync {
    fn document_id(&self) -> &DocumentId;

    /// Called synchronously from [`ChangeRouter::dispatch`].
    fn on_change(&self, event: &ChangeEvent);
}

/// Handle of a registration, used to deregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

struct Watch {
    document_id: DocumentId,
    watcher: Weak<dyn ChangeWatcher>,
}

#[derive(Default)]
struct Registry {
    watches: HashMap<WatchId, Watch>,
    by_document: HashMap<DocumentId, Vec<WatchId>>,
}

impl Registry {
    fn remove(&mut self, id: WatchId) -> bool {
        let Some(watch) = self.watches.remove(&id) else {
            return false;
        };
        if let Some(ids) = self.by_document.get_mut(&watch.document_id) {
            ids.retain(|w| *w != id);
            if ids.is_empty() {
                self.by_document.remove(&watch.document_id);
            }
        }
        true
    }
}

/// Process-wide registry of document watchers for one database connection.
pub struct ChangeRouter {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl Default for ChangeRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeRouter {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a watcher for `document_id`.
    pub fn register(&self, document_id: DocumentId, watcher: Weak<dyn ChangeWatcher>) -> WatchId {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut registry = self.registry.write();
        registry
            .by_document
            .entry(document_id.clone())
            .or_default()
            .push(id);
        registry.watches.insert(
            id,
            Watch {
                document_id: document_id.clone(),
                watcher,
            },
        );
        debug!(document_id = %document_id, watch = %id, "watch registered");
        id
    }

    /// Remove a registration. Returns false if it was not registered.
    pub fn deregister(&self, id: WatchId) -> bool {
        let removed = self.registry.write().remove(id);
        if removed {
            debug!(watch = %id, "watch deregistered");
        }
        removed
    }

    /// Deliver `event` to every live watcher of its document.
    ///
    /// All matching watchers have been called when this returns.
    /// Returns the number of watchers notified.
    pub fn dispatch(&self, event: &ChangeEvent) -> usize {
        let targets: Vec<(WatchId, Weak<dyn ChangeWatcher>)> = {
            let registry = self.registry.read();
            registry
                .by_document
                .get(&event.document_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| registry.watches.get(id).map(|w| (*id, w.watcher.clone())))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, watcher) in targets {
            match watcher.upgrade() {
                Some(watcher) => {
                    watcher.on_change(event);
                    delivered += 1;
                }
                None => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut registry = self.registry.write();
            for id in dead {
                registry.remove(id);
            }
        }

        trace!(document_id = %event.document_id, rev = %event.revision, delivered, "change dispatched");
        delivered
    }

    /// Drop every registration.
    pub fn clear(&self) {
        let mut registry = self.registry.write();
        registry.watches.clear();
        registry.by_document.clear();
    }

    pub fn is_registered(&self, id: WatchId) -> bool {
        self.registry.read().watches.contains_key(&id)
    }

    pub fn watch_count(&self) -> usize {
        self.registry.read().watches.len()
    }

    /// Number of registrations for one document.
    pub fn watchers_of(&self, document_id: &DocumentId) -> usize {
        self.registry
            .read()
            .by_document
            .get(document_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
