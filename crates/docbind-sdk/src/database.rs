//! Database handle: owns the engine, the change router and the sync
//! lifecycle, and opens document sessions.

use crate::config::{DatabaseConfig, SessionOptions};
use crate::lifecycle::SyncLifecycle;
use crate::router::ChangeRouter;
use crate::session::DocumentSession;
use docbind_core::DocumentId;
use docbind_store::{MemoryEngine, StorageEngine};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// A local database, optionally replicating with a remote.
///
/// Sessions opened from the same database share one [`ChangeRouter`], so a
/// write through one session reaches every other session on that document.
pub struct Database<E: StorageEngine> {
    engine: Arc<E>,
    router: Arc<ChangeRouter>,
    lifecycle: Mutex<SyncLifecycle<E>>,
    config: DatabaseConfig,
}

impl<E: StorageEngine> Database<E> {
    /// Wrap `engine`. Must be called from within a Tokio runtime when
    /// `watch_local_changes` is enabled.
    pub fn new(engine: E, config: DatabaseConfig) -> Self {
        Self::with_engine(Arc::new(engine), config)
    }

    pub fn with_engine(engine: Arc<E>, config: DatabaseConfig) -> Self {
        let router = Arc::new(ChangeRouter::new());
        let mut lifecycle = SyncLifecycle::new(
            engine.clone(),
            router.clone(),
            config.sync.clone(),
            config.include_conflicts,
        );
        if config.watch_local_changes {
            lifecycle.watch_local();
        }
        info!(name = %config.name, "database opened");

        Self {
            engine,
            router,
            lifecycle: Mutex::new(lifecycle),
            config,
        }
    }

    /// Open a database and start replicating with `remote` right away.
    pub fn connect(engine: E, config: DatabaseConfig, remote: &E::Remote) -> Self {
        let db = Self::new(engine, config);
        db.set_remote(Some(remote));
        db
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn router(&self) -> &Arc<ChangeRouter> {
        &self.router
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Open a session on `document_id` with default options.
    pub fn open_document(&self, document_id: impl Into<DocumentId>) -> DocumentSession<E> {
        self.open_document_with(document_id, SessionOptions::default())
    }

    pub fn open_document_with(
        &self,
        document_id: impl Into<DocumentId>,
        options: SessionOptions,
    ) -> DocumentSession<E> {
        DocumentSession::open(self.engine.clone(), self.router.clone(), document_id, options)
    }

    /// Start replicating with `remote`, or stop syncing with `None`.
    ///
    /// Stopping a running replication drops every router registration;
    /// sessions opened before that no longer receive changes. The local
    /// change feed is restarted afterwards when `watch_local_changes` is
    /// set. Without a running replication, `None` does nothing. Returns
    /// whether a new replication was started.
    pub fn set_remote(&self, remote: Option<&E::Remote>) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        match remote {
            Some(remote) => lifecycle.activate(remote),
            None => {
                if lifecycle.is_active() {
                    lifecycle.deactivate();
                    if self.config.watch_local_changes {
                        lifecycle.watch_local();
                    }
                }
                false
            }
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.lifecycle.lock().is_active()
    }

    /// Stop replication and the change feed.
    pub fn close(&self) {
        self.lifecycle.lock().deactivate();
        info!(name = %self.config.name, "database closed");
    }
}

impl Database<MemoryEngine> {
    /// A database backed by a fresh [`MemoryEngine`] named after the config.
    pub fn in_memory(config: DatabaseConfig) -> Self {
        let engine = MemoryEngine::new(config.name.clone());
        Self::new(engine, config)
    }
}

impl<E: StorageEngine> std::fmt::Debug for Database<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.config.name)
            .field("watches", &self.router.watch_count())
            .field("syncing", &self.is_syncing())
            .finish()
    }
}
