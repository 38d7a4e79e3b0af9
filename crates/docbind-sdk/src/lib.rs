//! docbind SDK - bind application state to replicated documents
//!
//! A [`DocumentSession`] keeps a local copy of one document. Writes are
//! applied locally first and persisted in the background; changes arriving
//! from other sessions or from a replicated remote replace the local copy;
//! diverged revisions are merged with a [`ConflictResolver`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use docbind_sdk::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let db = Database::in_memory(DatabaseConfig::default());
//!     let remote = MemoryEngine::new("remote");
//!     db.set_remote(Some(&remote));
//!
//!     let session = db.open_document("settings");
//!     session.wait_initialized().await;
//!
//!     let patch = json!({ "theme": "dark" }).as_object().cloned().unwrap();
//!     session.put_document(patch);
//!
//!     assert_eq!(session.data()["theme"], "dark");
//! }
//! ```
//!
//! # Architecture
//!
//! - [`database`] - Engine, router and sync lifecycle for one local database
//! - [`session`] - Per-document sessions and their events
//! - [`router`] - Fan-out of change-feed events to sessions
//! - [`lifecycle`] - Replication and change-feed tasks
//! - [`config`] - Configuration types and builders

pub mod config;
pub mod database;
pub mod lifecycle;
pub mod router;
pub mod session;

// Re-exports for convenience
pub use config::{
    DatabaseConfig, DatabaseConfigBuilder, SessionOptions, SyncConfig, SyncConfigBuilder,
};
pub use database::Database;
pub use lifecycle::SyncLifecycle;
pub use router::{ChangeRouter, ChangeWatcher, WatchId};
pub use session::{DocumentSession, SessionEvent, Snapshot, View};

pub use docbind_core::{
    ConflictResolver, DeepMergeResolver, Document, DocumentId, Fields, PreferTheirs, PreferYours,
    Revision, StoreError,
};
pub use docbind_store::{MemoryEngine, StorageEngine};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{DatabaseConfig, SessionOptions, SyncConfig};
    pub use crate::database::Database;
    pub use crate::session::{DocumentSession, SessionEvent, Snapshot, View};
    pub use docbind_core::{ConflictResolver, DeepMergeResolver, Document, DocumentId, Fields};
    pub use docbind_store::{MemoryEngine, StorageEngine};
}
