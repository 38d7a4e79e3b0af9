//! # docbind-store
//!
//! Storage engine layer for docbind.
//!
//! This crate provides:
//! - the [`StorageEngine`] trait: the calls a document session makes to a
//!   replicated document store
//! - [`MemoryEngine`], an in-process engine with revision trees, conflict
//!   detection, a live change feed and bidirectional replication
//!
//! ## Example
//!
//! ```rust,ignore
//! use docbind_store::{FetchOptions, MemoryEngine, StorageEngine};
//! use docbind_core::Document;
//!
//! let engine = MemoryEngine::new("local");
//! let res = engine.put(Document::new("settings", fields)).await?;
//! let doc = engine.fetch(&res.id, FetchOptions::with_conflicts()).await?;
//! ```

pub mod engine;
pub mod memory;
pub mod replication;
pub mod tree;

pub use engine::{ChangeEvent, ChangeOptions, FetchOptions, PutResponse, Since, StorageEngine};
pub use memory::MemoryEngine;
pub use replication::{Backoff, ReplicationHandle, ReplicationOptions};
pub use tree::{derive_revision, RevisionNode, RevisionTree};
