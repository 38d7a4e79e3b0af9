//! # docbind-core
//!
//! Document model shared by the docbind storage engine and SDK:
//! - [`Document`], [`DocumentId`], [`Revision`] and [`Fields`]
//! - the deep [`merge`] used to reconcile divergent versions
//! - pluggable [`ConflictResolver`] strategies
//! - the [`StoreError`] taxonomy

pub mod document;
pub mod error;
pub mod merge;
pub mod resolver;

pub use document::{
    strip_reserved, without_reserved, Document, DocumentId, Fields, Revision, RESERVED_FIELDS,
};
pub use error::{Result, StoreError};
pub use merge::{merge, merge_values};
pub use resolver::{ConflictResolver, DeepMergeResolver, PreferTheirs, PreferYours};
