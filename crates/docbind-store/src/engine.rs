//! Storage engine abstraction.
//!
//! The document sessions only ever talk to the store through this trait:
//! point reads, revision-checked writes, forced writes, a live change feed
//! and continuous replication against a remote endpoint.

use crate::replication::{ReplicationHandle, ReplicationOptions};
use async_trait::async_trait;
use docbind_core::{Document, DocumentId, Fields, Result, Revision};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Options for [`StorageEngine::fetch`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Populate [`Document::conflicts`] with the losing leaf revisions.
    pub include_conflicts: bool,
}

impl FetchOptions {
    pub fn with_conflicts() -> Self {
        Self {
            include_conflicts: true,
        }
    }
}

/// Successful write acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    pub id: DocumentId,
    pub rev: Revision,
}

/// Where a change feed starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Since {
    /// Only changes made after the subscription.
    #[default]
    Now,
    /// Replay the current state of every document first.
    Beginning,
}

/// Options for [`StorageEngine::changes`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeOptions {
    pub include_conflicts: bool,
    pub since: Since,
}

/// A change notification: the winning version of a document after a write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub document_id: DocumentId,
    pub revision: Revision,
    pub deleted: bool,
    pub fields: Fields,
    pub conflicts: Vec<Revision>,
}

impl ChangeEvent {
    /// The changed document, metadata included.
    pub fn to_document(&self) -> Document {
        Document {
            id: self.document_id.clone(),
            rev: Some(self.revision.clone()),
            deleted: self.deleted,
            conflicts: self.conflicts.clone(),
            fields: self.fields.clone(),
        }
    }

    pub fn first_conflict(&self) -> Option<&Revision> {
        self.conflicts.first()
    }
}

/// The capability set a document session needs from a replicated store.
#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    /// Remote endpoint type accepted by [`StorageEngine::replicate`].
    type Remote: Clone + Send + Sync + 'static;

    /// Fetch the current winning version of a document.
    ///
    /// Fails with `NotFound` when the document is missing or deleted.
    async fn fetch(&self, id: &DocumentId, options: FetchOptions) -> Result<Document>;

    /// Fetch a specific revision of a document.
    async fn fetch_revision(&self, id: &DocumentId, rev: &Revision) -> Result<Document>;

    /// Revision-checked write.
    ///
    /// A document without `rev` is a creation attempt; a document with `rev`
    /// must name the current winning revision.
    async fn put(&self, document: Document) -> Result<PutResponse>;

    /// Write that bypasses the revision check, used to tombstone losing branches.
    async fn put_forced(&self, document: Document) -> Result<PutResponse>;

    /// Live change feed.
    fn changes(&self, options: ChangeOptions) -> BoxStream<'static, ChangeEvent>;

    /// Start replicating with `remote` in both directions.
    fn replicate(&self, remote: &Self::Remote, options: ReplicationOptions) -> ReplicationHandle;
}
