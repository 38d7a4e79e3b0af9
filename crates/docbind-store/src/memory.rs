//! In-memory storage engine with revision trees, a live change feed and
//! bidirectional replication between engines.

use crate::engine::{ChangeEvent, ChangeOptions, FetchOptions, PutResponse, Since, StorageEngine};
use crate::replication::{Backoff, ReplicationHandle, ReplicationOptions};
use crate::tree::{RevisionNode, RevisionTree};
use async_trait::async_trait;
use docbind_core::{Document, DocumentId, Result, Revision, StoreError};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

struct EngineInner {
    name: String,
    docs: RwLock<HashMap<DocumentId, RevisionTree>>,
    seq: AtomicU64,
    offline: AtomicBool,
    change_tx: broadcast::Sender<ChangeEvent>,
}

/// A cloneable handle to an in-memory document store.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("name", &self.inner.name)
            .field("documents", &self.document_count())
            .finish()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new("local")
    }
}

impl MemoryEngine {
    pub fn new(name: impl Into<String>) -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                name: name.into(),
                docs: RwLock::new(HashMap::new()),
                seq: AtomicU64::new(0),
                offline: AtomicBool::new(false),
                change_tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of documents whose winner is not deleted.
    pub fn document_count(&self) -> usize {
        self.inner
            .docs
            .read()
            .values()
            .filter(|tree| !tree.is_deleted())
            .count()
    }

    /// Current sequence number, incremented on every emitted change.
    pub fn update_seq(&self) -> u64 {
        self.inner.seq.load(Ordering::SeqCst)
    }

    /// Simulate a lost connection: every operation fails with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_offline() {
            Err(StoreError::Transient(format!(
                "engine '{}' is offline",
                self.inner.name
            )))
        } else {
            Ok(())
        }
    }

    /// Tombstone the winning revision of a document.
    pub fn remove(&self, id: &DocumentId, rev: &Revision) -> Result<PutResponse> {
        self.write(Document::tombstone(id.clone(), rev.clone()), false)
    }

    /// Forget every revision of a document.
    pub fn purge(&self, id: &DocumentId) -> bool {
        self.inner.docs.write().remove(id).is_some()
    }

    /// All revisions of a document, parents first.
    pub fn export_revisions(&self, id: &DocumentId) -> Result<Vec<(Revision, RevisionNode)>> {
        self.ensure_online()?;
        self.inner
            .docs
            .read()
            .get(id)
            .map(|tree| tree.revisions())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Insert revisions produced by another engine. Returns how many were new.
    pub fn import_revisions(
        &self,
        id: &DocumentId,
        revisions: Vec<(Revision, RevisionNode)>,
    ) -> Result<usize> {
        self.ensure_online()?;
        if revisions.is_empty() {
            return Ok(0);
        }
        let (inserted, event) = {
            let mut docs = self.inner.docs.write();
            let tree = docs.entry(id.clone()).or_default();
            let mut inserted = 0;
            for (rev, node) in revisions {
                if tree.insert(rev, node) {
                    inserted += 1;
                }
            }
            let event = if inserted > 0 {
                self.change_event(id, tree)
            } else {
                None
            };
            (inserted, event)
        };

        if let Some(event) = event {
            self.emit(event);
        }
        Ok(inserted)
    }

    /// Ids of every document the engine knows about, deleted ones included.
    pub fn document_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.inner.docs.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn change_event(&self, id: &DocumentId, tree: &RevisionTree) -> Option<ChangeEvent> {
        let doc = tree.current(id, true)?;
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        Some(ChangeEvent {
            seq,
            document_id: id.clone(),
            revision: doc.rev?,
            deleted: doc.deleted,
            fields: doc.fields,
            conflicts: doc.conflicts,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.change_tx.subscribe()
    }

    fn emit(&self, event: ChangeEvent) {
        debug!(
            engine = %self.inner.name,
            document_id = %event.document_id,
            rev = %event.revision,
            seq = event.seq,
            "change emitted"
        );
        // No receivers is fine: nobody is watching yet.
        let _ = self.inner.change_tx.send(event);
    }

    fn write(&self, document: Document, force: bool) -> Result<PutResponse> {
        self.ensure_online()?;
        let id = document.id.clone();
        let fields = document.data();

        let (rev, event) = {
            let mut docs = self.inner.docs.write();
            let rev = match docs.get_mut(&id) {
                Some(tree) => extend_existing(tree, &id, document.rev.as_ref(), fields, document.deleted, force)?,
                None => {
                    if document.rev.is_some() {
                        return Err(StoreError::NotFound(id.to_string()));
                    }
                    let mut tree = RevisionTree::new();
                    let rev = tree.extend(None, fields, document.deleted);
                    docs.insert(id.clone(), tree);
                    rev
                }
            };
            let event = docs.get(&id).and_then(|tree| self.change_event(&id, tree));
            (rev, event)
        };

        if let Some(event) = event {
            self.emit(event);
        }
        Ok(PutResponse { id, rev })
    }

    fn backlog(&self, include_conflicts: bool) -> Vec<ChangeEvent> {
        let docs = self.inner.docs.read();
        let mut ids: Vec<&DocumentId> = docs.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| {
                let doc = docs.get(id)?.current(id, include_conflicts)?;
                Some(ChangeEvent {
                    seq: self.update_seq(),
                    document_id: id.clone(),
                    revision: doc.rev?,
                    deleted: doc.deleted,
                    fields: doc.fields,
                    conflicts: doc.conflicts,
                })
            })
            .collect()
    }
}

/// Append a write to an existing tree, applying the revision check unless forced.
fn extend_existing(
    tree: &mut RevisionTree,
    id: &DocumentId,
    rev: Option<&Revision>,
    fields: docbind_core::Fields,
    deleted: bool,
    force: bool,
) -> Result<Revision> {
    match rev {
        None => {
            if !force && !tree.is_deleted() {
                return Err(StoreError::Conflict(id.to_string()));
            }
            let parent = tree.winner();
            Ok(tree.extend(parent.as_ref(), fields, deleted))
        }
        Some(rev) => {
            if force {
                if !tree.contains(rev) {
                    return Err(StoreError::NotFound(format!("{}@{}", id, rev)));
                }
            } else if tree.winner().as_ref() != Some(rev) {
                return Err(StoreError::Conflict(id.to_string()));
            }
            Ok(tree.extend(Some(rev), fields, deleted))
        }
    }
}

/// Copy the revisions of `id` that `to` is missing.
fn push_document(from: &MemoryEngine, to: &MemoryEngine, id: &DocumentId) -> Result<usize> {
    match from.export_revisions(id) {
        Ok(revisions) => to.import_revisions(id, revisions),
        Err(StoreError::NotFound(_)) => Ok(0),
        Err(e) => Err(e),
    }
}

/// One full pass in both directions.
fn sync_all(local: &MemoryEngine, remote: &MemoryEngine) -> Result<usize> {
    local.ensure_online()?;
    remote.ensure_online()?;

    let mut copied = 0;
    for id in local.document_ids() {
        copied += push_document(local, remote, &id)?;
    }
    for id in remote.document_ids() {
        copied += push_document(remote, local, &id)?;
    }
    Ok(copied)
}

/// How a replication pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    /// Succeeded on the first attempt.
    Done,
    /// Succeeded after at least one failed attempt.
    Recovered,
    /// Gave up or was cancelled; replication should stop.
    Stopped,
}

/// Run `pass` until it succeeds, honouring the retry policy.
async fn run_pass<F>(
    pass: F,
    options: &ReplicationOptions,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
    label: &str,
) -> PassOutcome
where
    F: Fn() -> Result<usize>,
{
    let mut failed = false;
    loop {
        match pass() {
            Ok(copied) => {
                if copied > 0 {
                    debug!(copied, pass = label, "replication pass copied revisions");
                }
                backoff.reset();
                return if failed {
                    PassOutcome::Recovered
                } else {
                    PassOutcome::Done
                };
            }
            Err(e) if options.retry => {
                failed = true;
                let delay = backoff.next_delay();
                warn!(error = %e, pass = label, delay_ms = delay.as_millis() as u64, "replication pass failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return PassOutcome::Stopped,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                error!(error = %e, pass = label, "replication pass failed");
                return PassOutcome::Stopped;
            }
        }
    }
}

/// Work picked up from the two change feeds.
enum Work {
    Push(DocumentId),
    Pull(DocumentId),
    Resync,
}

async fn run_replication(
    local: MemoryEngine,
    remote: MemoryEngine,
    options: ReplicationOptions,
    cancel: CancellationToken,
) {
    // Subscribe before the first pass so nothing written meanwhile is missed.
    // The raw receivers report lag, which the streamed feed only logs.
    let mut local_rx = local.subscribe();
    let mut remote_rx = remote.subscribe();
    let mut backoff = Backoff::new(&options);

    info!(local = %local.name(), remote = %remote.name(), "replication started");

    let full_sync = || sync_all(&local, &remote);

    if run_pass(full_sync, &options, &mut backoff, &cancel, "initial").await == PassOutcome::Stopped {
        return;
    }
    if !options.continuous {
        info!(local = %local.name(), remote = %remote.name(), "replication complete");
        return;
    }

    loop {
        let work = tokio::select! {
            _ = cancel.cancelled() => {
                info!(local = %local.name(), remote = %remote.name(), "replication cancelled");
                break;
            }
            received = local_rx.recv() => match received {
                Ok(event) => Work::Push(event.document_id),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(engine = %local.name(), skipped, "replication feed lagged, resyncing");
                    Work::Resync
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            received = remote_rx.recv() => match received {
                Ok(event) => Work::Pull(event.document_id),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(engine = %remote.name(), skipped, "replication feed lagged, resyncing");
                    Work::Resync
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let outcome = match &work {
            Work::Push(id) => {
                run_pass(|| push_document(&local, &remote, id), &options, &mut backoff, &cancel, "push").await
            }
            Work::Pull(id) => {
                run_pass(|| push_document(&remote, &local, id), &options, &mut backoff, &cancel, "pull").await
            }
            Work::Resync => run_pass(full_sync, &options, &mut backoff, &cancel, "resync").await,
        };

        match outcome {
            PassOutcome::Stopped => break,
            // Changes made while retrying were queued behind the failed one; catch up in one pass.
            PassOutcome::Recovered if !matches!(work, Work::Resync) => {
                if run_pass(full_sync, &options, &mut backoff, &cancel, "resync").await
                    == PassOutcome::Stopped
                {
                    break;
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    type Remote = MemoryEngine;

    async fn fetch(&self, id: &DocumentId, options: FetchOptions) -> Result<Document> {
        self.ensure_online()?;
        let docs = self.inner.docs.read();
        let tree = docs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if tree.is_deleted() {
            return Err(StoreError::NotFound(format!("{} (deleted)", id)));
        }
        tree.current(id, options.include_conflicts)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn fetch_revision(&self, id: &DocumentId, rev: &Revision) -> Result<Document> {
        self.ensure_online()?;
        self.inner
            .docs
            .read()
            .get(id)
            .and_then(|tree| tree.document_at(id, rev))
            .ok_or_else(|| StoreError::NotFound(format!("{}@{}", id, rev)))
    }

    async fn put(&self, document: Document) -> Result<PutResponse> {
        self.write(document, false)
    }

    async fn put_forced(&self, document: Document) -> Result<PutResponse> {
        self.write(document, true)
    }

    fn changes(&self, options: ChangeOptions) -> BoxStream<'static, ChangeEvent> {
        let mut rx = self.subscribe();
        let backlog = match options.since {
            Since::Now => Vec::new(),
            Since::Beginning => self.backlog(options.include_conflicts),
        };
        let include_conflicts = options.include_conflicts;
        let name = self.inner.name.clone();

        async_stream::stream! {
            for event in backlog {
                yield event;
            }
            loop {
                match rx.recv().await {
                    Ok(mut event) => {
                        if !include_conflicts {
                            event.conflicts.clear();
                        }
                        yield event;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(engine = %name, skipped, "change feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        .boxed()
    }

    fn replicate(&self, remote: &MemoryEngine, options: ReplicationOptions) -> ReplicationHandle {
        let local = self.clone();
        let remote = remote.clone();
        ReplicationHandle::spawn(move |cancel| run_replication(local, remote, options, cancel))
    }
}
