//! Document sessions.
//!
//! A [`DocumentSession`] mirrors one stored document into local state. Local
//! writes are applied optimistically and then persisted; remote changes
//! arrive through the [`ChangeRouter`] and replace the local state unless
//! they are the echo of a write this session made itself. Diverged versions
//! are reconciled with the session's [`ConflictResolver`].
//!
//! State machine: uninitialized until the first load, local write or remote
//! change; initialized for the rest of the session's life.

use crate::config::SessionOptions;
use crate::router::{ChangeRouter, ChangeWatcher, WatchId};
use docbind_core::{strip_reserved, without_reserved, Document, DocumentId, Fields, Revision, StoreError};
use docbind_store::{ChangeEvent, FetchOptions, StorageEngine};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a collaborator renders: the document fields and whether they are loaded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub data: Fields,
    pub initialized: bool,
}

/// A snapshot, or the loading placeholder while nothing has been loaded yet.
#[derive(Clone, Debug, PartialEq)]
pub enum View {
    Loading,
    Ready(Snapshot),
}

impl View {
    pub fn is_loading(&self) -> bool {
        matches!(self, View::Loading)
    }

    /// The snapshot, or `placeholder` while loading.
    pub fn or_placeholder<T>(&self, placeholder: T, render: impl FnOnce(&Snapshot) -> T) -> T {
        match self {
            View::Loading => placeholder,
            View::Ready(snapshot) => render(snapshot),
        }
    }
}

/// Events emitted whenever a session's snapshot changes.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// The initial fetch completed.
    Loaded(Snapshot),
    /// A local write was applied optimistically.
    LocalUpdate(Snapshot),
    /// A remote change was adopted.
    RemoteUpdate(Snapshot),
    /// A conflict was resolved and the merged fields adopted.
    ConflictResolved(Snapshot),
}

impl SessionEvent {
    pub fn snapshot(&self) -> &Snapshot {
        match self {
            SessionEvent::Loaded(s)
            | SessionEvent::LocalUpdate(s)
            | SessionEvent::RemoteUpdate(s)
            | SessionEvent::ConflictResolved(s) => s,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    revision: Option<Revision>,
    data: Fields,
    initialized: bool,
}

impl SessionState {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            data: self.data.clone(),
            initialized: self.initialized,
        }
    }
}

struct SessionInner<E: StorageEngine> {
    document_id: DocumentId,
    engine: Arc<E>,
    router: Arc<ChangeRouter>,
    watch_id: WatchId,
    this: Weak<SessionInner<E>>,
    state: RwLock<SessionState>,
    disposed: AtomicBool,
    /// Cancelled on dispose to release `wait_initialized` callers.
    closed: CancellationToken,
    options: SessionOptions,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl<E: StorageEngine> SessionInner<E> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn notify(&self, event: fn(Snapshot) -> SessionEvent) {
        let snapshot = self.state.read().snapshot();
        let _ = self.event_tx.send(event(snapshot));
    }

    /// Replace revision and data, and mark the session initialized.
    fn adopt(&self, revision: Option<Revision>, data: Fields, event: fn(Snapshot) -> SessionEvent) {
        {
            let mut state = self.state.write();
            state.revision = revision;
            state.data = data;
            state.initialized = true;
        }
        self.notify(event);
    }

    fn set_revision(&self, revision: Revision) {
        self.state.write().revision = Some(revision);
    }

    fn log_conflict(&self, yours: &Document, theirs: &Document) {
        if self.options.debug {
            info!(
                document_id = %self.document_id,
                yours = ?yours.rev,
                theirs = ?theirs.rev,
                "document conflict (yours, theirs)"
            );
        } else {
            debug!(
                document_id = %self.document_id,
                yours = ?yours.rev,
                theirs = ?theirs.rev,
                "document conflict (yours, theirs)"
            );
        }
    }

    async fn load(self: Arc<Self>) {
        let result = self
            .engine
            .fetch(&self.document_id, FetchOptions::with_conflicts())
            .await;
        if self.is_disposed() {
            return;
        }

        match result {
            Ok(doc) => {
                if self.state.read().initialized {
                    debug!(document_id = %self.document_id, "initial load superseded by a newer state");
                } else {
                    self.adopt(doc.rev.clone(), doc.data(), SessionEvent::Loaded);
                }
                if let Some(conflict) = doc.first_conflict().cloned() {
                    self.resolve_with_revision(doc, conflict).await;
                }
            }
            Err(StoreError::NotFound(_)) => {
                if !self.state.read().initialized {
                    self.adopt(None, Fields::new(), SessionEvent::Loaded);
                }
            }
            Err(e) => {
                error!(document_id = %self.document_id, error = %e, "failed to load document");
            }
        }
    }

    async fn persist(self: Arc<Self>, outgoing: Document) {
        let result = self.engine.put(outgoing.clone()).await;
        if self.is_disposed() {
            return;
        }

        match result {
            Ok(res) => self.set_revision(res.rev),
            Err(StoreError::Conflict(_)) => {
                debug!(document_id = %self.document_id, rev = ?outgoing.rev, "write conflicted, fetching current version");
                match self
                    .engine
                    .fetch(&self.document_id, FetchOptions::default())
                    .await
                {
                    Ok(current) => self.resolve_conflict(outgoing, current).await,
                    Err(e) => {
                        error!(document_id = %self.document_id, error = %e, "failed to fetch document after conflict");
                    }
                }
            }
            Err(StoreError::NotFound(_)) => {
                // The document vanished under us: write it again as a creation.
                let create = Document::new(self.document_id.clone(), outgoing.fields);
                let retried = self.engine.put(create).await;
                if self.is_disposed() {
                    return;
                }
                match retried {
                    Ok(res) => self.set_revision(res.rev),
                    Err(e) => {
                        error!(document_id = %self.document_id, error = %e, "failed to recreate document");
                    }
                }
            }
            Err(e) => {
                error!(document_id = %self.document_id, error = %e, "failed to put document");
            }
        }
    }

    async fn resolve_with_revision(self: Arc<Self>, yours: Document, conflict: Revision) {
        if self.is_disposed() {
            return;
        }
        match self.engine.fetch_revision(&self.document_id, &conflict).await {
            Ok(theirs) => self.resolve_conflict(yours, theirs).await,
            Err(e) => {
                error!(document_id = %self.document_id, rev = %conflict, error = %e, "failed to fetch conflicting revision");
            }
        }
    }

    async fn resolve_conflict(self: Arc<Self>, yours: Document, theirs: Document) {
        if self.is_disposed() {
            return;
        }
        self.log_conflict(&yours, &theirs);

        let Some(resolver) = self.options.on_conflict.clone() else {
            return;
        };

        let winning = std::cmp::max(yours.rev.clone(), theirs.rev.clone());
        let losing = std::cmp::min(yours.rev.clone(), theirs.rev.clone());
        let merged = resolver.resolve(&yours, &theirs).data();

        let tombstone = match losing {
            Some(rev) if Some(&rev) != winning.as_ref() => {
                Some(Document::tombstone(self.document_id.clone(), rev))
            }
            _ => None,
        };
        let merge_write =
            Document::new(self.document_id.clone(), merged.clone()).with_revision(winning);

        let engine = self.engine.clone();
        let delete_loser = async move {
            match tombstone {
                Some(doc) => engine.put_forced(doc).await.map(Some),
                None => Ok(None),
            }
        };
        let write_merge = self.engine.put(merge_write);

        {
            let mut state = self.state.write();
            state.data = merged;
            state.initialized = true;
        }
        self.notify(SessionEvent::ConflictResolved);

        // The tombstone and the merge write are independent; neither waits for the other.
        let (deleted, written) = tokio::join!(delete_loser, write_merge);

        if let Err(e) = deleted {
            error!(document_id = %self.document_id, error = %e, "failed to delete losing revision");
        }
        match written {
            Ok(res) => {
                debug!(document_id = %self.document_id, rev = %res.rev, "merged document written");
            }
            Err(e) if e.is_conflict() => {
                warn!(document_id = %self.document_id, error = %e, "merged document superseded");
            }
            Err(e) => {
                error!(document_id = %self.document_id, error = %e, "failed to write merged document");
            }
        }
    }
}

impl<E: StorageEngine> ChangeWatcher for SessionInner<E> {
    fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    fn on_change(&self, event: &ChangeEvent) {
        if self.is_disposed() {
            return;
        }
        if event.document_id != self.document_id {
            warn!(document_id = %self.document_id, other = %event.document_id, "ignoring change for another document");
            return;
        }

        if let Some(conflict) = event.first_conflict() {
            if let Some(this) = self.this.upgrade() {
                tokio::spawn(this.resolve_with_revision(event.to_document(), conflict.clone()));
            }
        }

        let adopted = {
            let mut state = self.state.write();
            if state.revision.as_ref() == Some(&event.revision) {
                false
            } else {
                state.revision = Some(event.revision.clone());
                state.data = without_reserved(&event.fields);
                state.initialized = true;
                true
            }
        };

        if adopted {
            debug!(document_id = %self.document_id, rev = %event.revision, "remote change adopted");
            self.notify(SessionEvent::RemoteUpdate);
        }
    }
}

/// A local working copy of one document, kept in sync with the store.
///
/// Dropping the session disposes it.
pub struct DocumentSession<E: StorageEngine> {
    inner: Arc<SessionInner<E>>,
}

impl<E: StorageEngine> DocumentSession<E> {
    /// Register with `router` and start loading `document_id` from `engine`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        engine: Arc<E>,
        router: Arc<ChangeRouter>,
        document_id: impl Into<DocumentId>,
        options: SessionOptions,
    ) -> Self {
        let document_id = document_id.into();
        let (event_tx, _) = broadcast::channel(100);

        let inner = Arc::new_cyclic(|this: &Weak<SessionInner<E>>| {
            let watcher: Weak<dyn ChangeWatcher> = this.clone();
            let watch_id = router.register(document_id.clone(), watcher);
            SessionInner {
                document_id,
                engine,
                router: router.clone(),
                watch_id,
                this: this.clone(),
                state: RwLock::new(SessionState::default()),
                disposed: AtomicBool::new(false),
                closed: CancellationToken::new(),
                options,
                event_tx,
            }
        });

        tokio::spawn(inner.clone().load());

        Self { inner }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.inner.document_id
    }

    pub fn watch_id(&self) -> WatchId {
        self.inner.watch_id
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.state.read().snapshot()
    }

    /// Current field data, reserved metadata excluded.
    pub fn data(&self) -> Fields {
        self.inner.state.read().data.clone()
    }

    /// Revision the local state is based on, if any.
    pub fn revision(&self) -> Option<Revision> {
        self.inner.state.read().revision.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.read().initialized
    }

    /// The loading placeholder until initialized, the snapshot afterwards.
    pub fn view(&self) -> View {
        let state = self.inner.state.read();
        if state.initialized {
            View::Ready(state.snapshot())
        } else {
            View::Loading
        }
    }

    /// Apply `patch` locally and persist it.
    ///
    /// The local state reflects the patch as soon as this returns. The
    /// returned handle completes once the write (and any conflict handling
    /// it triggered) is done; awaiting it is optional.
    pub fn put_document(&self, patch: Fields) -> JoinHandle<()> {
        if self.inner.is_disposed() {
            warn!(document_id = %self.inner.document_id, "write on a disposed session ignored");
            return tokio::spawn(async {});
        }

        let mut patch = patch;
        strip_reserved(&mut patch);

        let outgoing = {
            let mut state = self.inner.state.write();
            for (key, value) in &patch {
                state.data.insert(key.clone(), value.clone());
            }
            state.initialized = true;
            Document::new(self.inner.document_id.clone(), patch).with_revision(state.revision.clone())
        };
        self.inner.notify(SessionEvent::LocalUpdate);

        tokio::spawn(self.inner.clone().persist(outgoing))
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Wait until the session is initialized.
    ///
    /// Returns early once the session is disposed. Never completes if the
    /// initial load fails and nothing else initializes the session; wrap it
    /// in a timeout where that matters.
    pub async fn wait_initialized(&self) {
        let mut rx = self.subscribe();
        loop {
            if self.is_initialized() || self.is_disposed() {
                return;
            }
            tokio::select! {
                _ = self.inner.closed.cancelled() => return,
                received = rx.recv() => match received {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    /// Deregister from the router. Pending operations become no-ops.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.router.deregister(self.inner.watch_id);
        self.inner.closed.cancel();
        debug!(document_id = %self.inner.document_id, "session disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl<E: StorageEngine> Drop for DocumentSession<E> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<E: StorageEngine> std::fmt::Debug for DocumentSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("document_id", &self.inner.document_id)
            .field("watch_id", &self.inner.watch_id)
            .field("revision", &self.revision())
            .field("initialized", &self.is_initialized())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
