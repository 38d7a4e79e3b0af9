//! Shared helpers for the SDK integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use docbind_core::{Document, DocumentId, Fields, Result, Revision, StoreError};
use docbind_store::{
    ChangeEvent, ChangeOptions, FetchOptions, MemoryEngine, PutResponse, ReplicationHandle,
    ReplicationOptions, StorageEngine,
};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(10);

pub fn fields(value: Value) -> Fields {
    value.as_object().cloned().expect("object literal")
}

/// Poll `cond` until it holds or the timeout expires.
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(POLL).await;
    }
    cond()
}

/// Like [`eventually`] for conditions that need to await.
pub async fn eventually_async<F, Fut>(cond: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond().await {
            return true;
        }
        sleep(POLL).await;
    }
    cond().await
}

/// A [`MemoryEngine`] whose next `put` calls fail with scripted errors.
#[derive(Default)]
pub struct ScriptedEngine {
    pub inner: MemoryEngine,
    put_errors: Mutex<VecDeque<StoreError>>,
    puts: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(inner: MemoryEngine) -> Self {
        Self {
            inner,
            put_errors: Mutex::new(VecDeque::new()),
            puts: AtomicUsize::new(0),
        }
    }

    /// Fail the next puts with `errors`, in order.
    pub fn fail_next_puts(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.put_errors.lock().extend(errors);
    }

    /// Number of `put` calls seen so far.
    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageEngine for ScriptedEngine {
    type Remote = MemoryEngine;

    async fn fetch(&self, id: &DocumentId, options: FetchOptions) -> Result<Document> {
        self.inner.fetch(id, options).await
    }

    async fn fetch_revision(&self, id: &DocumentId, rev: &Revision) -> Result<Document> {
        self.inner.fetch_revision(id, rev).await
    }

    async fn put(&self, document: Document) -> Result<PutResponse> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let scripted = self.put_errors.lock().pop_front();
        match scripted {
            Some(e) => Err(e),
            None => self.inner.put(document).await,
        }
    }

    async fn put_forced(&self, document: Document) -> Result<PutResponse> {
        self.inner.put_forced(document).await
    }

    fn changes(&self, options: ChangeOptions) -> BoxStream<'static, ChangeEvent> {
        self.inner.changes(options)
    }

    fn replicate(&self, remote: &MemoryEngine, options: ReplicationOptions) -> ReplicationHandle {
        self.inner.replicate(remote, options)
    }
}
