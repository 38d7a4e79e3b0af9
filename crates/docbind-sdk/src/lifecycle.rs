//! Sync lifecycle: replication with a remote plus the change feed that
//! drives the [`ChangeRouter`].

use crate::config::SyncConfig;
use crate::router::ChangeRouter;
use docbind_store::{ChangeOptions, ReplicationHandle, Since, StorageEngine};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct ChangeFeed {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ChangeFeed {
    /// Subscribe to the engine's live changes and dispatch them to `router`.
    fn start<E: StorageEngine>(engine: &E, router: Arc<ChangeRouter>, include_conflicts: bool) -> Self {
        // Subscribe before spawning so no change made after `start` is missed.
        let mut changes = engine.changes(ChangeOptions {
            include_conflicts,
            since: Since::Now,
        });
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = changes.next() => match next {
                        Some(event) => {
                            router.dispatch(&event);
                        }
                        None => break,
                    },
                }
            }
            debug!("change feed stopped");
        });

        Self { cancel, task }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

/// Starts and stops replication and the change feed for one database.
///
/// At most one replication and one change feed run at a time.
pub struct SyncLifecycle<E: StorageEngine> {
    engine: Arc<E>,
    router: Arc<ChangeRouter>,
    config: SyncConfig,
    include_conflicts: bool,
    replication: Option<ReplicationHandle>,
    feed: Option<ChangeFeed>,
}

impl<E: StorageEngine> SyncLifecycle<E> {
    pub fn new(
        engine: Arc<E>,
        router: Arc<ChangeRouter>,
        config: SyncConfig,
        include_conflicts: bool,
    ) -> Self {
        Self {
            engine,
            router,
            config,
            include_conflicts,
            replication: None,
            feed: None,
        }
    }

    /// Start replicating with `remote` and following the change feed.
    ///
    /// Returns false without doing anything if a replication is already
    /// running. Must be called from within a Tokio runtime.
    pub fn activate(&mut self, remote: &E::Remote) -> bool {
        if self.is_active() {
            debug!("sync already active");
            return false;
        }

        let options = self.config.replication_options();
        self.replication = Some(self.engine.replicate(remote, options));
        self.watch_local();
        info!(continuous = self.config.continuous, "sync activated");
        true
    }

    /// Follow the local change feed without replicating.
    ///
    /// Returns false if the feed is already running.
    pub fn watch_local(&mut self) -> bool {
        if self.is_watching() {
            return false;
        }
        self.feed = Some(ChangeFeed::start(
            self.engine.as_ref(),
            self.router.clone(),
            self.include_conflicts,
        ));
        debug!("change feed started");
        true
    }

    /// Stop replication and the change feed, and drop every router
    /// registration.
    pub fn deactivate(&mut self) {
        if let Some(replication) = self.replication.take() {
            replication.cancel();
        }
        if let Some(feed) = self.feed.take() {
            feed.stop();
        }
        self.router.clear();
        info!("sync deactivated");
    }

    /// True while a replication is running.
    pub fn is_active(&self) -> bool {
        self.replication
            .as_ref()
            .is_some_and(|r| !r.is_cancelled() && !r.is_finished())
    }

    pub fn is_watching(&self) -> bool {
        self.feed.as_ref().is_some_and(ChangeFeed::is_running)
    }
}

impl<E: StorageEngine> Drop for SyncLifecycle<E> {
    fn drop(&mut self) {
        if let Some(replication) = &self.replication {
            replication.cancel();
        }
        if let Some(feed) = &self.feed {
            feed.stop();
        }
    }
}
