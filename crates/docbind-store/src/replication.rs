//! Replication options and handles.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How a replication behaves on failure and after the first pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationOptions {
    /// Retry failed passes with exponential backoff instead of stopping.
    pub retry: bool,
    /// Keep replicating new changes after the initial pass.
    pub continuous: bool,
    /// First retry delay.
    pub initial_backoff: Duration,
    /// Upper bound for the retry delay.
    pub max_backoff: Duration,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            retry: true,
            continuous: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ReplicationOptions {
    /// A single pass in both directions, no retries.
    pub fn one_shot() -> Self {
        Self {
            retry: false,
            continuous: false,
            ..Default::default()
        }
    }
}

/// Exponential backoff bounded by `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(options: &ReplicationOptions) -> Self {
        Self {
            current: options.initial_backoff,
            initial: options.initial_backoff,
            max: options.max_backoff,
        }
    }

    /// The delay to wait now; doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// A running replication. Dropping the handle does not stop it; call [`cancel`].
///
/// [`cancel`]: ReplicationHandle::cancel
#[derive(Debug)]
pub struct ReplicationHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReplicationHandle {
    /// Spawn `run` with a fresh cancellation token.
    pub fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(cancel.clone()));
        Self { cancel, task }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the replication task has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the replication task to return.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}
