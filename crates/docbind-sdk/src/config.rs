//! Configuration for databases, replication and document sessions.

use docbind_core::{ConflictResolver, DeepMergeResolver};
use docbind_store::ReplicationOptions;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for replication with a remote endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// Let the engine retry failed replication passes.
    pub retry: bool,
    /// Keep replicating after the first pass.
    pub continuous: bool,
    /// First retry delay (in milliseconds).
    pub initial_backoff_ms: u64,
    /// Maximum retry delay (in milliseconds).
    pub max_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: true,
            continuous: true,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn replication_options(&self) -> ReplicationOptions {
        ReplicationOptions {
            retry: self.retry,
            continuous: self.continuous,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn retry(mut self, enabled: bool) -> Self {
        self.config.retry = enabled;
        self
    }

    pub fn continuous(mut self, enabled: bool) -> Self {
        self.config.continuous = enabled;
        self
    }

    pub fn initial_backoff(mut self, ms: u64) -> Self {
        self.config.initial_backoff_ms = ms;
        self
    }

    pub fn max_backoff(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a [`Database`](crate::Database).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Name of the local database.
    pub name: String,
    /// Follow the local change feed even without a remote endpoint, so that
    /// sessions sharing one engine see each other's writes.
    ///
    /// A session learns the revision of a merged conflict write only through
    /// this feed. With it off, the session keeps its pre-merge revision and
    /// its next write conflicts again before being merged.
    pub watch_local_changes: bool,
    /// Ask the change feed for conflict lists.
    pub include_conflicts: bool,
    /// Replication settings used once a remote is configured.
    pub sync: SyncConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            watch_local_changes: true,
            include_conflicts: true,
            sync: SyncConfig::default(),
        }
    }
}

/// Builder for database configuration.
pub struct DatabaseConfigBuilder {
    config: DatabaseConfig,
}

impl DatabaseConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DatabaseConfig::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn watch_local_changes(mut self, enabled: bool) -> Self {
        self.config.watch_local_changes = enabled;
        self
    }

    pub fn include_conflicts(mut self, enabled: bool) -> Self {
        self.config.include_conflicts = enabled;
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn build(self) -> DatabaseConfig {
        self.config
    }
}

impl Default for DatabaseConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session options.
#[derive(Clone)]
pub struct SessionOptions {
    /// Log conflict diagnostics at `info` instead of `debug`.
    pub debug: bool,
    /// Conflict strategy. `None` leaves conflicts unresolved.
    pub on_conflict: Option<Arc<dyn ConflictResolver>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            debug: false,
            on_conflict: Some(Arc::new(DeepMergeResolver)),
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn on_conflict(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.on_conflict = Some(Arc::new(resolver));
        self
    }

    pub fn without_conflict_handler(mut self) -> Self {
        self.on_conflict = None;
        self
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("debug", &self.debug)
            .field("on_conflict", &self.on_conflict.is_some())
            .finish()
    }
}
