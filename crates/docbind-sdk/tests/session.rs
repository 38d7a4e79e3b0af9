//! Integration tests for document sessions against the in-memory engine.

mod common;

use common::{eventually, eventually_async, fields, ScriptedEngine};
use docbind_core::StoreError;
use docbind_sdk::prelude::*;
use docbind_sdk::{DatabaseConfigBuilder, Revision};
use docbind_store::{ChangeEvent, FetchOptions, ReplicationOptions};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn quiet_config() -> DatabaseConfig {
    DatabaseConfigBuilder::new().watch_local_changes(false).build()
}

#[tokio::test]
async fn test_missing_document_initializes_empty() {
    let db = Database::in_memory(DatabaseConfig::default());
    let session = db.open_document("alpha");

    assert!(eventually(|| session.is_initialized()).await);
    assert!(session.data().is_empty());
    assert!(session.revision().is_none());
    assert_eq!(
        session.view(),
        View::Ready(Snapshot {
            data: Fields::new(),
            initialized: true
        })
    );
}

#[tokio::test]
async fn test_existing_document_loads_without_metadata() {
    let db = Database::in_memory(DatabaseConfig::default());
    let res = db
        .engine()
        .put(Document::new("alpha", fields(json!({ "value": "hi" }))))
        .await
        .unwrap();

    let session = db.open_document("alpha");
    session.wait_initialized().await;

    assert_eq!(session.data(), fields(json!({ "value": "hi" })));
    assert_eq!(session.revision(), Some(res.rev));
    assert!(!session.data().contains_key("_id"));
    assert!(!session.data().contains_key("_rev"));
}

#[tokio::test]
async fn test_put_on_fresh_session() {
    let db = Database::in_memory(DatabaseConfig::default());
    let session = db.open_document("alpha");

    let handle = session.put_document(fields(json!({ "count": 1 })));
    assert_eq!(session.data()["count"], json!(1));
    assert!(session.is_initialized());

    handle.await.unwrap();
    let rev = session.revision().expect("revision after persisting");
    assert_eq!(rev.generation(), 1);

    let stored = db
        .engine()
        .fetch(&DocumentId::from("alpha"), FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(stored.data(), fields(json!({ "count": 1 })));
    assert_eq!(stored.rev, Some(rev));
}

#[tokio::test]
async fn test_second_session_sees_write() {
    let db = Database::in_memory(DatabaseConfig::default());
    let writer = db.open_document("alpha");
    let watcher = db.open_document("alpha");
    writer.wait_initialized().await;
    watcher.wait_initialized().await;

    let mut writer_events = writer.subscribe();
    writer
        .put_document(fields(json!({ "text": "Finish" })))
        .await
        .unwrap();

    assert!(eventually(|| watcher.data().get("text") == Some(&json!("Finish"))).await);
    assert_eq!(watcher.revision(), writer.revision());

    // The writer's own echo carries the revision it already holds.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut saw_local = false;
    while let Ok(event) = writer_events.try_recv() {
        match event {
            SessionEvent::LocalUpdate(_) => saw_local = true,
            SessionEvent::RemoteUpdate(_) => panic!("echo was adopted as a remote update"),
            _ => {}
        }
    }
    assert!(saw_local);
}

#[tokio::test]
async fn test_write_conflict_is_merged() {
    let db = Database::in_memory(quiet_config());
    let engine = db.engine().clone();
    let id = DocumentId::from("alpha");
    let first = engine
        .put(Document::new("alpha", fields(json!({ "v": 1 }))))
        .await
        .unwrap();

    let session = db.open_document_with("alpha", SessionOptions::new().debug(true));
    session.wait_initialized().await;
    assert_eq!(session.revision(), Some(first.rev.clone()));

    // Someone else moves the document on.
    engine
        .put(
            Document::new("alpha", fields(json!({ "v": 2, "w": 3 })))
                .with_revision(Some(first.rev.clone())),
        )
        .await
        .unwrap();

    session
        .put_document(fields(json!({ "v": 1 })))
        .await
        .unwrap();

    // Yours wins the scalar collision, theirs keeps its own field.
    let merged = fields(json!({ "v": 1, "w": 3 }));
    assert_eq!(session.data(), merged);

    let stored = engine.fetch(&id, FetchOptions::with_conflicts()).await.unwrap();
    assert_eq!(stored.data(), merged);
    assert_eq!(stored.rev.as_ref().map(Revision::generation), Some(3));
    assert!(stored.conflicts.is_empty());

    let tombstoned = engine
        .export_revisions(&id)
        .unwrap()
        .into_iter()
        .any(|(_, node)| node.deleted && node.parent.as_ref() == Some(&first.rev));
    assert!(tombstoned);
}

#[tokio::test]
async fn test_write_after_purge_recreates() {
    let db = Database::in_memory(quiet_config());
    let engine = db.engine().clone();
    let id = DocumentId::from("alpha");
    engine
        .put(Document::new("alpha", fields(json!({ "old": true }))))
        .await
        .unwrap();

    let session = db.open_document("alpha");
    session.wait_initialized().await;
    assert!(engine.purge(&id));

    session
        .put_document(fields(json!({ "x": 1 })))
        .await
        .unwrap();

    let stored = engine.fetch(&id, FetchOptions::default()).await.unwrap();
    assert_eq!(stored.data(), fields(json!({ "x": 1 })));
    assert_eq!(session.revision(), stored.rev);
    assert_eq!(session.revision().map(|r| r.generation()), Some(1));
}

#[tokio::test]
async fn test_failed_load_stays_loading() {
    let db = Database::in_memory(DatabaseConfig::default());
    db.engine().set_offline(true);

    let session = db.open_document("alpha");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!session.is_initialized());
    assert!(session.view().is_loading());
    assert_eq!(session.view().or_placeholder("Loading...", |_| "ready"), "Loading...");
}

#[tokio::test]
async fn test_failed_write_keeps_optimistic_state() {
    let db = Database::in_memory(DatabaseConfig::default());
    let engine = db.engine().clone();
    let session = db.open_document("alpha");
    session.wait_initialized().await;

    engine.set_offline(true);
    session
        .put_document(fields(json!({ "a": 1 })))
        .await
        .unwrap();

    assert_eq!(session.data(), fields(json!({ "a": 1 })));
    assert!(session.revision().is_none());

    engine.set_offline(false);
    assert!(engine
        .fetch(&DocumentId::from("alpha"), FetchOptions::default())
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_remote_change_reaches_session() {
    let remote = MemoryEngine::new("remote");
    let db = Database::connect(MemoryEngine::new("local"), DatabaseConfig::default(), &remote);
    let session = db.open_document("alpha");
    session.wait_initialized().await;

    remote
        .put(Document::new("alpha", fields(json!({ "text": "Finish" }))))
        .await
        .unwrap();

    assert!(eventually(|| session.data().get("text") == Some(&json!("Finish"))).await);
}

#[tokio::test]
async fn test_replicated_conflict_converges() {
    let local = MemoryEngine::new("local");
    let remote = MemoryEngine::new("remote");
    local
        .put(Document::new("alpha", fields(json!({ "a": 1 }))))
        .await
        .unwrap();
    remote
        .put(Document::new("alpha", fields(json!({ "b": 2 }))))
        .await
        .unwrap();

    let db = Database::connect(local.clone(), DatabaseConfig::default(), &remote);
    let session = db.open_document("alpha");
    let id = DocumentId::from("alpha");
    let merged = fields(json!({ "a": 1, "b": 2 }));

    let converged = eventually_async(|| {
        let (local, remote, id, merged) = (local.clone(), remote.clone(), id.clone(), merged.clone());
        async move {
            let (Ok(l), Ok(r)) = (
                local.fetch(&id, FetchOptions::with_conflicts()).await,
                remote.fetch(&id, FetchOptions::with_conflicts()).await,
            ) else {
                return false;
            };
            l.data() == merged && r.data() == merged && l.rev == r.rev && !l.has_conflicts()
        }
    })
    .await;

    assert!(converged);
    assert!(eventually(|| session.data() == merged).await);
}

#[tokio::test]
async fn test_without_resolver_conflict_remains() {
    let local = MemoryEngine::new("local");
    let remote = MemoryEngine::new("remote");
    local
        .put(Document::new("alpha", fields(json!({ "a": 1 }))))
        .await
        .unwrap();
    remote
        .put(Document::new("alpha", fields(json!({ "b": 2 }))))
        .await
        .unwrap();
    local.replicate(&remote, ReplicationOptions::one_shot()).join().await;

    let db = Database::new(local.clone(), DatabaseConfig::default());
    let session =
        db.open_document_with("alpha", SessionOptions::new().without_conflict_handler());
    session.wait_initialized().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stored = local
        .fetch(&DocumentId::from("alpha"), FetchOptions::with_conflicts())
        .await
        .unwrap();
    assert_eq!(stored.conflicts.len(), 1);
    assert_eq!(session.data(), stored.data());
}

#[tokio::test]
async fn test_custom_resolver() {
    let local = MemoryEngine::new("local");
    let remote = MemoryEngine::new("remote");
    local
        .put(Document::new("alpha", fields(json!({ "side": "local" }))))
        .await
        .unwrap();
    remote
        .put(Document::new("alpha", fields(json!({ "side": "remote" }))))
        .await
        .unwrap();
    local.replicate(&remote, ReplicationOptions::one_shot()).join().await;

    let picked = fields(json!({ "side": "picked" }));
    let resolved = picked.clone();
    let resolver = move |yours: &Document, _theirs: &Document| {
        Document::new(yours.id.clone(), resolved.clone())
    };

    let db = Database::new(local.clone(), DatabaseConfig::default());
    let session = db.open_document_with("alpha", SessionOptions::new().on_conflict(resolver));

    assert!(eventually(|| session.data() == picked).await);
    let stored = local
        .fetch(&DocumentId::from("alpha"), FetchOptions::with_conflicts())
        .await
        .unwrap();
    assert_eq!(stored.data(), picked);
    assert!(!stored.has_conflicts());
}

#[tokio::test]
async fn test_disposed_session_ignores_changes() {
    let db = Database::in_memory(DatabaseConfig::default());
    let session = db.open_document("alpha");
    session.wait_initialized().await;
    let watch = session.watch_id();

    session.dispose();
    assert!(!db.router().is_registered(watch));

    let event = ChangeEvent {
        seq: 1,
        document_id: DocumentId::from("alpha"),
        revision: Revision::parse("1-abc"),
        deleted: false,
        fields: fields(json!({ "late": true })),
        conflicts: Vec::new(),
    };
    assert_eq!(db.router().dispatch(&event), 0);
    assert!(session.data().is_empty());

    session.put_document(fields(json!({ "ignored": 1 }))).await.unwrap();
    assert!(session.data().is_empty());
}

#[tokio::test]
async fn test_disconnect_drops_registrations() {
    let remote = MemoryEngine::new("remote");
    let db = Arc::new(Database::connect(
        MemoryEngine::new("local"),
        DatabaseConfig::default(),
        &remote,
    ));
    let session = db.open_document("alpha");
    assert!(db.is_syncing());
    assert!(db.router().is_registered(session.watch_id()));

    db.set_remote(None);
    assert!(!db.is_syncing());
    assert_eq!(db.router().watch_count(), 0);
}

#[tokio::test]
async fn test_clearing_absent_remote_keeps_sibling_updates() {
    let db = Database::in_memory(DatabaseConfig::default());
    assert!(!db.set_remote(None));

    let writer = db.open_document("alpha");
    let watcher = db.open_document("alpha");
    watcher.wait_initialized().await;

    writer.put_document(fields(json!({ "text": "x" }))).await.unwrap();
    assert!(eventually(|| watcher.data().get("text") == Some(&json!("x"))).await);
}

#[tokio::test]
async fn test_sessions_after_disconnect_see_sibling_writes() {
    let remote = MemoryEngine::new("remote");
    let db = Database::connect(MemoryEngine::new("local"), DatabaseConfig::default(), &remote);
    db.set_remote(None);

    let writer = db.open_document("alpha");
    let watcher = db.open_document("alpha");
    watcher.wait_initialized().await;

    writer.put_document(fields(json!({ "text": "y" }))).await.unwrap();
    assert!(eventually(|| watcher.data().get("text") == Some(&json!("y"))).await);
}

/// Give `local`'s `alpha` a conflicting branch `{b: 2}` through a one-shot
/// pull, and return the conflicted winner.
async fn diverge(local: &MemoryEngine) -> Document {
    let remote = MemoryEngine::new("remote");
    remote
        .put(Document::new("alpha", fields(json!({ "b": 2 }))))
        .await
        .unwrap();
    local.replicate(&remote, ReplicationOptions::one_shot()).join().await;

    let stored = local
        .fetch(&DocumentId::from("alpha"), FetchOptions::with_conflicts())
        .await
        .unwrap();
    assert_eq!(stored.conflicts.len(), 1);
    stored
}

fn change_event(doc: &Document) -> ChangeEvent {
    ChangeEvent {
        seq: 1,
        document_id: doc.id.clone(),
        revision: doc.rev.clone().unwrap(),
        deleted: false,
        fields: doc.data(),
        conflicts: doc.conflicts.clone(),
    }
}

#[tokio::test]
async fn test_dispatched_conflict_is_resolved() {
    let local = MemoryEngine::new("local");
    local
        .put(Document::new("alpha", fields(json!({ "a": 1 }))))
        .await
        .unwrap();
    let db = Database::new(local.clone(), quiet_config());
    let session = db.open_document("alpha");
    session.wait_initialized().await;
    assert_eq!(session.data(), fields(json!({ "a": 1 })));

    let stored = diverge(&local).await;
    let id = DocumentId::from("alpha");
    assert_eq!(db.router().dispatch(&change_event(&stored)), 1);

    let merged = fields(json!({ "a": 1, "b": 2 }));
    let resolved = eventually_async(|| {
        let (local, id, merged) = (local.clone(), id.clone(), merged.clone());
        async move {
            match local.fetch(&id, FetchOptions::with_conflicts()).await {
                Ok(doc) => doc.data() == merged && !doc.has_conflicts(),
                Err(_) => false,
            }
        }
    })
    .await;
    assert!(resolved);
    assert!(eventually(|| session.data() == merged).await);
}

#[tokio::test]
async fn test_dispose_during_load_keeps_loading() {
    let db = Database::in_memory(DatabaseConfig::default());
    db.engine()
        .put(Document::new("alpha", fields(json!({ "x": 1 }))))
        .await
        .unwrap();

    let session = db.open_document("alpha");
    session.dispose();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!session.is_initialized());
    assert!(session.data().is_empty());
}

#[tokio::test]
async fn test_dispose_during_write_drops_revision() {
    let db = Database::in_memory(quiet_config());
    let session = db.open_document("alpha");
    session.wait_initialized().await;

    let handle = session.put_document(fields(json!({ "a": 1 })));
    session.dispose();
    handle.await.unwrap();

    assert!(session.revision().is_none());
    let stored = db
        .engine()
        .fetch(&DocumentId::from("alpha"), FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(stored.data(), fields(json!({ "a": 1 })));
}

#[tokio::test]
async fn test_dispose_during_conflicted_write_skips_resolution() {
    let db = Database::in_memory(quiet_config());
    let engine = db.engine().clone();
    let id = DocumentId::from("alpha");
    let first = engine
        .put(Document::new("alpha", fields(json!({ "v": 1 }))))
        .await
        .unwrap();
    let session = db.open_document("alpha");
    session.wait_initialized().await;

    engine
        .put(Document::new("alpha", fields(json!({ "v": 2 }))).with_revision(Some(first.rev)))
        .await
        .unwrap();
    let handle = session.put_document(fields(json!({ "v": 3 })));
    session.dispose();
    handle.await.unwrap();

    let stored = engine.fetch(&id, FetchOptions::with_conflicts()).await.unwrap();
    assert_eq!(stored.data(), fields(json!({ "v": 2 })));
    assert_eq!(stored.rev.as_ref().map(Revision::generation), Some(2));
    let deleted = engine
        .export_revisions(&id)
        .unwrap()
        .into_iter()
        .filter(|(_, node)| node.deleted)
        .count();
    assert_eq!(deleted, 0);
}

#[tokio::test]
async fn test_dispose_before_conflict_fetch_leaves_conflict() {
    let local = MemoryEngine::new("local");
    local
        .put(Document::new("alpha", fields(json!({ "a": 1 }))))
        .await
        .unwrap();
    let db = Database::new(local.clone(), quiet_config());
    let session = db.open_document("alpha");
    session.wait_initialized().await;

    let stored = diverge(&local).await;
    assert_eq!(db.router().dispatch(&change_event(&stored)), 1);
    session.dispose();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after = local
        .fetch(&DocumentId::from("alpha"), FetchOptions::with_conflicts())
        .await
        .unwrap();
    assert_eq!(after.rev, stored.rev);
    assert_eq!(after.conflicts, stored.conflicts);
}

#[tokio::test]
async fn test_failed_create_retry_is_not_repeated() {
    let db = Database::new(ScriptedEngine::new(MemoryEngine::new("local")), quiet_config());
    let session = db.open_document("alpha");
    session.wait_initialized().await;

    db.engine().fail_next_puts([
        StoreError::NotFound("alpha".into()),
        StoreError::Unrecoverable("boom".into()),
    ]);
    session.put_document(fields(json!({ "a": 1 }))).await.unwrap();

    assert_eq!(db.engine().put_calls(), 2);
    assert_eq!(session.data(), fields(json!({ "a": 1 })));
    assert!(session.revision().is_none());
    assert!(db
        .engine()
        .inner
        .fetch(&DocumentId::from("alpha"), FetchOptions::default())
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_other_write_errors_are_not_retried() {
    let db = Database::new(ScriptedEngine::new(MemoryEngine::new("local")), quiet_config());
    let session = db.open_document("alpha");
    session.wait_initialized().await;

    db.engine().fail_next_puts([StoreError::Unrecoverable("boom".into())]);
    session.put_document(fields(json!({ "a": 1 }))).await.unwrap();

    assert_eq!(db.engine().put_calls(), 1);
    assert!(session.revision().is_none());
}

#[tokio::test]
async fn test_successful_create_retry() {
    let db = Database::new(ScriptedEngine::new(MemoryEngine::new("local")), quiet_config());
    let session = db.open_document("alpha");
    session.wait_initialized().await;

    db.engine().fail_next_puts([StoreError::NotFound("alpha".into())]);
    session.put_document(fields(json!({ "a": 1 }))).await.unwrap();

    assert_eq!(db.engine().put_calls(), 2);
    assert_eq!(session.revision().map(|r| r.generation()), Some(1));
}

#[tokio::test]
async fn test_merged_revision_arrives_through_feed() {
    let db = Database::in_memory(DatabaseConfig::default());
    let engine = db.engine().clone();
    let id = DocumentId::from("alpha");
    let first = engine
        .put(Document::new("alpha", fields(json!({ "v": 1 }))))
        .await
        .unwrap();
    let session = db.open_document("alpha");
    session.wait_initialized().await;

    // No await between the two writes, so the session still holds `first`.
    engine
        .put(Document::new("alpha", fields(json!({ "v": 2, "w": 3 }))).with_revision(Some(first.rev)))
        .await
        .unwrap();
    session.put_document(fields(json!({ "v": 1 }))).await.unwrap();

    let merged = engine.fetch(&id, FetchOptions::default()).await.unwrap();
    assert_eq!(merged.rev.as_ref().map(Revision::generation), Some(3));
    assert!(eventually(|| session.revision() == merged.rev).await);
    assert_eq!(session.data(), fields(json!({ "v": 1, "w": 3 })));

    session.put_document(fields(json!({ "v": 4 }))).await.unwrap();
    assert_eq!(session.revision().map(|r| r.generation()), Some(4));
    let deleted = engine
        .export_revisions(&id)
        .unwrap()
        .into_iter()
        .filter(|(_, node)| node.deleted)
        .count();
    assert_eq!(deleted, 1);
}

#[tokio::test]
async fn test_dispose_releases_initialization_waiters() {
    let db = Database::in_memory(DatabaseConfig::default());
    db.engine().set_offline(true);
    let session = db.open_document("alpha");

    let (waited, _) = tokio::join!(
        tokio::time::timeout(Duration::from_millis(300), session.wait_initialized()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            session.dispose();
        }
    );

    assert!(waited.is_ok());
    assert!(!session.is_initialized());
}
