//! Persistence through the RocksDB-backed versioned store.
//!
//! Verifies:
//! - Flushed documents survive closing and reopening the database
//! - Ranges and metadata round-trip through the store
//! - A store that moved ahead rejects the older flush as a conflict
//! - Archived bodies are restored through the archive service

use std::sync::Arc;

use logos_updater::storage::{RocksVersionedStore, StoreConfig};
use logos_updater::{
    Collaborators, Component, DocumentSnapshot, DocumentUpdater, MemoryArchive, MemoryHistory, Ranges, Update,
    UpdaterConfig, UpdaterError, VersionedStore,
};
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: &std::path::Path) -> Arc<RocksVersionedStore> {
    Arc::new(RocksVersionedStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn updater_over(store: Arc<RocksVersionedStore>, archive: Arc<MemoryArchive>) -> DocumentUpdater {
    let history = Arc::new(MemoryHistory::new());
    DocumentUpdater::new(
        UpdaterConfig::for_testing(),
        Collaborators {
            store,
            archive,
            doc_history: history.clone(),
            project_history: history,
        },
    )
}

fn lines(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

// ─── Round trips ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_flushed_doc_survives_reopen() {
    let dir = tempdir().unwrap();
    let (p, d) = (Uuid::new_v4(), Uuid::new_v4());

    {
        let store = open_store(dir.path());
        store
            .create_document(p, d, lines(&["\\section{Intro}", ""]), "/main.tex")
            .unwrap();
        let updater = updater_over(store.clone(), Arc::new(MemoryArchive::new()));

        for (v, word) in ["alpha ", "beta ", "gamma "].iter().enumerate() {
            updater
                .send_update(p, d, Update::new(vec![Component::insert(16, *word)], v as u64))
                .await
                .unwrap();
        }
        updater.delete_doc(p, d, false).await.unwrap();
    }

    let store = open_store(dir.path());
    let stored = store.load(p, d).unwrap().unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.pathname, "/main.tex");
    assert_eq!(stored.lines, Some(lines(&["\\section{Intro}", "gamma beta alpha "])));

    let updater = updater_over(store, Arc::new(MemoryArchive::new()));
    let doc = updater.get_doc(p, d).await.unwrap();
    assert_eq!(doc.version, 3);
    assert_eq!(doc.pathname, "/main.tex");
}

#[tokio::test]
async fn test_ranges_and_author_persisted() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
    store.create_document(p, d, lines(&["some text"]), "/doc.tex").unwrap();

    let updater = updater_over(store.clone(), Arc::new(MemoryArchive::new()));
    let tracked = Update::new(vec![Component::insert(4, " more")], 0)
        .with_user("u-7")
        .tracked("tc");
    updater.send_update(p, d, tracked).await.unwrap();
    let comment = Update::new(vec![Component::comment(0, "some", Some("th".into()))], 1);
    updater.send_update(p, d, comment).await.unwrap();
    updater.flush_doc(p, d).await.unwrap();

    let stored = store.load(p, d).unwrap().unwrap();
    assert_eq!(stored.ranges.changes.len(), 1);
    assert_eq!(stored.ranges.comments.len(), 1);
    assert_eq!(stored.ranges.comments[0].id, "th");

    let record = store.load_record(p, d).unwrap().unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.last_updated_by.as_deref(), Some("u-7"));
    assert!(record.compressed_size > 0);
}

#[tokio::test]
async fn test_store_ahead_rejects_flush() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
    store.create_document(p, d, lines(&["base"]), "/doc.tex").unwrap();

    let updater = updater_over(store.clone(), Arc::new(MemoryArchive::new()));
    updater
        .send_update(p, d, Update::new(vec![Component::insert(0, "x")], 0))
        .await
        .unwrap();

    // Another writer moved the stored doc ahead
    let ahead = DocumentSnapshot {
        lines: lines(&["elsewhere"]),
        version: 5,
        ranges: Ranges::default(),
        last_updated_at: None,
        last_updated_by: None,
    };
    store.set_document(p, d, &ahead).await.unwrap();

    let err = updater.flush_doc(p, d).await.unwrap_err();
    assert!(matches!(err, UpdaterError::ConcurrentWriteConflict { .. }));
    let doc = updater.get_doc(p, d).await.unwrap();
    assert!(doc.unflushed_since.is_some());
    assert_eq!(store.load(p, d).unwrap().unwrap().version, 5);
}

#[tokio::test]
async fn test_archived_body_restored() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let archive = Arc::new(MemoryArchive::new());
    let (p, d) = (Uuid::new_v4(), Uuid::new_v4());

    store.create_document(p, d, lines(&["cold", "storage"]), "/cold.tex").unwrap();
    store.mark_archived(p, d).unwrap();
    archive.archive(p, d, lines(&["cold", "storage"])).await;

    let updater = updater_over(store.clone(), archive.clone());
    let doc = updater.get_doc(p, d).await.unwrap();
    assert_eq!(doc.lines, lines(&["cold", "storage"]));
    assert_eq!(archive.unarchive_calls(), 1);

    // Flushing writes the body back
    updater
        .send_update(p, d, Update::new(vec![Component::insert(0, "warm ")], 0))
        .await
        .unwrap();
    updater.delete_doc(p, d, false).await.unwrap();
    assert_eq!(
        store.load(p, d).unwrap().unwrap().lines,
        Some(lines(&["warm cold", "storage"]))
    );
}

#[tokio::test]
async fn test_missing_doc_is_not_found() {
    let dir = tempdir().unwrap();
    let updater = updater_over(open_store(dir.path()), Arc::new(MemoryArchive::new()));
    let err = updater.get_doc(Uuid::new_v4(), Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, UpdaterError::NotFound { .. }));
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_project_docs_listed_after_flush() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let p = Uuid::new_v4();
    let docs: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
    for (i, d) in docs.iter().enumerate() {
        store.create_document(p, *d, lines(&["x"]), format!("/{i}.tex")).unwrap();
    }

    let updater = updater_over(store.clone(), Arc::new(MemoryArchive::new()));
    for d in &docs {
        updater
            .send_update(p, *d, Update::new(vec![Component::insert(1, "y")], 0))
            .await
            .unwrap();
    }
    updater.delete_project(p).await.unwrap();

    let mut listed = store.list_documents(p).unwrap();
    listed.sort();
    let mut expected = docs.clone();
    expected.sort();
    assert_eq!(listed, expected);
    for d in &docs {
        assert_eq!(store.load(p, *d).unwrap().unwrap().lines, Some(lines(&["xy"])));
    }
}
