//! Hot document cache.
//!
//! ```text
//!   get(project, doc)
//!        │
//!        ├── cached ──────────────────────────────► Document
//!        │
//!        └── miss ──► VersionedStore::get_document
//!                          │
//!                          ├── archived ──► ArchiveService::unarchive ──► verify hash
//!                          │
//!                          └── verify hash ──► put (rejected if project blocked)
//! ```
//!
//! The cache trusts its own writes (every write recomputes the content hash)
//! but never accepts a hash mismatch when hydrating from durable storage.
//! Mutations go through the sequencer, which holds the per-doc lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::collaborators::{ArchiveService, StoredDocument, VersionedStore};
use crate::config::{RetryPolicy, UpdaterConfig};
use crate::document::{content_hash, serialized_length, Document};
use crate::error::UpdaterError;
use crate::ranges::Ranges;
use crate::retry::with_retries;
use crate::update::now_millis;

pub struct DocumentCache {
    docs: RwLock<HashMap<Uuid, Document>>,
    /// Project membership of cached docs
    projects: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    blocked: RwLock<HashSet<Uuid>>,
    store: Arc<dyn VersionedStore>,
    archive: Arc<dyn ArchiveService>,
    retry: RetryPolicy,
    max_doc_length: usize,
    max_ranges_size: usize,
}

/// Content and metadata written by `update_document`.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub lines: Vec<String>,
    pub version: u64,
    /// Ops applied to reach `version`
    pub applied_ops: usize,
    pub ranges: Ranges,
    pub updated_by: Option<String>,
}

impl DocumentCache {
    pub fn new(store: Arc<dyn VersionedStore>, archive: Arc<dyn ArchiveService>, config: &UpdaterConfig) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            projects: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashSet::new()),
            store,
            archive,
            retry: config.retry.clone(),
            max_doc_length: config.max_doc_length,
            max_ranges_size: config.max_ranges_size,
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Cached document, loading it from the versioned store on a miss.
    pub async fn get(&self, project_id: Uuid, doc_id: Uuid) -> Result<Document, UpdaterError> {
        if let Some(doc) = self.peek(project_id, doc_id).await? {
            return Ok(doc);
        }

        let doc = self.load(project_id, doc_id).await?;
        // Another task may have loaded it while we were fetching.
        self.insert_unless_blocked(doc, true).await
    }

    /// Cached document without falling back to the store.
    ///
    /// A doc cached under a different project is reported as not found.
    pub async fn peek(&self, project_id: Uuid, doc_id: Uuid) -> Result<Option<Document>, UpdaterError> {
        match self.docs.read().await.get(&doc_id) {
            Some(doc) if doc.project_id != project_id => {
                log::warn!(
                    "Doc {doc_id} requested for project {project_id} but cached for {}",
                    doc.project_id
                );
                Err(UpdaterError::NotFound { project_id, doc_id })
            }
            Some(doc) => Ok(Some(doc.clone())),
            None => Ok(None),
        }
    }

    pub async fn is_loaded(&self, doc_id: Uuid) -> bool {
        self.docs.read().await.contains_key(&doc_id)
    }

    pub async fn doc_ids_in_project(&self, project_id: Uuid) -> Vec<Uuid> {
        self.projects
            .read()
            .await
            .get(&project_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Projects with at least one cached doc.
    pub async fn project_ids(&self) -> Vec<Uuid> {
        self.projects.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Store a document, unless its project is blocked.
    pub async fn put(&self, doc: Document) -> Result<(), UpdaterError> {
        self.insert_unless_blocked(doc, false).await.map(|_| ())
    }

    /// Insert `doc` and record project membership; returns the cached doc.
    ///
    /// With `keep_existing` an already cached doc is left in place and
    /// returned instead.
    async fn insert_unless_blocked(&self, doc: Document, keep_existing: bool) -> Result<Document, UpdaterError> {
        // Held across the insert so block_project cannot interleave.
        let blocked = self.blocked.read().await;
        let (project_id, doc_id) = (doc.project_id, doc.doc_id);
        if blocked.contains(&project_id) {
            return Err(UpdaterError::ProjectBlocked { project_id });
        }
        let mut docs = self.docs.write().await;
        if keep_existing {
            if let Some(existing) = docs.get(&doc_id) {
                return Ok(existing.clone());
            }
        }
        docs.insert(doc_id, doc.clone());
        drop(docs);
        self.projects
            .write()
            .await
            .entry(project_id)
            .or_default()
            .insert(doc_id);
        Ok(doc)
    }

    /// Commit the result of applying ops (or a ranges-only change).
    ///
    /// Fails with `CorruptionDetected` if `change.version` is not exactly the
    /// cached version plus the number of applied ops.
    pub async fn update_document(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        change: DocumentChange,
    ) -> Result<Document, UpdaterError> {
        if change.lines.iter().any(|line| line.contains('\0')) {
            return Err(UpdaterError::InvalidUpdate("null bytes found in doc lines".into()));
        }
        let length = serialized_length(&change.lines);
        if length > self.max_doc_length {
            return Err(UpdaterError::DocTooLarge {
                length,
                max: self.max_doc_length,
            });
        }
        let ranges_size = change.ranges.serialized_size();
        if ranges_size > self.max_ranges_size {
            return Err(UpdaterError::RangesTooLarge {
                size: ranges_size,
                max: self.max_ranges_size,
            });
        }

        let mut docs = self.docs.write().await;
        let doc = match docs.get_mut(&doc_id) {
            Some(doc) if doc.project_id == project_id => doc,
            _ => return Err(UpdaterError::NotFound { project_id, doc_id }),
        };

        if doc.version + change.applied_ops as u64 != change.version {
            return Err(UpdaterError::CorruptionDetected {
                doc_id,
                reason: format!(
                    "Version mismatch: v{} + {} ops != v{}",
                    doc.version, change.applied_ops, change.version
                ),
            });
        }

        let now = now_millis();
        doc.content_hash = content_hash(&change.lines);
        doc.lines = change.lines;
        doc.version = change.version;
        doc.ranges = change.ranges;
        doc.unflushed_since.get_or_insert(now);
        doc.last_updated_at = Some(now);
        if change.updated_by.is_some() {
            doc.last_updated_by = change.updated_by;
        }
        log::trace!("Updated doc {doc_id} to v{}", doc.version);
        Ok(doc.clone())
    }

    /// Evict a document and its project membership.
    pub async fn remove(&self, project_id: Uuid, doc_id: Uuid) -> Option<Document> {
        let removed = self.docs.write().await.remove(&doc_id);
        let mut projects = self.projects.write().await;
        if let Some(ids) = projects.get_mut(&project_id) {
            ids.remove(&doc_id);
            if ids.is_empty() {
                projects.remove(&project_id);
            }
        }
        removed
    }

    /// Update the pathname of a cached doc; no-op if not cached.
    pub async fn record_rename(&self, project_id: Uuid, doc_id: Uuid, new_pathname: &str) -> bool {
        let mut docs = self.docs.write().await;
        match docs.get_mut(&doc_id) {
            Some(doc) if doc.project_id == project_id => {
                doc.pathname = new_pathname.to_string();
                true
            }
            _ => false,
        }
    }

    /// Clear the dirty marker if nothing was applied since `version` was persisted.
    pub async fn clear_unflushed_if_version(&self, doc_id: Uuid, version: u64) -> bool {
        let mut docs = self.docs.write().await;
        match docs.get_mut(&doc_id) {
            Some(doc) if doc.version == version => {
                doc.unflushed_since = None;
                true
            }
            _ => false,
        }
    }

    // ─── Project blocking ─────────────────────────────────────────────

    pub async fn block_project(&self, project_id: Uuid) {
        self.blocked.write().await.insert(project_id);
    }

    pub async fn unblock_project(&self, project_id: Uuid) {
        self.blocked.write().await.remove(&project_id);
    }

    pub async fn is_blocked(&self, project_id: Uuid) -> bool {
        self.blocked.read().await.contains(&project_id)
    }

    // ─── Loading ──────────────────────────────────────────────────────

    async fn load(&self, project_id: Uuid, doc_id: Uuid) -> Result<Document, UpdaterError> {
        let stored = with_retries(&self.retry, "getDoc", || self.store.get_document(project_id, doc_id))
            .await
            .map_err(|e| e.into_updater("getDoc", project_id, doc_id))?;

        let StoredDocument {
            lines,
            version,
            ranges,
            pathname,
            project_history_id,
            content_hash: stored_hash,
        } = stored;

        let lines = match lines {
            Some(lines) => {
                if let Some(expected) = stored_hash {
                    verify_hash(doc_id, &lines, &expected)?;
                }
                lines
            }
            None => {
                log::info!("Doc {doc_id} is archived, unarchiving");
                let archived = with_retries(&self.retry, "unarchive", || {
                    self.archive.unarchive(project_id, doc_id)
                })
                .await
                .map_err(|e| e.into_updater("unarchive", project_id, doc_id))?;
                verify_hash(doc_id, &archived.lines, &archived.hash)?;
                archived.lines
            }
        };

        log::info!("Loaded doc {doc_id} (project {project_id}) at v{version}");
        Ok(Document {
            project_id,
            doc_id,
            content_hash: content_hash(&lines),
            lines,
            version,
            ranges,
            pathname,
            project_history_id,
            unflushed_since: None,
            last_updated_at: None,
            last_updated_by: None,
        })
    }
}

fn verify_hash(doc_id: Uuid, lines: &[String], expected: &str) -> Result<(), UpdaterError> {
    let actual = content_hash(lines);
    if actual != expected {
        log::error!("Hash mismatch loading doc {doc_id}: expected {expected}, got {actual}");
        return Err(UpdaterError::CorruptionDetected {
            doc_id,
            reason: format!("hash mismatch: expected {expected}, got {actual}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryArchive, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        archive: Arc<MemoryArchive>,
        cache: DocumentCache,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let archive = Arc::new(MemoryArchive::new());
        let cache = DocumentCache::new(store.clone(), archive.clone(), &UpdaterConfig::for_testing());
        Fixture { store, archive, cache }
    }

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_get_loads_once() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(p, d, &["one", "two"], 7).await;

        let doc = f.cache.get(p, d).await.unwrap();
        assert_eq!(doc.lines, lines(&["one", "two"]));
        assert_eq!(doc.version, 7);
        assert!(!doc.is_dirty());

        f.cache.get(p, d).await.unwrap();
        assert_eq!(f.store.get_calls(), 1);
        assert_eq!(f.cache.doc_ids_in_project(p).await, vec![d]);
    }

    #[tokio::test]
    async fn test_get_missing_doc() {
        let f = fixture();
        let err = f.cache.get(Uuid::new_v4(), Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_get_wrong_project() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(p, d, &["x"], 0).await;
        f.cache.get(p, d).await.unwrap();
        assert!(matches!(
            f.cache.get(Uuid::new_v4(), d).await,
            Err(UpdaterError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_hash_mismatch_on_load() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store
            .insert(
                p,
                d,
                StoredDocument {
                    lines: Some(lines(&["tampered"])),
                    version: 1,
                    ranges: Ranges::default(),
                    pathname: "/main.tex".into(),
                    project_history_id: None,
                    content_hash: Some(content_hash(&lines(&["original"]))),
                },
            )
            .await;
        let err = f.cache.get(p, d).await.unwrap_err();
        assert!(matches!(err, UpdaterError::CorruptionDetected { .. }));
        assert!(!f.cache.is_loaded(d).await);
    }

    #[tokio::test]
    async fn test_unarchive_on_load() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(p, d, &["cold"], 3).await;
        f.store.mark_archived(p, d).await;
        f.archive.archive(p, d, lines(&["cold"])).await;

        let doc = f.cache.get(p, d).await.unwrap();
        assert_eq!(doc.lines, lines(&["cold"]));
        assert_eq!(f.archive.unarchive_calls(), 1);
    }

    #[tokio::test]
    async fn test_unarchive_integrity_failure() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(p, d, &["cold"], 3).await;
        f.store.mark_archived(p, d).await;
        f.archive.archive(p, d, lines(&["cold"])).await;
        f.archive.corrupt(p, d).await;

        let err = f.cache.get(p, d).await.unwrap_err();
        assert!(matches!(err, UpdaterError::CorruptionDetected { .. }));
    }

    #[tokio::test]
    async fn test_put_rejected_when_blocked() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(p, d, &["x"], 0).await;
        let doc = f.cache.get(p, d).await.unwrap();
        f.cache.remove(p, d).await;

        f.cache.block_project(p).await;
        let err = f.cache.put(doc.clone()).await.unwrap_err();
        assert!(matches!(err, UpdaterError::ProjectBlocked { project_id } if project_id == p));
        assert!(!f.cache.is_loaded(d).await);
        assert!(f.cache.doc_ids_in_project(p).await.is_empty());

        f.cache.unblock_project(p).await;
        f.cache.put(doc).await.unwrap();
        assert!(f.cache.is_loaded(d).await);
        assert_eq!(f.cache.doc_ids_in_project(p).await, vec![d]);
    }

    #[tokio::test]
    async fn test_put_replaces_cached_doc() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(p, d, &["x"], 2).await;
        let mut doc = f.cache.get(p, d).await.unwrap();

        doc.pathname = "/renamed.tex".into();
        f.cache.put(doc).await.unwrap();
        let cached = f.cache.get(p, d).await.unwrap();
        assert_eq!(cached.pathname, "/renamed.tex");
        assert_eq!(cached.version, 2);
        assert_eq!(f.store.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_get_rejected_when_blocked() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(p, d, &["x"], 0).await;
        f.cache.block_project(p).await;

        let err = f.cache.get(p, d).await.unwrap_err();
        assert!(matches!(err, UpdaterError::ProjectBlocked { .. }));
        assert_eq!(err.status_code(), 423);

        f.cache.unblock_project(p).await;
        assert!(f.cache.get(p, d).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_document_checks_version() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(p, d, &["a"], 4).await;
        f.cache.get(p, d).await.unwrap();

        let bad = DocumentChange {
            lines: lines(&["ab"]),
            version: 6,
            applied_ops: 1,
            ranges: Ranges::default(),
            updated_by: None,
        };
        assert!(matches!(
            f.cache.update_document(p, d, bad).await,
            Err(UpdaterError::CorruptionDetected { .. })
        ));

        let good = DocumentChange {
            lines: lines(&["ab"]),
            version: 5,
            applied_ops: 1,
            ranges: Ranges::default(),
            updated_by: Some("u1".into()),
        };
        let doc = f.cache.update_document(p, d, good).await.unwrap();
        assert_eq!(doc.version, 5);
        assert!(doc.is_dirty());
        assert_eq!(doc.content_hash, content_hash(&lines(&["ab"])));
        assert_eq!(doc.last_updated_by.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_update_document_limits() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(p, d, &["a"], 0).await;
        f.cache.get(p, d).await.unwrap();

        let nul = DocumentChange {
            lines: lines(&["a\0"]),
            version: 1,
            applied_ops: 1,
            ranges: Ranges::default(),
            updated_by: None,
        };
        assert!(matches!(
            f.cache.update_document(p, d, nul).await,
            Err(UpdaterError::InvalidUpdate(_))
        ));

        let huge = DocumentChange {
            lines: vec!["x".repeat(3 * 1024 * 1024)],
            version: 1,
            applied_ops: 1,
            ranges: Ranges::default(),
            updated_by: None,
        };
        assert!(matches!(
            f.cache.update_document(p, d, huge).await,
            Err(UpdaterError::DocTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_and_rename() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(p, d, &["x"], 0).await;

        assert!(!f.cache.record_rename(p, d, "/new.tex").await);
        f.cache.get(p, d).await.unwrap();
        assert!(f.cache.record_rename(p, d, "/new.tex").await);
        assert_eq!(f.cache.peek(p, d).await.unwrap().unwrap().pathname, "/new.tex");

        assert!(f.cache.remove(p, d).await.is_some());
        assert!(!f.cache.is_loaded(d).await);
        assert!(f.cache.doc_ids_in_project(p).await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_unflushed_only_at_version() {
        let f = fixture();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(p, d, &["a"], 0).await;
        f.cache.get(p, d).await.unwrap();
        let change = DocumentChange {
            lines: lines(&["ab"]),
            version: 1,
            applied_ops: 1,
            ranges: Ranges::default(),
            updated_by: None,
        };
        f.cache.update_document(p, d, change).await.unwrap();

        assert!(!f.cache.clear_unflushed_if_version(d, 0).await);
        assert!(f.cache.peek(p, d).await.unwrap().unwrap().is_dirty());
        assert!(f.cache.clear_unflushed_if_version(d, 1).await);
        assert!(!f.cache.peek(p, d).await.unwrap().unwrap().is_dirty());
    }
}
