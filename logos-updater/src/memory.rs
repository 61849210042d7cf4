//! In-memory collaborators with call counting and fault injection.
//!
//! Used by the test suites, the benchmark and the server when no storage path is set.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::collaborators::{
    ArchiveService, ArchivedDocument, CollaboratorError, DocHistoryService, DocumentSnapshot,
    ProjectHistoryEntry, ProjectHistoryService, StoredDocument, VersionedStore,
};
use crate::document::content_hash;
use crate::ranges::Ranges;
use crate::update::Update;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Versioned Store ──────────────────────────────────────────────────

/// Versioned store keeping documents in a map.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<(Uuid, Uuid), StoredDocument>>,
    get_calls: AtomicU64,
    set_calls: AtomicU64,
    /// Delay applied to upcoming `set_document` calls, one entry per call
    set_delays: Mutex<VecDeque<Duration>>,
    /// Failures returned by upcoming `set_document` calls
    set_failures: Mutex<VecDeque<CollaboratorError>>,
    last_snapshot: Mutex<Option<DocumentSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document with fresh content.
    pub async fn seed(&self, project_id: Uuid, doc_id: Uuid, lines: &[&str], version: u64) {
        let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        let doc = StoredDocument {
            content_hash: Some(content_hash(&lines)),
            lines: Some(lines),
            version,
            ranges: Ranges::default(),
            pathname: format!("/{doc_id}.tex"),
            project_history_id: None,
        };
        self.insert(project_id, doc_id, doc).await;
    }

    pub async fn insert(&self, project_id: Uuid, doc_id: Uuid, doc: StoredDocument) {
        self.docs.write().await.insert((project_id, doc_id), doc);
    }

    /// Mark a stored document as archived (content moved to cold storage).
    pub async fn mark_archived(&self, project_id: Uuid, doc_id: Uuid) {
        if let Some(doc) = self.docs.write().await.get_mut(&(project_id, doc_id)) {
            doc.lines = None;
        }
    }

    pub async fn document(&self, project_id: Uuid, doc_id: Uuid) -> Option<StoredDocument> {
        self.docs.read().await.get(&(project_id, doc_id)).cloned()
    }

    /// Make the next `set_document` call sleep for `delay` first.
    pub fn delay_next_set(&self, delay: Duration) {
        locked(&self.set_delays).push_back(delay);
    }

    /// Make the next `set_document` call fail with `err`.
    pub fn fail_next_set(&self, err: CollaboratorError) {
        locked(&self.set_failures).push_back(err);
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> u64 {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn last_snapshot(&self) -> Option<DocumentSnapshot> {
        locked(&self.last_snapshot).clone()
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn get_document(&self, project_id: Uuid, doc_id: Uuid) -> Result<StoredDocument, CollaboratorError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.document(project_id, doc_id)
            .await
            .ok_or(CollaboratorError::NotFound)
    }

    async fn set_document(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        snapshot: &DocumentSnapshot,
    ) -> Result<(), CollaboratorError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        let delay = locked(&self.set_delays).pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = locked(&self.set_failures).pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        let mut docs = self.docs.write().await;
        let entry = docs.entry((project_id, doc_id)).or_insert_with(|| StoredDocument {
            lines: None,
            version: 0,
            ranges: Ranges::default(),
            pathname: String::new(),
            project_history_id: None,
            content_hash: None,
        });
        if snapshot.version < entry.version {
            return Err(CollaboratorError::Conflict);
        }
        entry.content_hash = Some(content_hash(&snapshot.lines));
        entry.lines = Some(snapshot.lines.clone());
        entry.version = snapshot.version;
        entry.ranges = snapshot.ranges.clone();
        *locked(&self.last_snapshot) = Some(snapshot.clone());
        Ok(())
    }
}

// ─── Archive ──────────────────────────────────────────────────────────

/// Cold storage keeping archived lines in a map.
#[derive(Default)]
pub struct MemoryArchive {
    docs: RwLock<HashMap<(Uuid, Uuid), ArchivedDocument>>,
    unarchive_calls: AtomicU64,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn archive(&self, project_id: Uuid, doc_id: Uuid, lines: Vec<String>) {
        let hash = content_hash(&lines);
        self.docs
            .write()
            .await
            .insert((project_id, doc_id), ArchivedDocument { lines, hash });
    }

    /// Overwrite the recorded hash so the next unarchive fails its integrity check.
    pub async fn corrupt(&self, project_id: Uuid, doc_id: Uuid) {
        if let Some(doc) = self.docs.write().await.get_mut(&(project_id, doc_id)) {
            doc.hash = "0".repeat(64);
        }
    }

    pub fn unarchive_calls(&self) -> u64 {
        self.unarchive_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveService for MemoryArchive {
    async fn unarchive(&self, project_id: Uuid, doc_id: Uuid) -> Result<ArchivedDocument, CollaboratorError> {
        self.unarchive_calls.fetch_add(1, Ordering::SeqCst);
        self.docs
            .read()
            .await
            .get(&(project_id, doc_id))
            .cloned()
            .ok_or(CollaboratorError::NotFound)
    }
}

// ─── History ──────────────────────────────────────────────────────────

/// Records everything queued to and flushed from both history services.
#[derive(Default)]
pub struct MemoryHistory {
    doc_queues: RwLock<HashMap<Uuid, Vec<Update>>>,
    doc_flushes: RwLock<HashMap<Uuid, u64>>,
    project_queues: RwLock<HashMap<Uuid, u64>>,
    project_flushes: RwLock<HashMap<Uuid, u64>>,
    structure: RwLock<HashMap<Uuid, Vec<ProjectHistoryEntry>>>,
    fail_flushes: AtomicBool,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every flush call fail until cleared.
    pub fn set_fail_flushes(&self, fail: bool) {
        self.fail_flushes.store(fail, Ordering::SeqCst);
    }

    /// Ops waiting in a doc's queue (cleared by `flush_doc`).
    pub async fn queued_doc_ops(&self, doc_id: Uuid) -> Vec<Update> {
        self.doc_queues
            .read()
            .await
            .get(&doc_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn doc_flush_count(&self, doc_id: Uuid) -> u64 {
        self.doc_flushes.read().await.get(&doc_id).copied().unwrap_or(0)
    }

    pub async fn project_flush_count(&self, project_id: Uuid) -> u64 {
        self.project_flushes
            .read()
            .await
            .get(&project_id)
            .copied()
            .unwrap_or(0)
    }

    /// Every structural entry ever queued for a project, in order.
    pub async fn structure_entries(&self, project_id: Uuid) -> Vec<ProjectHistoryEntry> {
        self.structure
            .read()
            .await
            .get(&project_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_flush(&self) -> Result<(), CollaboratorError> {
        if self.fail_flushes.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("history service down".into()));
        }
        Ok(())
    }

    async fn push_project(&self, project_id: Uuid, n: usize) -> u64 {
        let mut queues = self.project_queues.write().await;
        let len = queues.entry(project_id).or_insert(0);
        *len += n as u64;
        *len
    }
}

#[async_trait]
impl DocHistoryService for MemoryHistory {
    async fn queue_ops(&self, _project_id: Uuid, doc_id: Uuid, ops: &[Update]) -> Result<u64, CollaboratorError> {
        let mut queues = self.doc_queues.write().await;
        let queue = queues.entry(doc_id).or_default();
        queue.extend_from_slice(ops);
        Ok(queue.len() as u64)
    }

    async fn flush_doc(&self, _project_id: Uuid, doc_id: Uuid) -> Result<(), CollaboratorError> {
        self.check_flush()?;
        self.doc_queues.write().await.remove(&doc_id);
        *self.doc_flushes.write().await.entry(doc_id).or_insert(0) += 1;
        Ok(())
    }
}

#[async_trait]
impl ProjectHistoryService for MemoryHistory {
    async fn queue_doc_ops(&self, project_id: Uuid, ops: &[Update]) -> Result<u64, CollaboratorError> {
        Ok(self.push_project(project_id, ops.len()).await)
    }

    async fn queue_structure(
        &self,
        project_id: Uuid,
        entries: &[ProjectHistoryEntry],
    ) -> Result<u64, CollaboratorError> {
        self.structure
            .write()
            .await
            .entry(project_id)
            .or_default()
            .extend_from_slice(entries);
        Ok(self.push_project(project_id, entries.len()).await)
    }

    async fn flush_project(&self, project_id: Uuid) -> Result<(), CollaboratorError> {
        self.check_flush()?;
        self.project_queues.write().await.remove(&project_id);
        *self.project_flushes.write().await.entry(project_id).or_insert(0) += 1;
        Ok(())
    }
}
