//! Persistence and history flushing.
//!
//! ```text
//!   doc-close / explicit flush / project delete
//!        │
//!        ▼
//!   ┌──────────────┐  with_retries("setDoc")  ┌────────────────┐
//!   │ doc lock     │ ───────────────────────► │ VersionedStore │
//!   │ (per doc)    │                          └────────────────┘
//!   └──────┬───────┘
//!          │ success: clear unflushed_since (if version unchanged)
//!          │ failure: doc stays dirty, error returned
//!          ▼
//!   history flush (doc + project), errors logged
//! ```
//!
//! History flushes after edits are batched: a flush is sent each time a
//! queue length crosses a multiple of the configured threshold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::DocumentCache;
use crate::collaborators::{DocHistoryService, DocumentSnapshot, ProjectHistoryService, VersionedStore};
use crate::config::{FlushConfig, RetryPolicy};
use crate::document::Document;
use crate::error::UpdaterError;
use crate::locks::KeyedLocks;
use crate::retry::with_retries;
use crate::update::now_millis;

/// Ops just queued to the history services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuedOps {
    /// Number of ops pushed
    pub ops: u64,
    /// Doc history queue length after the push
    pub doc_queue_len: Option<u64>,
    /// Project history queue length after the push
    pub project_queue_len: Option<u64>,
}

/// Which history flushes `maybe_flush_history` sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryFlushes {
    pub doc: bool,
    pub project: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FlushStats {
    pub persisted: u64,
    pub persist_failures: u64,
    pub doc_history_flushes: u64,
    pub project_history_flushes: u64,
}

/// True when pushing `ops` took the queue across a multiple of `threshold`.
pub fn crosses_threshold(threshold: u64, ops: u64, queue_len: u64) -> bool {
    if threshold == 0 || ops == 0 {
        return false;
    }
    let before = queue_len.saturating_sub(ops);
    before / threshold != queue_len / threshold
}

pub struct FlushCoordinator {
    cache: Arc<DocumentCache>,
    store: Arc<dyn VersionedStore>,
    doc_history: Arc<dyn DocHistoryService>,
    project_history: Arc<dyn ProjectHistoryService>,
    doc_locks: Arc<KeyedLocks>,
    config: FlushConfig,
    retry: RetryPolicy,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    doc_history_flushes: AtomicU64,
    project_history_flushes: AtomicU64,
}

impl FlushCoordinator {
    pub fn new(
        cache: Arc<DocumentCache>,
        store: Arc<dyn VersionedStore>,
        doc_history: Arc<dyn DocHistoryService>,
        project_history: Arc<dyn ProjectHistoryService>,
        doc_locks: Arc<KeyedLocks>,
        config: FlushConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            store,
            doc_history,
            project_history,
            doc_locks,
            config,
            retry,
            persisted: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            doc_history_flushes: AtomicU64::new(0),
            project_history_flushes: AtomicU64::new(0),
        }
    }

    // ─── Document persistence ─────────────────────────────────────────

    /// Persist a doc if it is cached and dirty.
    pub async fn flush_doc_if_loaded(&self, project_id: Uuid, doc_id: Uuid) -> Result<(), UpdaterError> {
        let _guard = self.doc_locks.lock(doc_id).await;
        self.flush_doc_with_lock_held(project_id, doc_id).await
    }

    /// As `flush_doc_if_loaded`; the caller holds the doc lock.
    pub async fn flush_doc_with_lock_held(&self, project_id: Uuid, doc_id: Uuid) -> Result<(), UpdaterError> {
        let Some(doc) = self.cache.peek(project_id, doc_id).await? else {
            log::debug!("Doc {doc_id} not loaded, nothing to flush");
            return Ok(());
        };
        if !doc.is_dirty() {
            log::trace!("Doc {doc_id} is clean at v{}", doc.version);
            return Ok(());
        }
        self.persist(&doc).await
    }

    /// Flush, then flush history, then evict.
    ///
    /// With `ignore_flush_errors` a failed persist is logged and the doc is
    /// evicted anyway; otherwise the error is returned and the doc stays cached.
    pub async fn flush_and_delete_doc(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        ignore_flush_errors: bool,
    ) -> Result<(), UpdaterError> {
        let _guard = self.doc_locks.lock(doc_id).await;
        self.flush_and_delete_with_lock_held(project_id, doc_id, ignore_flush_errors)
            .await
    }

    pub async fn flush_and_delete_with_lock_held(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        ignore_flush_errors: bool,
    ) -> Result<(), UpdaterError> {
        if let Err(e) = self.flush_doc_with_lock_held(project_id, doc_id).await {
            if !ignore_flush_errors {
                log::error!("Flush of doc {doc_id} failed, keeping it loaded: {e}");
                return Err(e);
            }
            log::warn!("Ignoring flush error for doc {doc_id}: {e}");
        }

        self.flush_doc_history(project_id, doc_id).await;
        self.flush_project_history(project_id).await;

        self.cache.remove(project_id, doc_id).await;
        log::info!("Deleted doc {doc_id} from cache (project {project_id})");
        Ok(())
    }

    /// Flush every loaded doc of a project.
    ///
    /// Continues past failures and returns the first one.
    pub async fn flush_project_docs(&self, project_id: Uuid) -> Result<(), UpdaterError> {
        let doc_ids = self.cache.doc_ids_in_project(project_id).await;
        log::info!("Flushing {} docs of project {project_id}", doc_ids.len());

        let mut first_error = None;
        for doc_id in doc_ids {
            if let Err(e) = self.flush_doc_if_loaded(project_id, doc_id).await {
                log::error!("Failed to flush doc {doc_id} of project {project_id}: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Block the project, flush and evict every doc, flush history, unblock.
    pub async fn flush_and_delete_project(&self, project_id: Uuid) -> Result<(), UpdaterError> {
        self.cache.block_project(project_id).await;
        let doc_ids = self.cache.doc_ids_in_project(project_id).await;
        log::info!("Deleting project {project_id} ({} docs loaded)", doc_ids.len());

        let mut first_error = None;
        for doc_id in doc_ids {
            if let Err(e) = self.flush_and_delete_doc(project_id, doc_id, false).await {
                first_error.get_or_insert(e);
            }
        }
        self.flush_project_history(project_id).await;
        self.cache.unblock_project(project_id).await;

        first_error.map_or(Ok(()), Err)
    }

    /// Whether a dirty doc has gone unflushed for longer than `max_unflushed_age`.
    pub fn is_flush_overdue(&self, doc: &Document) -> bool {
        let max_age = self.config.max_unflushed_age.as_millis() as u64;
        doc.unflushed_since
            .is_some_and(|since| now_millis().saturating_sub(since) > max_age)
    }

    async fn persist(&self, doc: &Document) -> Result<(), UpdaterError> {
        let snapshot = DocumentSnapshot {
            lines: doc.lines.clone(),
            version: doc.version,
            ranges: doc.ranges.clone(),
            last_updated_at: doc.last_updated_at,
            last_updated_by: doc.last_updated_by.clone(),
        };
        let (project_id, doc_id) = (doc.project_id, doc.doc_id);

        let result = with_retries(&self.retry, "setDoc", || {
            self.store.set_document(project_id, doc_id, &snapshot)
        })
        .await;

        match result {
            Ok(()) => {
                self.cache.clear_unflushed_if_version(doc_id, doc.version).await;
                self.persisted.fetch_add(1, Ordering::Relaxed);
                log::info!("Flushed doc {doc_id} at v{}", doc.version);
                Ok(())
            }
            Err(e) => {
                self.persist_failures.fetch_add(1, Ordering::Relaxed);
                Err(e.into_updater("setDoc", project_id, doc_id))
            }
        }
    }

    // ─── History ──────────────────────────────────────────────────────

    /// Send history flushes for every queue that crossed its threshold.
    pub async fn maybe_flush_history(
        &self,
        project_id: Uuid,
        doc_id: Option<Uuid>,
        queued: QueuedOps,
    ) -> HistoryFlushes {
        let mut flushes = HistoryFlushes::default();

        if let (Some(doc_id), Some(len)) = (doc_id, queued.doc_queue_len) {
            if crosses_threshold(self.config.doc_history_threshold, queued.ops, len) {
                log::debug!("Doc {doc_id} history queue at {len}, flushing");
                flushes.doc = self.flush_doc_history(project_id, doc_id).await;
            }
        }
        if let Some(len) = queued.project_queue_len {
            if crosses_threshold(self.config.project_history_threshold, queued.ops, len) {
                log::debug!("Project {project_id} history queue at {len}, flushing");
                flushes.project = self.flush_project_history(project_id).await;
            }
        }
        flushes
    }

    /// Flush a doc's history queue; failures are logged.
    pub async fn flush_doc_history(&self, project_id: Uuid, doc_id: Uuid) -> bool {
        let result = with_retries(&self.retry, "flushDocHistory", || {
            self.doc_history.flush_doc(project_id, doc_id)
        })
        .await;
        match result {
            Ok(()) => {
                self.doc_history_flushes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::warn!("Doc history flush failed for doc {doc_id}: {e:?}");
                false
            }
        }
    }

    /// Flush a project's history queue; failures are logged.
    pub async fn flush_project_history(&self, project_id: Uuid) -> bool {
        let result = with_retries(&self.retry, "flushProjectHistory", || {
            self.project_history.flush_project(project_id)
        })
        .await;
        match result {
            Ok(()) => {
                self.project_history_flushes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::warn!("Project history flush failed for project {project_id}: {e:?}");
                false
            }
        }
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            doc_history_flushes: self.doc_history_flushes.load(Ordering::Relaxed),
            project_history_flushes: self.project_history_flushes.load(Ordering::Relaxed),
        }
    }
}
