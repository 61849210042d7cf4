//! `DocumentUpdater`: the operations exposed to the transport layer.
//!
//! Wires the cache, op log, sequencers and flush coordinator around one
//! shared doc-lock map and event bus.

use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::broadcast::{EventBus, UpdaterEvent};
use crate::cache::{DocumentCache, DocumentChange};
use crate::collaborators::{ArchiveService, DocHistoryService, ProjectHistoryService, VersionedStore};
use crate::config::UpdaterConfig;
use crate::diff::diff_as_op;
use crate::document::{Document, DocumentView};
use crate::error::UpdaterError;
use crate::flush::FlushCoordinator;
use crate::locks::KeyedLocks;
use crate::oplog::OperationLog;
use crate::ot::Component;
use crate::project::{ProjectStructureSequencer, ProjectStructureUpdate, StructureOutcome};
use crate::ranges::RangesTracker;
use crate::sequencer::{AppliedUpdate, OTSequencer};
use crate::update::{Update, UpdateMeta};

/// External collaborators the updater is built on.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn VersionedStore>,
    pub archive: Arc<dyn ArchiveService>,
    pub doc_history: Arc<dyn DocHistoryService>,
    pub project_history: Arc<dyn ProjectHistoryService>,
}

/// Who replaced a document's content via `set_doc`.
#[derive(Debug, Clone, Default)]
pub struct SetDocRequest {
    pub lines: Vec<String>,
    pub source: String,
    pub user_id: Option<String>,
    /// Mark the generated inserts as an undo
    pub undoing: bool,
}

pub struct DocumentUpdater {
    config: UpdaterConfig,
    cache: Arc<DocumentCache>,
    op_log: Arc<OperationLog>,
    events: Arc<EventBus>,
    flush: Arc<FlushCoordinator>,
    sequencer: OTSequencer,
    structure: ProjectStructureSequencer,
    doc_locks: Arc<KeyedLocks>,
}

impl DocumentUpdater {
    pub fn new(config: UpdaterConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            archive,
            doc_history,
            project_history,
        } = collaborators;

        let doc_locks = Arc::new(KeyedLocks::new());
        let cache = Arc::new(DocumentCache::new(store.clone(), archive, &config));
        let op_log = Arc::new(OperationLog::new(config.op_log.clone()));
        let events = Arc::new(EventBus::new(config.broadcast_capacity));
        let flush = Arc::new(FlushCoordinator::new(
            cache.clone(),
            store,
            doc_history.clone(),
            project_history.clone(),
            doc_locks.clone(),
            config.flush.clone(),
            config.retry.clone(),
        ));
        let sequencer = OTSequencer::new(
            cache.clone(),
            op_log.clone(),
            events.clone(),
            flush.clone(),
            doc_history,
            project_history.clone(),
            doc_locks.clone(),
        );
        let structure = ProjectStructureSequencer::new(
            cache.clone(),
            project_history,
            flush.clone(),
            doc_locks.clone(),
            config.retry.clone(),
        );

        Self {
            config,
            cache,
            op_log,
            events,
            flush,
            sequencer,
            structure,
            doc_locks,
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub async fn get_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<DocumentView, UpdaterError> {
        Ok(self.cache.get(project_id, doc_id).await?.view())
    }

    /// The doc plus every op applied since `from_version`.
    ///
    /// `None` returns no ops. A version no longer in the op log is
    /// `StaleVersionUnrecoverable`; partial history is never returned.
    ///
    /// Runs under the doc lock so the cached version and the op log are read
    /// at the same commit point.
    pub async fn get_doc_and_recent_ops(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        from_version: Option<u64>,
    ) -> Result<(DocumentView, Vec<Update>), UpdaterError> {
        let _guard = self.doc_locks.lock(doc_id).await;
        let doc = self.cache.get(project_id, doc_id).await?;
        let ops = match from_version {
            Some(from) => self.op_log.get_range(doc_id, from, doc.version).await?,
            None => Vec::new(),
        };
        Ok((doc.view(), ops))
    }

    /// `get_doc`, flushing first if the doc has been dirty for too long.
    pub async fn get_doc_and_flush_if_old(&self, project_id: Uuid, doc_id: Uuid) -> Result<DocumentView, UpdaterError> {
        let doc = self.cache.get(project_id, doc_id).await?;
        if self.flush.is_flush_overdue(&doc) {
            log::info!("Doc {doc_id} unflushed for too long, flushing before read");
            self.flush.flush_doc_if_loaded(project_id, doc_id).await?;
            return self.get_doc(project_id, doc_id).await;
        }
        Ok(doc.view())
    }

    pub async fn doc_ids_in_project(&self, project_id: Uuid) -> Vec<Uuid> {
        self.cache.doc_ids_in_project(project_id).await
    }

    pub fn subscribe_applied_ops(&self) -> broadcast::Receiver<Arc<UpdaterEvent>> {
        self.events.subscribe()
    }

    // ─── Edits ────────────────────────────────────────────────────────

    pub async fn send_update(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        update: Update,
    ) -> Result<AppliedUpdate, UpdaterError> {
        self.sequencer.apply_update(project_id, doc_id, update).await
    }

    pub async fn send_updates(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        updates: Vec<Update>,
    ) -> Result<Vec<AppliedUpdate>, UpdaterError> {
        self.sequencer.apply_updates(project_id, doc_id, updates).await
    }

    pub async fn send_project_update(
        &self,
        project_id: Uuid,
        submission: ProjectStructureUpdate,
    ) -> Result<StructureOutcome, UpdaterError> {
        self.structure
            .update_project_structure(project_id, submission)
            .await
    }

    /// Replace the whole content, as an external edit through the sequencer.
    ///
    /// A doc that was not loaded beforehand is flushed and evicted afterwards;
    /// otherwise it is flushed and stays cached. Returns the applied update,
    /// or `None` if the content was already identical.
    pub async fn set_doc(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        request: SetDocRequest,
    ) -> Result<Option<AppliedUpdate>, UpdaterError> {
        let guard = self.doc_locks.lock(doc_id).await;
        let was_loaded = self.cache.is_loaded(doc_id).await;
        let doc = self.cache.get(project_id, doc_id).await?;

        let mut op = diff_as_op(&doc.text(), &request.lines.join("\n"));
        if op.is_empty() {
            log::debug!("set_doc for doc {doc_id} is a no-op");
            if !was_loaded {
                self.flush
                    .flush_and_delete_with_lock_held(project_id, doc_id, false)
                    .await?;
            }
            return Ok(None);
        }
        if request.undoing {
            for component in &mut op {
                if let Component::Insert { undo, .. } = component {
                    *undo = true;
                }
            }
        }

        let update = Update {
            meta: UpdateMeta {
                user_id: request.user_id,
                source: Some(request.source),
                kind: Some("external".into()),
                ..UpdateMeta::default()
            },
            ..Update::new(op, doc.version)
        };

        let mut outcome = self
            .sequencer
            .apply_with_lock_held(project_id, doc_id, vec![update])
            .await;
        let flushed = match &outcome.error {
            Some(_) => Ok(()),
            None if was_loaded => self.flush.flush_doc_with_lock_held(project_id, doc_id).await,
            None => {
                self.flush
                    .flush_and_delete_with_lock_held(project_id, doc_id, false)
                    .await
            }
        };
        drop(guard);

        if let Some(queued) = outcome.queued {
            self.flush
                .maybe_flush_history(project_id, Some(doc_id), queued)
                .await;
        }
        if let Some(e) = outcome.error.take() {
            return Err(e);
        }
        flushed?;
        Ok(outcome.applied.pop())
    }

    /// Accept tracked changes; the version does not change.
    pub async fn accept_changes(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        change_ids: Vec<String>,
    ) -> Result<usize, UpdaterError> {
        let _guard = self.doc_locks.lock(doc_id).await;
        let doc = self.cache.get(project_id, doc_id).await?;
        let mut tracker = RangesTracker::new(doc.ranges.clone());
        let accepted = tracker.accept_changes(&change_ids);

        self.commit_ranges(project_id, &doc, tracker).await?;
        self.events.publish(UpdaterEvent::AcceptChanges {
            project_id,
            doc_id,
            change_ids,
        });
        log::debug!("Accepted {accepted} changes in doc {doc_id}");
        Ok(accepted)
    }

    /// Delete a comment thread; the version does not change.
    pub async fn delete_comment(&self, project_id: Uuid, doc_id: Uuid, comment_id: &str) -> Result<bool, UpdaterError> {
        let _guard = self.doc_locks.lock(doc_id).await;
        let doc = self.cache.get(project_id, doc_id).await?;
        let mut tracker = RangesTracker::new(doc.ranges.clone());
        let deleted = tracker.delete_comment(comment_id);

        self.commit_ranges(project_id, &doc, tracker).await?;
        self.events.publish(UpdaterEvent::DeleteComment {
            project_id,
            doc_id,
            comment_id: comment_id.to_string(),
        });
        Ok(deleted)
    }

    async fn commit_ranges(
        &self,
        project_id: Uuid,
        doc: &Document,
        tracker: RangesTracker,
    ) -> Result<(), UpdaterError> {
        self.cache
            .update_document(
                project_id,
                doc.doc_id,
                DocumentChange {
                    lines: doc.lines.clone(),
                    version: doc.version,
                    applied_ops: 0,
                    ranges: tracker.into_ranges(),
                    updated_by: None,
                },
            )
            .await?;
        Ok(())
    }

    // ─── Flush / delete ───────────────────────────────────────────────

    pub async fn flush_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<(), UpdaterError> {
        self.flush.flush_doc_if_loaded(project_id, doc_id).await
    }

    pub async fn delete_doc(&self, project_id: Uuid, doc_id: Uuid, ignore_flush_errors: bool) -> Result<(), UpdaterError> {
        self.flush
            .flush_and_delete_doc(project_id, doc_id, ignore_flush_errors)
            .await
    }

    pub async fn flush_project(&self, project_id: Uuid) -> Result<(), UpdaterError> {
        self.flush.flush_project_docs(project_id).await
    }

    pub async fn delete_project(&self, project_id: Uuid) -> Result<(), UpdaterError> {
        self.flush.flush_and_delete_project(project_id).await
    }

    /// Flush every loaded doc (used on shutdown).
    pub async fn flush_all(&self) -> Result<(), UpdaterError> {
        let mut first_error = None;
        for project_id in self.cache.project_ids().await {
            if let Err(e) = self.flush.flush_project_docs(project_id).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    pub fn op_log(&self) -> &Arc<OperationLog> {
        &self.op_log
    }

    pub fn flush_coordinator(&self) -> &Arc<FlushCoordinator> {
        &self.flush
    }

    pub fn sequencer(&self) -> &OTSequencer {
        &self.sequencer
    }
}
