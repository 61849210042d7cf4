//! Per-document OT sequencer.
//!
//! ```text
//!   update{op, v} ──► doc lock ──► cache.get
//!                                     │
//!                     v > version ────┼──► VersionAhead
//!                                     │
//!                     v < version ────┼──► op log [v, version) ──► transform(op, old, Left) each
//!                                     │        │                       │
//!                                     │        └─ not retained ──► StaleVersionUnrecoverable
//!                                     │                                │
//!                                     │        dupIfSource match ──► dup: true, no new version
//!                                     ▼
//!                        apply to text + ranges ──► cache.update_document (v + 1)
//!                                     │
//!                                     ├──► op log append
//!                                     ├──► publish applied-ops
//!                                     └──► queue history
//!   doc lock released ──► maybe_flush_history
//! ```
//!
//! Updates for one doc are applied strictly one at a time; different docs run
//! fully in parallel. Any rejection is also published on `applied-ops` with
//! its error so subscribed clients can reload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::broadcast::{EventBus, UpdaterEvent};
use crate::cache::{DocumentCache, DocumentChange};
use crate::collaborators::{DocHistoryService, ProjectHistoryService};
use crate::document::split_lines;
use crate::error::UpdaterError;
use crate::flush::{FlushCoordinator, QueuedOps};
use crate::locks::KeyedLocks;
use crate::oplog::OperationLog;
use crate::ot::{apply, transform, Side};
use crate::ranges::{ChangeContext, RangesTracker};
use crate::update::{now_millis, Update};

/// Result of sequencing one update.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    /// The update as applied: transformed op, final base version, history metadata
    pub update: Update,
    /// Document version after the update
    pub version: u64,
    /// The update had already been applied; nothing changed
    pub dup: bool,
}

/// Outcome of a batch applied while the caller holds the doc lock.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: Vec<AppliedUpdate>,
    /// What was pushed to history, for `maybe_flush_history` after unlock
    pub queued: Option<QueuedOps>,
    /// Error that stopped the batch; updates before it stay applied
    pub error: Option<UpdaterError>,
}

#[derive(Debug, Clone, Default)]
pub struct SequencerStats {
    pub applied: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

pub struct OTSequencer {
    cache: Arc<DocumentCache>,
    op_log: Arc<OperationLog>,
    events: Arc<EventBus>,
    flush: Arc<FlushCoordinator>,
    doc_history: Arc<dyn DocHistoryService>,
    project_history: Arc<dyn ProjectHistoryService>,
    doc_locks: Arc<KeyedLocks>,
    applied: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
}

impl OTSequencer {
    pub fn new(
        cache: Arc<DocumentCache>,
        op_log: Arc<OperationLog>,
        events: Arc<EventBus>,
        flush: Arc<FlushCoordinator>,
        doc_history: Arc<dyn DocHistoryService>,
        project_history: Arc<dyn ProjectHistoryService>,
        doc_locks: Arc<KeyedLocks>,
    ) -> Self {
        Self {
            cache,
            op_log,
            events,
            flush,
            doc_history,
            project_history,
            doc_locks,
            applied: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Sequence a single update.
    pub async fn apply_update(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        update: Update,
    ) -> Result<AppliedUpdate, UpdaterError> {
        let mut applied = self.apply_updates(project_id, doc_id, vec![update]).await?;
        applied
            .pop()
            .ok_or_else(|| UpdaterError::InvalidUpdate("no update applied".into()))
    }

    /// Sequence updates in order under one lock acquisition.
    ///
    /// Stops at the first rejected update; updates before it remain applied.
    pub async fn apply_updates(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        updates: Vec<Update>,
    ) -> Result<Vec<AppliedUpdate>, UpdaterError> {
        let guard = self.doc_locks.lock(doc_id).await;
        let outcome = self.apply_with_lock_held(project_id, doc_id, updates).await;
        drop(guard);

        if let Some(queued) = outcome.queued {
            self.flush.maybe_flush_history(project_id, Some(doc_id), queued).await;
        }
        match outcome.error {
            Some(e) => Err(e),
            None => Ok(outcome.applied),
        }
    }

    /// Sequence updates; the caller must hold the doc lock.
    ///
    /// History is queued here, but flushing it is left to the caller once the
    /// lock is released.
    pub async fn apply_with_lock_held(&self, project_id: Uuid, doc_id: Uuid, updates: Vec<Update>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for update in updates {
            match self.apply_one(project_id, doc_id, update).await {
                Ok(applied) => outcome.applied.push(applied),
                Err(e) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Rejected update for doc {doc_id}: {e}");
                    self.events.publish(UpdaterEvent::rejected(project_id, doc_id, &e));
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        outcome.queued = self.queue_history(project_id, doc_id, &outcome.applied).await;
        outcome
    }

    async fn apply_one(&self, project_id: Uuid, doc_id: Uuid, mut update: Update) -> Result<AppliedUpdate, UpdaterError> {
        update.sanitize();
        update.doc = Some(doc_id);

        let doc = self.cache.get(project_id, doc_id).await?;
        if update.v > doc.version {
            return Err(UpdaterError::VersionAhead {
                client_version: update.v,
                current_version: doc.version,
            });
        }

        if update.v < doc.version {
            let previous = self.op_log.get_range(doc_id, update.v, doc.version).await?;
            for old in &previous {
                let from_dup_source = old
                    .meta
                    .source
                    .as_ref()
                    .is_some_and(|source| update.dup_if_source.contains(source));
                if from_dup_source && old.op == update.op {
                    log::debug!("Update for doc {doc_id} at v{} is a duplicate", update.v);
                    update.dup = true;
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                    self.events.publish(UpdaterEvent::applied(project_id, doc_id, update.clone()));
                    return Ok(AppliedUpdate {
                        update,
                        version: doc.version,
                        dup: true,
                    });
                }
                update.op = transform(&update.op, &old.op, Side::Left)?;
                update.v += 1;
            }
            log::trace!("Transformed update for doc {doc_id} over {} ops", previous.len());
        }

        let text = doc.text();
        let new_text = apply(&text, &update.op)?;

        let ts = *update.meta.ts.get_or_insert_with(now_millis);
        let ctx = ChangeContext {
            user_id: update.meta.user_id.clone(),
            ts,
            track: update.meta.tc.is_some(),
        };
        let mut tracker = RangesTracker::new(doc.ranges.clone());
        tracker.apply_ops(&update.op, &ctx)?;

        update.meta.pathname = Some(doc.pathname.clone());
        update.meta.doc_length = Some(doc.text_len());
        update.project_history_id = doc.project_history_id.clone();

        let new_version = doc.version + 1;
        self.cache
            .update_document(
                project_id,
                doc_id,
                DocumentChange {
                    lines: split_lines(&new_text),
                    version: new_version,
                    applied_ops: 1,
                    ranges: tracker.into_ranges(),
                    updated_by: update.meta.user_id.clone(),
                },
            )
            .await?;

        self.op_log.append(doc_id, new_version, std::slice::from_ref(&update)).await;
        self.events.publish(UpdaterEvent::applied(project_id, doc_id, update.clone()));
        self.applied.fetch_add(1, Ordering::Relaxed);
        log::debug!("Applied update to doc {doc_id}, now v{new_version}");

        Ok(AppliedUpdate {
            update,
            version: new_version,
            dup: false,
        })
    }

    /// Push non-duplicate updates to both history services, in order.
    async fn queue_history(&self, project_id: Uuid, doc_id: Uuid, applied: &[AppliedUpdate]) -> Option<QueuedOps> {
        let ops: Vec<Update> = applied
            .iter()
            .filter(|a| !a.dup)
            .map(|a| a.update.clone())
            .collect();
        if ops.is_empty() {
            return None;
        }

        let doc_queue_len = match self.doc_history.queue_ops(project_id, doc_id, &ops).await {
            Ok(len) => Some(len),
            Err(e) => {
                log::warn!("Failed to queue {} ops for doc {doc_id} history: {e}", ops.len());
                None
            }
        };
        let project_queue_len = match self.project_history.queue_doc_ops(project_id, &ops).await {
            Ok(len) => Some(len),
            Err(e) => {
                log::warn!("Failed to queue {} ops for project {project_id} history: {e}", ops.len());
                None
            }
        };
        Some(QueuedOps {
            ops: ops.len() as u64,
            doc_queue_len,
            project_queue_len,
        })
    }

    pub fn stats(&self) -> SequencerStats {
        SequencerStats {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
