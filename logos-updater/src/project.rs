//! Structural changes to a project's doc and file tree.
//!
//! Each submission carries a major version chosen by the caller. Entries are
//! numbered `"{major}.{index}"` across the doc updates followed by the file
//! updates, and forwarded to project history in that order:
//!
//! ```text
//!   major = 1234
//!   doc_updates  [rename a, rename b]  ──► 1234.0, 1234.1
//!   file_updates [rename c, add d]     ──► 1234.2, 1234.3
//! ```
//!
//! Submissions for one project are serialised by a per-project lock. Conflicting
//! concurrent structural edits are only ordered, never merged.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::DocumentCache;
use crate::collaborators::{ProjectHistoryEntry, ProjectHistoryMeta, ProjectHistoryService, StructuralChange};
use crate::config::RetryPolicy;
use crate::error::UpdaterError;
use crate::flush::{FlushCoordinator, HistoryFlushes, QueuedOps};
use crate::locks::KeyedLocks;
use crate::retry::with_retries;
use crate::update::now_millis;

/// What happened to a doc or file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EntityChange {
    Rename { new_pathname: String },
    AddDoc { doc_lines: String },
    AddFile { url: String },
    Remove,
}

/// One structural change to a doc or file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub id: Uuid,
    pub pathname: String,
    #[serde(flatten)]
    pub change: EntityChange,
}

impl EntityUpdate {
    pub fn rename(id: Uuid, pathname: impl Into<String>, new_pathname: impl Into<String>) -> Self {
        Self {
            id,
            pathname: pathname.into(),
            change: EntityChange::Rename {
                new_pathname: new_pathname.into(),
            },
        }
    }

    pub fn add_doc(id: Uuid, pathname: impl Into<String>, doc_lines: impl Into<String>) -> Self {
        Self {
            id,
            pathname: pathname.into(),
            change: EntityChange::AddDoc {
                doc_lines: doc_lines.into(),
            },
        }
    }

    pub fn add_file(id: Uuid, pathname: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id,
            pathname: pathname.into(),
            change: EntityChange::AddFile { url: url.into() },
        }
    }

    pub fn remove(id: Uuid, pathname: impl Into<String>) -> Self {
        Self {
            id,
            pathname: pathname.into(),
            change: EntityChange::Remove,
        }
    }

    fn to_structural(&self) -> StructuralChange {
        let (id, pathname) = (self.id, self.pathname.clone());
        match &self.change {
            EntityChange::Rename { new_pathname } => StructuralChange::Rename {
                id,
                pathname,
                new_pathname: new_pathname.clone(),
            },
            EntityChange::Remove => StructuralChange::Rename {
                id,
                pathname,
                new_pathname: String::new(),
            },
            EntityChange::AddDoc { doc_lines } => StructuralChange::AddDoc {
                id,
                pathname,
                doc_lines: doc_lines.clone(),
            },
            EntityChange::AddFile { url } => StructuralChange::AddFile {
                id,
                pathname,
                url: url.clone(),
            },
        }
    }
}

/// A client submission of structural changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStructureUpdate {
    /// Major version; entries get `"{version}.{index}"`
    pub version: u64,
    pub user_id: String,
    #[serde(default)]
    pub project_history_id: Option<String>,
    #[serde(default)]
    pub doc_updates: Vec<EntityUpdate>,
    #[serde(default)]
    pub file_updates: Vec<EntityUpdate>,
}

/// Entries forwarded to history, and whether that triggered a flush.
#[derive(Debug, Clone, PartialEq)]
pub struct StructureOutcome {
    pub entries: Vec<ProjectHistoryEntry>,
    pub flushes: HistoryFlushes,
}

pub struct ProjectStructureSequencer {
    cache: Arc<DocumentCache>,
    project_history: Arc<dyn ProjectHistoryService>,
    flush: Arc<FlushCoordinator>,
    doc_locks: Arc<KeyedLocks>,
    project_locks: KeyedLocks,
    retry: RetryPolicy,
}

impl ProjectStructureSequencer {
    pub fn new(
        cache: Arc<DocumentCache>,
        project_history: Arc<dyn ProjectHistoryService>,
        flush: Arc<FlushCoordinator>,
        doc_locks: Arc<KeyedLocks>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            project_history,
            flush,
            doc_locks,
            project_locks: KeyedLocks::new(),
            retry,
        }
    }

    /// Number, apply and forward one submission.
    pub async fn update_project_structure(
        &self,
        project_id: Uuid,
        submission: ProjectStructureUpdate,
    ) -> Result<StructureOutcome, UpdaterError> {
        let guard = self.project_locks.lock(project_id).await;

        let ts = now_millis();
        let major = submission.version;
        let mut entries = Vec::with_capacity(submission.doc_updates.len() + submission.file_updates.len());

        for doc_update in &submission.doc_updates {
            if let EntityChange::Rename { new_pathname } = &doc_update.change {
                let _doc_guard = self.doc_locks.lock(doc_update.id).await;
                if self.cache.record_rename(project_id, doc_update.id, new_pathname).await {
                    log::debug!("Renamed cached doc {} to {new_pathname}", doc_update.id);
                }
            }
        }

        let all = submission.doc_updates.iter().chain(&submission.file_updates);
        for (index, entity) in all.enumerate() {
            entries.push(ProjectHistoryEntry {
                version: format!("{major}.{index}"),
                change: entity.to_structural(),
                meta: ProjectHistoryMeta {
                    user_id: submission.user_id.clone(),
                    ts,
                },
                project_history_id: submission.project_history_id.clone(),
            });
        }

        if entries.is_empty() {
            return Ok(StructureOutcome {
                entries,
                flushes: HistoryFlushes::default(),
            });
        }

        let queue_len = with_retries(&self.retry, "queueProjectStructure", || {
            self.project_history.queue_structure(project_id, &entries)
        })
        .await
        .map_err(|e| e.into_updater("queueProjectStructure", project_id, Uuid::nil()))?;
        drop(guard);

        log::info!(
            "Queued {} structure updates for project {project_id} at v{major}",
            entries.len()
        );

        let flushes = self
            .flush
            .maybe_flush_history(
                project_id,
                None,
                QueuedOps {
                    ops: entries.len() as u64,
                    doc_queue_len: None,
                    project_queue_len: Some(queue_len),
                },
            )
            .await;

        Ok(StructureOutcome { entries, flushes })
    }
}
