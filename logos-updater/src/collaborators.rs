//! Contracts of the services the updater depends on.
//!
//! ```text
//!                ┌──────────────────┐
//!   load/flush   │  VersionedStore  │  lines, version, ranges, pathname
//!  ────────────► │  (doc service)   │
//!                └────────┬─────────┘
//!                         │ archived?
//!                         ▼
//!                ┌──────────────────┐
//!                │  ArchiveService  │  unarchive → lines + hash
//!                └──────────────────┘
//!
//!   applied ops  ┌──────────────────┐   structural ops ┌──────────────────────┐
//!  ────────────► │ DocHistoryService│  ──────────────► │ ProjectHistoryService│
//!                └──────────────────┘                  └──────────────────────┘
//! ```
//!
//! All calls may be slow; callers wrap them in `retry::with_retries`. Store
//! writes must be idempotent under retry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ranges::Ranges;
use crate::update::Update;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("not found")]
    NotFound,
    /// Version/rev race at the storage layer
    #[error("conflict")]
    Conflict,
    /// Checksum or hash disagreement
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// A document as held by the versioned store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// `None` when the content has been moved to the archive
    pub lines: Option<Vec<String>>,
    pub version: u64,
    pub ranges: Ranges,
    pub pathname: String,
    pub project_history_id: Option<String>,
    /// Hash recorded with the last write, verified on load
    pub content_hash: Option<String>,
}

/// State written back on flush.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub lines: Vec<String>,
    pub version: u64,
    pub ranges: Ranges,
    pub last_updated_at: Option<u64>,
    pub last_updated_by: Option<String>,
}

/// Content restored from cold storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedDocument {
    pub lines: Vec<String>,
    /// SHA-256 of the JSON lines as recorded at archive time
    pub hash: String,
}

/// One structural change queued for project history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectHistoryEntry {
    /// `"{major}.{index}"`
    pub version: String,
    #[serde(flatten)]
    pub change: StructuralChange,
    pub meta: ProjectHistoryMeta,
    #[serde(rename = "projectHistoryId", skip_serializing_if = "Option::is_none")]
    pub project_history_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectHistoryMeta {
    pub user_id: String,
    pub ts: u64,
}

/// Structural change recorded in project history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StructuralChange {
    /// `new_pathname` empty means the entity was removed
    Rename {
        id: Uuid,
        pathname: String,
        new_pathname: String,
    },
    AddDoc {
        id: Uuid,
        pathname: String,
        doc_lines: String,
    },
    AddFile {
        id: Uuid,
        pathname: String,
        url: String,
    },
}

/// Durable record of each document's lines, version and ranges.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    async fn get_document(&self, project_id: Uuid, doc_id: Uuid) -> Result<StoredDocument, CollaboratorError>;

    async fn set_document(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        snapshot: &DocumentSnapshot,
    ) -> Result<(), CollaboratorError>;
}

/// Cold storage for documents not edited in a long time.
#[async_trait]
pub trait ArchiveService: Send + Sync {
    async fn unarchive(&self, project_id: Uuid, doc_id: Uuid) -> Result<ArchivedDocument, CollaboratorError>;
}

/// Track-changes style history of document ops.
#[async_trait]
pub trait DocHistoryService: Send + Sync {
    /// Queue ops in order; returns the queue length after the push.
    async fn queue_ops(&self, project_id: Uuid, doc_id: Uuid, ops: &[Update]) -> Result<u64, CollaboratorError>;

    async fn flush_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<(), CollaboratorError>;
}

/// Project-level history covering doc ops and structural changes.
#[async_trait]
pub trait ProjectHistoryService: Send + Sync {
    /// Queue doc ops for the project stream; returns the queue length.
    async fn queue_doc_ops(&self, project_id: Uuid, ops: &[Update]) -> Result<u64, CollaboratorError>;

    /// Queue structural changes; returns the queue length.
    async fn queue_structure(
        &self,
        project_id: Uuid,
        entries: &[ProjectHistoryEntry],
    ) -> Result<u64, CollaboratorError>;

    async fn flush_project(&self, project_id: Uuid) -> Result<(), CollaboratorError>;
}
