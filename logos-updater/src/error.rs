//! Error taxonomy for the updater.
//!
//! Sequencing errors (`ContentMismatch`, `StaleVersionUnrecoverable`, `VersionAhead`)
//! reject a single update and leave the document untouched. Infrastructure errors
//! (`DownstreamTimeout`, `Downstream`, `ConcurrentWriteConflict`) propagate to the
//! caller of the top-level operation.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::collaborators::CollaboratorError;
use crate::oplog::OpLogError;
use crate::ot::OtError;
use crate::ranges::RangesError;

/// Top-level error returned by every public updater operation.
#[derive(Debug, Clone, Error)]
pub enum UpdaterError {
    /// Document is neither cached nor present in the versioned store
    #[error("Document not found: {doc_id} (project {project_id})")]
    NotFound { project_id: Uuid, doc_id: Uuid },

    /// Client claims a version the server has not reached
    #[error("Op at future version: client v{client_version}, document v{current_version}")]
    VersionAhead {
        client_version: u64,
        current_version: u64,
    },

    /// Requested op range has fallen out of the operation log
    #[error(
        "Op range not available: requested v{requested}, first retained v{first_version}, \
         current v{current_version}, retention {retention:?}"
    )]
    StaleVersionUnrecoverable {
        requested: u64,
        first_version: u64,
        current_version: u64,
        retention: Duration,
    },

    /// Op does not apply to the live content
    #[error(transparent)]
    ContentMismatch(#[from] OtError),

    /// Op does not apply to the tracked ranges
    #[error(transparent)]
    Ranges(#[from] RangesError),

    /// Storage layer rejected a write because of a version race
    #[error("Concurrent write conflict on doc {doc_id}")]
    ConcurrentWriteConflict { doc_id: Uuid },

    /// Project is flagged blocked (e.g. mid-deletion)
    #[error("Project {project_id} is blocked")]
    ProjectBlocked { project_id: Uuid },

    /// Hash or version bookkeeping disagrees with the data
    #[error("Corruption detected for doc {doc_id}: {reason}")]
    CorruptionDetected { doc_id: Uuid, reason: String },

    /// A downstream call exceeded its bounded wait on every attempt
    #[error("Downstream {operation} timed out after {timeout:?}")]
    DownstreamTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// A downstream call failed for a reason other than a timeout
    #[error("Downstream {operation} failed: {message}")]
    Downstream {
        operation: &'static str,
        message: String,
    },

    #[error("Update takes doc over max doc size ({length} > {max})")]
    DocTooLarge { length: usize, max: usize },

    #[error("Ranges are too large ({size} > {max})")]
    RangesTooLarge { size: usize, max: usize },

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),
}

impl UpdaterError {
    /// Attach document context to a collaborator failure.
    pub fn from_collaborator(
        err: CollaboratorError,
        operation: &'static str,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Self {
        match err {
            CollaboratorError::NotFound => UpdaterError::NotFound { project_id, doc_id },
            CollaboratorError::Conflict => UpdaterError::ConcurrentWriteConflict { doc_id },
            CollaboratorError::Integrity(reason) => {
                UpdaterError::CorruptionDetected { doc_id, reason }
            }
            CollaboratorError::Unavailable(message) => {
                UpdaterError::Downstream { operation, message }
            }
        }
    }

    /// HTTP-equivalent status for the excluded boundary layer.
    pub fn status_code(&self) -> u16 {
        match self {
            UpdaterError::NotFound { .. } => 404,
            UpdaterError::InvalidUpdate(_) => 400,
            UpdaterError::ConcurrentWriteConflict { .. } => 409,
            UpdaterError::DocTooLarge { .. } | UpdaterError::RangesTooLarge { .. } => 413,
            UpdaterError::StaleVersionUnrecoverable { .. } => 422,
            UpdaterError::ProjectBlocked { .. } => 423,
            UpdaterError::DownstreamTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// True when the caller must reload the document instead of retrying.
    pub fn is_unprocessable(&self) -> bool {
        matches!(self, UpdaterError::StaleVersionUnrecoverable { .. })
    }

    /// True for failures that a later flush attempt may succeed on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpdaterError::DownstreamTimeout { .. }
                | UpdaterError::Downstream { .. }
                | UpdaterError::ConcurrentWriteConflict { .. }
        )
    }
}

impl From<OpLogError> for UpdaterError {
    fn from(e: OpLogError) -> Self {
        match e {
            OpLogError::RangeNotAvailable {
                requested,
                first_version,
                current_version,
                retention,
            } => UpdaterError::StaleVersionUnrecoverable {
                requested,
                first_version,
                current_version,
                retention,
            },
        }
    }
}
