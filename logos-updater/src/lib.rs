//! # logos-updater — Operational-transform document updater
//!
//! Keeps hot documents in memory, sequences concurrent text edits with
//! operational transformation and flushes state to a versioned store.
//!
//! ## Architecture
//!
//! ```text
//!   send_update(doc, {op, v})
//!          │
//!          ▼
//! ┌──────────────────┐  ops since v  ┌──────────────┐
//! │   OTSequencer    │ ◄──────────── │ OperationLog │
//! │ (per-doc lock)   │ ────────────► │ (TTL + cap)  │
//! └────────┬─────────┘   append      └──────────────┘
//!          │ update_document
//!          ▼
//! ┌──────────────────┐   setDoc    ┌─────────────────────┐
//! │  DocumentCache   │ ──────────► │ VersionedStore      │
//! │ (hot docs)       │ ◄────────── │ (RocksDB / memory)  │
//! └────────┬─────────┘   getDoc    └─────────────────────┘
//!          │
//!          ▼
//! ┌──────────────────┐  queue / flush  ┌────────────────────┐
//! │ FlushCoordinator │ ──────────────► │ Doc / project      │
//! │                  │                 │ history services   │
//! └──────────────────┘                 └────────────────────┘
//!          │
//!          ▼  applied-ops
//!       EventBus ──► subscribers (WebSocket gateway)
//! ```
//!
//! ## Modules
//!
//! - [`ot`] — ShareJS text OT: apply, transform, compose
//! - [`ranges`] — Tracked changes and comments that move with edits
//! - [`oplog`] — Bounded per-doc log of applied updates
//! - [`cache`] — Hot-document cache with project blocking
//! - [`sequencer`] — Serialised application of client updates
//! - [`flush`] — Store persistence and history flush thresholds
//! - [`project`] — Ordered project structure updates
//! - [`manager`] — `DocumentUpdater`, the operation surface
//! - [`storage`] — RocksDB-backed versioned store
//! - [`server`] — WebSocket gateway over the JSON [`protocol`]

pub mod broadcast;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod diff;
pub mod document;
pub mod error;
pub mod flush;
pub mod locks;
pub mod manager;
pub mod memory;
pub mod oplog;
pub mod ot;
pub mod project;
pub mod protocol;
pub mod ranges;
pub mod retry;
pub mod sequencer;
pub mod server;
pub mod storage;
pub mod update;

// Re-exports for convenience
pub use broadcast::{DocRooms, EventBus, EventBusStats, UpdaterEvent};
pub use cache::{DocumentCache, DocumentChange};
pub use collaborators::{
    ArchiveService, ArchivedDocument, CollaboratorError, DocHistoryService, DocumentSnapshot,
    ProjectHistoryEntry, ProjectHistoryService, StoredDocument, StructuralChange, VersionedStore,
};
pub use config::{FlushConfig, OpLogConfig, RetryPolicy, UpdaterConfig};
pub use document::{Document, DocumentView};
pub use error::UpdaterError;
pub use flush::{FlushCoordinator, FlushStats, HistoryFlushes, QueuedOps};
pub use manager::{Collaborators, DocumentUpdater, SetDocRequest};
pub use memory::{MemoryArchive, MemoryHistory, MemoryStore};
pub use oplog::{OpLogError, OpLogStats, OperationLog};
pub use ot::{Component, Op, OtError, Side};
pub use project::{EntityChange, EntityUpdate, ProjectStructureSequencer, ProjectStructureUpdate, StructureOutcome};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use ranges::{Ranges, RangesTracker};
pub use sequencer::{AppliedUpdate, OTSequencer, SequencerStats};
pub use server::{ServerConfig, ServerStats, UpdaterServer};
pub use storage::{RocksVersionedStore, StoreConfig, StoreError};
pub use update::{Update, UpdateMeta};
