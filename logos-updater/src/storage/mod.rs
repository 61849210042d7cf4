//! Durable backing store for flushed documents.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐  flush (setDoc)   ┌─────────────────────┐
//! │ DocumentCache │ ────────────────► │ RocksVersionedStore │
//! │ (in-memory)   │ ◄──────────────── │ (RocksDB)           │
//! └───────────────┘  load (getDoc)    └──────────┬──────────┘
//!                                                │ column families
//!                                                ▼
//!                     ┌──────────────────────────────────────┐
//!                     │ CF "docs"     — LZ4 lines + ranges   │
//!                     │ CF "metadata" — version, path, hash  │
//!                     └──────────────────────────────────────┘
//! ```
//!
//! Writes with a version lower than the stored one are rejected, so a
//! delayed flush can never roll a document back.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{doc_key, DocRecord, RocksVersionedStore, StoreConfig, StoreError};
