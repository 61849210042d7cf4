//! Capped, time-bounded log of applied ops per document.
//!
//! ```text
//!   first_version                          end_version
//!        │                                      │
//!        ▼                                      ▼
//!   ┌────────┬────────┬────────┬─────┬────────┐
//!   │ op v40 │ op v41 │ op v42 │ ... │ op v139│   (max_entries = 100)
//!   └────────┴────────┴────────┴─────┴────────┘
//!    oldest ◄── expire after ttl / evicted past max_entries
//! ```
//!
//! The op at index `i` is the op that took the document from version
//! `first_version + i` to `first_version + i + 1`. The log is independent of
//! the document cache: evicting a document keeps its ops, so an update based
//! on an older version can still be transformed after the document is
//! reloaded from the versioned store.
//!
//! A requested range is served only if it is fully retained. Otherwise the
//! caller gets `RangeNotAvailable` and must reload; partial history is never
//! returned.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::OpLogConfig;
use crate::ot::{compose, Op};
use crate::update::Update;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpLogError {
    #[error("Op range not available: requested v{requested}, first retained v{first_version}, current v{current_version}")]
    RangeNotAvailable {
        requested: u64,
        first_version: u64,
        current_version: u64,
        retention: Duration,
    },
}

/// Log statistics.
#[derive(Debug, Clone, Default)]
pub struct OpLogStats {
    pub appended: u64,
    pub expired: u64,
    pub tracked_docs: usize,
}

struct LoggedOp {
    update: Update,
    appended_at: Instant,
}

struct DocOps {
    ops: VecDeque<LoggedOp>,
    /// Version reached after the newest op
    end_version: u64,
}

impl DocOps {
    fn first_version(&self) -> u64 {
        self.end_version - self.ops.len() as u64
    }

    fn expired_prefix(&self, ttl: Duration) -> usize {
        self.ops
            .iter()
            .take_while(|op| op.appended_at.elapsed() > ttl)
            .count()
    }
}

/// Per-document op log shared by the sequencer and read paths.
pub struct OperationLog {
    docs: RwLock<HashMap<Uuid, DocOps>>,
    config: OpLogConfig,
    appended: AtomicU64,
    expired: AtomicU64,
}

impl OperationLog {
    pub fn new(config: OpLogConfig) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            config,
            appended: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Record `updates`, which took the doc to `new_version`.
    ///
    /// If the log does not end where these ops start (e.g. the retained ops
    /// expired while the doc moved on), older entries are discarded so the
    /// log never contains a gap.
    pub async fn append(&self, doc_id: Uuid, new_version: u64, updates: &[Update]) {
        if updates.is_empty() {
            return;
        }
        let count = updates.len() as u64;
        let start_version = new_version.saturating_sub(count);
        let now = Instant::now();

        let mut docs = self.docs.write().await;
        let entry = docs.entry(doc_id).or_insert_with(|| DocOps {
            ops: VecDeque::new(),
            end_version: start_version,
        });

        if entry.end_version != start_version {
            if !entry.ops.is_empty() {
                log::warn!(
                    "Op log for doc {doc_id} ends at v{} but new ops start at v{start_version}, discarding {} ops",
                    entry.end_version,
                    entry.ops.len()
                );
            }
            entry.ops.clear();
            entry.end_version = start_version;
        }

        for update in updates {
            entry.ops.push_back(LoggedOp {
                update: update.clone(),
                appended_at: now,
            });
        }
        entry.end_version = new_version;

        while entry.ops.len() > self.config.max_entries {
            entry.ops.pop_front();
        }
        let expired = entry.expired_prefix(self.config.ttl);
        entry.ops.drain(..expired);

        self.appended.fetch_add(count, Ordering::Relaxed);
        self.expired.fetch_add(expired as u64, Ordering::Relaxed);
    }

    /// Ops taking the doc from version `start` to version `end`.
    pub async fn get_range(&self, doc_id: Uuid, start: u64, end: u64) -> Result<Vec<Update>, OpLogError> {
        let docs = self.docs.read().await;

        let unavailable = |first_version: u64| OpLogError::RangeNotAvailable {
            requested: start,
            first_version,
            current_version: end,
            retention: self.config.ttl,
        };

        let Some(entry) = docs.get(&doc_id) else {
            if start == end {
                return Ok(Vec::new());
            }
            return Err(unavailable(end));
        };

        let expired = entry.expired_prefix(self.config.ttl);
        let first = entry.first_version() + expired as u64;
        if start > end || start < first || end > entry.end_version {
            return Err(unavailable(first));
        }

        let base = entry.first_version();
        let from = (start - base) as usize;
        let to = (end - base) as usize;
        Ok(entry
            .ops
            .range(from..to)
            .map(|logged| logged.update.clone())
            .collect())
    }

    /// Every retained op from `from` up to the newest.
    pub async fn recent_since(&self, doc_id: Uuid, from: u64) -> Result<Vec<Update>, OpLogError> {
        let end = self.end_version(doc_id).await.unwrap_or(from);
        self.get_range(doc_id, from, end).await
    }

    /// The ops between `start` and `end` composed into a single op.
    pub async fn composed_since(&self, doc_id: Uuid, start: u64, end: u64) -> Result<Op, OpLogError> {
        let updates = self.get_range(doc_id, start, end).await?;
        Ok(updates
            .iter()
            .fold(Op::new(), |acc, update| compose(&acc, &update.op)))
    }

    /// Version reached by the newest logged op.
    pub async fn end_version(&self, doc_id: Uuid) -> Option<u64> {
        self.docs.read().await.get(&doc_id).map(|d| d.end_version)
    }

    /// Oldest version still covered by a live entry.
    pub async fn first_version(&self, doc_id: Uuid) -> Option<u64> {
        let docs = self.docs.read().await;
        docs.get(&doc_id)
            .map(|d| d.first_version() + d.expired_prefix(self.config.ttl) as u64)
    }

    /// Number of live entries for a doc.
    pub async fn len(&self, doc_id: Uuid) -> usize {
        let docs = self.docs.read().await;
        docs.get(&doc_id)
            .map(|d| d.ops.len() - d.expired_prefix(self.config.ttl))
            .unwrap_or(0)
    }

    /// Drop expired entries everywhere; forget docs left with none.
    ///
    /// Returns the number of entries dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut docs = self.docs.write().await;
        let mut dropped = 0;
        docs.retain(|_, entry| {
            let expired = entry.expired_prefix(self.config.ttl);
            entry.ops.drain(..expired);
            dropped += expired;
            !entry.ops.is_empty()
        });
        self.expired.fetch_add(dropped as u64, Ordering::Relaxed);
        if dropped > 0 {
            log::debug!("Purged {dropped} expired ops");
        }
        dropped
    }

    pub async fn stats(&self) -> OpLogStats {
        OpLogStats {
            appended: self.appended.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            tracked_docs: self.docs.read().await.len(),
        }
    }

    pub fn config(&self) -> &OpLogConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Component;

    fn op(p: usize, text: &str, v: u64) -> Update {
        Update::new(vec![Component::insert(p, text)], v)
    }

    fn small_log(max_entries: usize, ttl: Duration) -> OperationLog {
        OperationLog::new(OpLogConfig { max_entries, ttl })
    }

    #[tokio::test]
    async fn test_append_and_range() {
        let log = OperationLog::new(OpLogConfig::default());
        let doc = Uuid::new_v4();
        for v in 0..5 {
            log.append(doc, v + 1, &[op(0, "x", v)]).await;
        }
        let ops = log.get_range(doc, 2, 5).await.unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].v, 2);
        assert_eq!(ops[2].v, 4);
        assert_eq!(log.end_version(doc).await, Some(5));
        assert_eq!(log.first_version(doc).await, Some(0));
    }

    #[tokio::test]
    async fn test_empty_range_is_ok() {
        let log = OperationLog::new(OpLogConfig::default());
        let doc = Uuid::new_v4();
        assert!(log.get_range(doc, 7, 7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_log_is_unavailable() {
        let log = OperationLog::new(OpLogConfig::default());
        let err = log.get_range(Uuid::new_v4(), 3, 7).await.unwrap_err();
        assert_eq!(
            err,
            OpLogError::RangeNotAvailable {
                requested: 3,
                first_version: 7,
                current_version: 7,
                retention: Duration::from_secs(3600),
            }
        );
    }

    #[tokio::test]
    async fn test_capped_at_max_entries() {
        let log = small_log(10, Duration::from_secs(60));
        let doc = Uuid::new_v4();
        for v in 0..25 {
            log.append(doc, v + 1, &[op(0, "x", v)]).await;
        }
        assert_eq!(log.len(doc).await, 10);
        assert_eq!(log.first_version(doc).await, Some(15));
        assert!(log.get_range(doc, 15, 25).await.is_ok());

        match log.get_range(doc, 14, 25).await {
            Err(OpLogError::RangeNotAvailable { first_version, current_version, .. }) => {
                assert_eq!(first_version, 15);
                assert_eq!(current_version, 25);
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_range_beyond_end_rejected() {
        let log = OperationLog::new(OpLogConfig::default());
        let doc = Uuid::new_v4();
        log.append(doc, 1, &[op(0, "a", 0)]).await;
        assert!(log.get_range(doc, 0, 2).await.is_err());
        assert!(log.get_range(doc, 1, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let log = small_log(100, Duration::from_millis(50));
        let doc = Uuid::new_v4();
        log.append(doc, 1, &[op(0, "a", 0)]).await;
        log.append(doc, 2, &[op(0, "b", 1)]).await;
        assert_eq!(log.len(doc).await, 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        log.append(doc, 3, &[op(0, "c", 2)]).await;

        assert_eq!(log.len(doc).await, 1);
        assert!(log.get_range(doc, 0, 3).await.is_err());
        assert_eq!(log.get_range(doc, 2, 3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired_forgets_docs() {
        let log = small_log(100, Duration::from_millis(20));
        let doc = Uuid::new_v4();
        log.append(doc, 1, &[op(0, "a", 0)]).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(log.purge_expired().await, 1);
        assert_eq!(log.end_version(doc).await, None);
        assert_eq!(log.stats().await.tracked_docs, 0);
    }

    #[tokio::test]
    async fn test_gap_resets_log() {
        let log = OperationLog::new(OpLogConfig::default());
        let doc = Uuid::new_v4();
        log.append(doc, 1, &[op(0, "a", 0)]).await;
        log.append(doc, 6, &[op(0, "b", 5)]).await;
        assert_eq!(log.first_version(doc).await, Some(5));
        assert!(log.get_range(doc, 0, 6).await.is_err());
        assert_eq!(log.get_range(doc, 5, 6).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_composed_since() {
        let log = OperationLog::new(OpLogConfig::default());
        let doc = Uuid::new_v4();
        log.append(doc, 1, &[op(0, "ab", 0)]).await;
        log.append(doc, 2, &[op(2, "cd", 1)]).await;
        let composed = log.composed_since(doc, 0, 2).await.unwrap();
        assert_eq!(composed, vec![Component::insert(0, "abcd")]);
    }

    #[tokio::test]
    async fn test_recent_since() {
        let log = OperationLog::new(OpLogConfig::default());
        let doc = Uuid::new_v4();
        for v in 0..3 {
            log.append(doc, v + 1, &[op(0, "x", v)]).await;
        }
        assert_eq!(log.recent_since(doc, 1).await.unwrap().len(), 2);
        assert!(log.recent_since(doc, 3).await.unwrap().is_empty());
    }
}
