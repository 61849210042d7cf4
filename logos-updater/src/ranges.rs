//! Comment threads and tracked changes anchored in document text.
//!
//! Ranges describe the document as it is now: an insert change covers text
//! that is present, a delete change is a zero-width marker holding text that
//! has been removed. Every op applied to the document is replayed here so
//! anchors stay aligned with content.
//!
//! Tracked-change rules:
//! - text inserted at a delete marker goes to the left of the marker
//! - deleting text that is itself a tracked insert shrinks that insert and
//!   leaves no delete marker for it
//! - delete markers swallowed by a tracked delete are merged into it
//! - inserts only merge with an existing insert change by the same user;
//!   anything else landing inside an insert change splits it

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ot::text::{char_len, inject, slice_chars};
use crate::ot::Component;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Milliseconds since epoch
    pub ts: u64,
}

/// A tracked insert (`op: {i,p}`) or delete marker (`op: {d,p}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedChange {
    pub id: String,
    pub op: Component,
    pub metadata: ChangeMetadata,
}

/// A comment thread anchored on `op: {c,p,t}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRange {
    pub id: String,
    pub op: Component,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChangeMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<TrackedChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<CommentRange>,
}

impl Ranges {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.comments.is_empty()
    }

    /// JSON-serialised size, the measure `max_ranges_size` applies to.
    pub fn serialized_size(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangesError {
    #[error("deleted content does not match comment content")]
    CommentContentMismatch { comment_id: String },
    #[error("Change {id} doesn't match text")]
    ChangeMismatch { id: String },
    #[error("Comment {id} doesn't match text")]
    CommentMismatch { id: String },
}

/// Who made an edit and whether it is tracked.
#[derive(Debug, Clone, Default)]
pub struct ChangeContext {
    pub user_id: Option<String>,
    pub ts: u64,
    /// Record inserts/deletes as tracked changes
    pub track: bool,
}

impl ChangeContext {
    fn metadata(&self) -> ChangeMetadata {
        ChangeMetadata {
            user_id: self.user_id.clone(),
            ts: self.ts,
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Applies text ops to a set of ranges.
#[derive(Debug, Clone, Default)]
pub struct RangesTracker {
    ranges: Ranges,
}

impl RangesTracker {
    pub fn new(ranges: Ranges) -> Self {
        Self { ranges }
    }

    pub fn ranges(&self) -> &Ranges {
        &self.ranges
    }

    pub fn into_ranges(self) -> Ranges {
        self.ranges
    }

    /// Apply every component of an op. On error the ranges are left unchanged.
    pub fn apply_ops(&mut self, ops: &[Component], ctx: &ChangeContext) -> Result<(), RangesError> {
        let mut working = self.clone();
        for op in ops {
            working.apply_op(op, ctx)?;
        }
        *self = working;
        Ok(())
    }

    fn apply_op(&mut self, op: &Component, ctx: &ChangeContext) -> Result<(), RangesError> {
        match op {
            Component::Insert { text, pos, undo } => {
                self.apply_insert_to_changes(*pos, text, *undo, ctx);
                self.apply_insert_to_comments(*pos, text);
            }
            Component::Delete { text, pos } => {
                self.apply_delete_to_comments(*pos, text)?;
                self.apply_delete_to_changes(*pos, text, ctx);
            }
            Component::Comment { text, pos, thread } => {
                self.add_comment(*pos, text, thread.as_deref(), ctx);
            }
        }
        self.ranges.changes.sort_by_key(|c| c.op.pos());
        Ok(())
    }

    /// Remove accepted changes. Returns how many were removed.
    pub fn accept_changes(&mut self, ids: &[String]) -> usize {
        let before = self.ranges.changes.len();
        self.ranges.changes.retain(|c| !ids.contains(&c.id));
        before - self.ranges.changes.len()
    }

    /// Remove a comment thread. Returns whether it existed.
    pub fn delete_comment(&mut self, id: &str) -> bool {
        let before = self.ranges.comments.len();
        self.ranges.comments.retain(|c| c.id != id);
        before != self.ranges.comments.len()
    }

    /// Check every insert change and comment against the document text.
    pub fn validate(&self, text: &str) -> Result<(), RangesError> {
        for change in &self.ranges.changes {
            if let Component::Insert { text: inserted, pos, .. } = &change.op {
                if slice_chars(text, *pos, pos + char_len(inserted)) != inserted.as_str() {
                    return Err(RangesError::ChangeMismatch { id: change.id.clone() });
                }
            }
        }
        for comment in &self.ranges.comments {
            let c = &comment.op;
            if slice_chars(text, c.pos(), c.pos() + c.len()) != c.text() {
                return Err(RangesError::CommentMismatch { id: comment.id.clone() });
            }
        }
        Ok(())
    }

    // ─── Comments ────────────────────────────────────────────────────

    fn add_comment(&mut self, pos: usize, text: &str, thread: Option<&str>, ctx: &ChangeContext) {
        if let Some(id) = thread {
            if let Some(existing) = self.ranges.comments.iter_mut().find(|c| c.id == id) {
                existing.op = Component::comment(pos, text, Some(id.to_string()));
                return;
            }
        }
        let id = thread.map(str::to_string).unwrap_or_else(new_id);
        self.ranges.comments.push(CommentRange {
            op: Component::comment(pos, text, Some(id.clone())),
            id,
            metadata: Some(ctx.metadata()),
        });
    }

    fn apply_insert_to_comments(&mut self, pos: usize, text: &str) {
        let len = char_len(text);
        for comment in &mut self.ranges.comments {
            let start = comment.op.pos();
            let end = start + comment.op.len();
            if pos <= start {
                *comment.op.pos_mut() += len;
            } else if pos < end {
                let grown = inject(comment.op.text(), pos - start, text);
                *comment.op.text_mut() = grown;
            }
        }
    }

    fn apply_delete_to_comments(&mut self, pos: usize, text: &str) -> Result<(), RangesError> {
        let len = char_len(text);
        let op_end = pos + len;
        for comment in &mut self.ranges.comments {
            let start = comment.op.pos();
            let comment_len = comment.op.len();
            let end = start + comment_len;
            if op_end <= start {
                *comment.op.pos_mut() -= len;
            } else if pos >= end {
                continue;
            } else {
                let ctext = comment.op.text().to_string();
                let before = if pos <= start { "" } else { slice_chars(&ctext, 0, pos - start) };
                let after = if op_end >= end { "" } else { slice_chars(&ctext, op_end - start, comment_len) };

                let removed = slice_chars(&ctext, char_len(before), comment_len - char_len(after));
                let offset = start.saturating_sub(pos);
                let deleted = slice_chars(text, offset, offset + char_len(removed));
                if removed != deleted {
                    return Err(RangesError::CommentContentMismatch {
                        comment_id: comment.id.clone(),
                    });
                }
                let remaining = format!("{before}{after}");
                *comment.op.pos_mut() = start.min(pos);
                *comment.op.text_mut() = remaining;
            }
        }
        Ok(())
    }

    // ─── Tracked changes ─────────────────────────────────────────────

    fn apply_insert_to_changes(&mut self, pos: usize, text: &str, undo: bool, ctx: &ChangeContext) {
        let len = char_len(text);
        let mut already_merged = false;
        let mut split_changes = Vec::new();
        let mut emptied = Vec::new();

        for change in &mut self.ranges.changes {
            let start = change.op.pos();
            match &mut change.op {
                Component::Delete { text: deleted, pos: marker } => {
                    if pos < start {
                        *marker += len;
                    } else if pos == start {
                        if undo && !already_merged && deleted.starts_with(text) {
                            // Restoring the start of a delete cancels that part of it
                            *deleted = slice_chars(deleted, len, char_len(deleted)).to_string();
                            *marker += len;
                            if deleted.is_empty() {
                                emptied.push(change.id.clone());
                            }
                            already_merged = true;
                        } else {
                            *marker += len;
                        }
                    }
                }
                Component::Insert { text: inserted, pos: change_pos, .. } => {
                    let end = start + char_len(inserted);
                    let same_user = ctx.user_id == change.metadata.user_id;
                    if ctx.track && !already_merged && same_user && start <= pos && pos <= end {
                        *inserted = inject(inserted, pos - start, text);
                        already_merged = true;
                    } else if pos <= start {
                        *change_pos += len;
                    } else if pos < end {
                        let offset = pos - start;
                        let tail = slice_chars(inserted, offset, char_len(inserted)).to_string();
                        *inserted = slice_chars(inserted, 0, offset).to_string();
                        split_changes.push(TrackedChange {
                            id: new_id(),
                            op: Component::insert(pos + len, tail),
                            metadata: change.metadata.clone(),
                        });
                    }
                }
                Component::Comment { .. } => {}
            }
        }

        self.ranges.changes.retain(|c| !emptied.contains(&c.id));
        self.ranges.changes.extend(split_changes);

        if ctx.track && !already_merged {
            self.ranges.changes.push(TrackedChange {
                id: new_id(),
                op: Component::insert(pos, text),
                metadata: ctx.metadata(),
            });
        }
    }

    fn apply_delete_to_changes(&mut self, pos: usize, text: &str, ctx: &ChangeContext) {
        let len = char_len(text);
        let op_end = pos + len;
        // Offsets (relative to `pos`) of deleted chars that were tracked inserts
        let mut covered = vec![false; len];
        // Delete markers swallowed by a tracked delete, by relative offset
        let mut swallowed: Vec<(usize, String)> = Vec::new();
        let mut removed_ids = Vec::new();

        for change in &mut self.ranges.changes {
            let start = change.op.pos();
            match &mut change.op {
                Component::Insert { text: inserted, pos: change_pos, .. } => {
                    let end = start + char_len(inserted);
                    if end <= pos {
                        continue;
                    } else if start >= op_end {
                        *change_pos -= len;
                    } else {
                        let overlap_start = start.max(pos);
                        let overlap_end = end.min(op_end);
                        for flag in &mut covered[overlap_start - pos..overlap_end - pos] {
                            *flag = true;
                        }
                        let before = if start < pos { slice_chars(inserted, 0, pos - start) } else { "" };
                        let after = if end > op_end {
                            slice_chars(inserted, op_end - start, end - start)
                        } else {
                            ""
                        };
                        *inserted = format!("{before}{after}");
                        *change_pos = start.min(pos);
                        if inserted.is_empty() {
                            removed_ids.push(change.id.clone());
                        }
                    }
                }
                Component::Delete { text: deleted, pos: marker } => {
                    if ctx.track && pos <= start && start <= op_end {
                        swallowed.push((start - pos, deleted.clone()));
                        removed_ids.push(change.id.clone());
                    } else if start >= op_end {
                        *marker -= len;
                    } else if start > pos {
                        *marker = pos;
                    }
                }
                Component::Comment { .. } => {}
            }
        }

        self.ranges.changes.retain(|c| !removed_ids.contains(&c.id));

        if !ctx.track {
            return;
        }

        swallowed.sort_by_key(|(offset, _)| *offset);
        let mut merged = String::new();
        let mut markers = swallowed.into_iter().peekable();
        for (i, ch) in text.chars().enumerate() {
            while let Some((_, marker_text)) = markers.next_if(|(offset, _)| *offset <= i) {
                merged.push_str(&marker_text);
            }
            if !covered[i] {
                merged.push(ch);
            }
        }
        for (_, marker_text) in markers {
            merged.push_str(&marker_text);
        }

        if !merged.is_empty() {
            self.ranges.changes.push(TrackedChange {
                id: new_id(),
                op: Component::delete(pos, merged),
                metadata: ctx.metadata(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn untracked() -> ChangeContext {
        ChangeContext {
            user_id: Some("user-1".into()),
            ts: 1,
            track: false,
        }
    }

    fn tracked(user: &str) -> ChangeContext {
        ChangeContext {
            user_id: Some(user.into()),
            ts: 2,
            track: true,
        }
    }

    fn with_comment(pos: usize, text: &str) -> RangesTracker {
        let mut tracker = RangesTracker::default();
        tracker
            .apply_ops(&[Component::comment(pos, text, Some("thread-1".into()))], &untracked())
            .unwrap();
        tracker
    }

    fn change_ops(tracker: &RangesTracker) -> Vec<Component> {
        tracker.ranges().changes.iter().map(|c| c.op.clone()).collect()
    }

    // ─── Comments ────────────────────────────────────────────────────

    #[test]
    fn test_comment_added_with_thread_id() {
        let tracker = with_comment(3, "foo");
        assert_eq!(tracker.ranges().comments.len(), 1);
        assert_eq!(tracker.ranges().comments[0].id, "thread-1");
    }

    #[test]
    fn test_insert_moves_and_grows_comment() {
        let mut tracker = with_comment(3, "foo");
        tracker.apply_ops(&[Component::insert(0, "ab")], &untracked()).unwrap();
        assert_eq!(tracker.ranges().comments[0].op.pos(), 5);

        tracker.apply_ops(&[Component::insert(6, "XY")], &untracked()).unwrap();
        assert_eq!(tracker.ranges().comments[0].op.text(), "fXYoo");

        // Right edge: unchanged
        tracker.apply_ops(&[Component::insert(10, "!")], &untracked()).unwrap();
        assert_eq!(tracker.ranges().comments[0].op.text(), "fXYoo");
    }

    #[test]
    fn test_delete_trims_comment() {
        // "12foobar" with comment on "foobar"
        let mut tracker = with_comment(2, "foobar");
        tracker.apply_ops(&[Component::delete(1, "2fo")], &untracked()).unwrap();
        let comment = &tracker.ranges().comments[0].op;
        assert_eq!(comment.pos(), 1);
        assert_eq!(comment.text(), "obar");
    }

    #[test]
    fn test_delete_before_comment_shifts() {
        let mut tracker = with_comment(5, "foo");
        tracker.apply_ops(&[Component::delete(0, "abc")], &untracked()).unwrap();
        assert_eq!(tracker.ranges().comments[0].op.pos(), 2);
    }

    #[test]
    fn test_delete_mismatching_comment_rejected() {
        let mut tracker = with_comment(2, "foo");
        let before = tracker.ranges().clone();
        let result = tracker.apply_ops(&[Component::delete(2, "bar")], &untracked());
        assert!(matches!(result, Err(RangesError::CommentContentMismatch { .. })));
        assert_eq!(tracker.ranges(), &before);
    }

    #[test]
    fn test_delete_comment() {
        let mut tracker = with_comment(2, "foo");
        assert!(tracker.delete_comment("thread-1"));
        assert!(!tracker.delete_comment("thread-1"));
        assert!(tracker.ranges().is_empty());
    }

    // ─── Tracked inserts ─────────────────────────────────────────────

    #[test]
    fn test_tracked_insert_creates_change() {
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::insert(3, "foo")], &tracked("alice")).unwrap();
        assert_eq!(change_ops(&tracker), vec![Component::insert(3, "foo")]);
        assert_eq!(tracker.ranges().changes[0].metadata.user_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_untracked_insert_creates_nothing() {
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::insert(3, "foo")], &untracked()).unwrap();
        assert!(tracker.ranges().is_empty());
    }

    #[test]
    fn test_same_user_inserts_merge() {
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::insert(3, "foo")], &tracked("alice")).unwrap();
        tracker.apply_ops(&[Component::insert(6, "bar")], &tracked("alice")).unwrap();
        assert_eq!(change_ops(&tracker), vec![Component::insert(3, "foobar")]);
    }

    #[test]
    fn test_other_user_insert_splits() {
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::insert(3, "foobar")], &tracked("alice")).unwrap();
        tracker.apply_ops(&[Component::insert(6, "XY")], &tracked("bob")).unwrap();
        assert_eq!(
            change_ops(&tracker),
            vec![
                Component::insert(3, "foo"),
                Component::insert(6, "XY"),
                Component::insert(8, "bar"),
            ]
        );
    }

    #[test]
    fn test_untracked_insert_inside_change_splits() {
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::insert(0, "abcd")], &tracked("alice")).unwrap();
        tracker.apply_ops(&[Component::insert(2, "__")], &untracked()).unwrap();
        assert_eq!(
            change_ops(&tracker),
            vec![Component::insert(0, "ab"), Component::insert(4, "cd")]
        );
    }

    // ─── Tracked deletes ─────────────────────────────────────────────

    #[test]
    fn test_tracked_delete_creates_marker() {
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::delete(2, "foo")], &tracked("alice")).unwrap();
        assert_eq!(change_ops(&tracker), vec![Component::delete(2, "foo")]);
    }

    #[test]
    fn test_deleting_tracked_insert_leaves_no_marker() {
        // "abdefghijkl" with 'de' tracked as inserted
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::insert(2, "de")], &tracked("alice")).unwrap();
        tracker.apply_ops(&[Component::delete(2, "de")], &tracked("alice")).unwrap();
        assert!(tracker.ranges().changes.is_empty());
    }

    #[test]
    fn test_delete_over_insert_and_regular_text() {
        // "abcdefghijkl" with 'bcdefg' inserted; deleting 'fghi'
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::insert(1, "bcdefg")], &tracked("alice")).unwrap();
        tracker.apply_ops(&[Component::delete(5, "fghi")], &tracked("alice")).unwrap();
        assert_eq!(
            change_ops(&tracker),
            vec![Component::insert(1, "bcde"), Component::delete(5, "hi")]
        );
    }

    #[test]
    fn test_overlapping_deletes_merge() {
        // "abcghijkl" with 'def' already deleted at 3; deleting 'bcg'
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::delete(3, "def")], &tracked("alice")).unwrap();
        tracker.apply_ops(&[Component::delete(1, "bcg")], &tracked("bob")).unwrap();
        assert_eq!(change_ops(&tracker), vec![Component::delete(1, "bcdefg")]);
        assert_eq!(tracker.ranges().changes[0].metadata.user_id.as_deref(), Some("bob"));
    }

    #[test]
    fn test_insert_at_delete_marker_goes_left() {
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::delete(3, "bar")], &tracked("alice")).unwrap();
        tracker.apply_ops(&[Component::insert(3, "baz")], &untracked()).unwrap();
        assert_eq!(change_ops(&tracker), vec![Component::delete(6, "bar")]);
    }

    #[test]
    fn test_undo_insert_cancels_delete() {
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::delete(3, "bar")], &tracked("alice")).unwrap();
        let undo = Component::Insert {
            text: "bar".into(),
            pos: 3,
            undo: true,
        };
        tracker.apply_ops(&[undo], &untracked()).unwrap();
        assert!(tracker.ranges().changes.is_empty());
    }

    #[test]
    fn test_untracked_delete_moves_markers() {
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::delete(8, "x")], &tracked("alice")).unwrap();
        tracker.apply_ops(&[Component::delete(2, "abc")], &untracked()).unwrap();
        assert_eq!(change_ops(&tracker), vec![Component::delete(5, "x")]);
    }

    // ─── Accept / validate ───────────────────────────────────────────

    #[test]
    fn test_accept_changes() {
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::insert(0, "foo")], &tracked("alice")).unwrap();
        tracker.apply_ops(&[Component::delete(10, "bar")], &tracked("alice")).unwrap();
        let ids: Vec<String> = tracker.ranges().changes.iter().map(|c| c.id.clone()).collect();
        assert_eq!(tracker.accept_changes(&ids[..1]), 1);
        assert_eq!(tracker.ranges().changes.len(), 1);
        assert_eq!(tracker.accept_changes(&["missing".to_string()]), 0);
    }

    #[test]
    fn test_validate_against_text() {
        let mut tracker = RangesTracker::default();
        tracker.apply_ops(&[Component::insert(4, "two")], &tracked("alice")).unwrap();
        tracker
            .apply_ops(&[Component::comment(0, "one", Some("t".into()))], &untracked())
            .unwrap();
        assert!(tracker.validate("one two").is_ok());
        assert!(matches!(
            tracker.validate("one 2wo"),
            Err(RangesError::ChangeMismatch { .. })
        ));
    }

    #[test]
    fn test_ranges_serialized_shape() {
        let mut tracker = RangesTracker::default();
        tracker
            .apply_ops(&[Component::comment(1, "b", Some("t1".into()))], &untracked())
            .unwrap();
        let json = serde_json::to_value(tracker.ranges()).unwrap();
        assert_eq!(json["comments"][0]["op"]["c"], "b");
        assert_eq!(json["comments"][0]["op"]["t"], "t1");
        assert!(json.get("changes").is_none());
        assert_eq!(Ranges::default().serialized_size(), 0);
    }
}
