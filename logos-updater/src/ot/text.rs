//! ShareJS-compatible text type: `apply`, `transform`, `compose`.
//!
//! Offsets count Unicode scalar values. Updates are sanitised before they reach
//! this module so that every character is a single UTF-16 unit, which keeps
//! offsets identical to the ones computed by browser clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One step of a text op.
///
/// Serialised in the ShareJS wire format: `{i,p}`, `{d,p}`, `{c,p,t}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Component {
    Insert {
        #[serde(rename = "i")]
        text: String,
        #[serde(rename = "p")]
        pos: usize,
        /// Set when the insert restores previously deleted text
        #[serde(rename = "u", default, skip_serializing_if = "is_false")]
        undo: bool,
    },
    Delete {
        #[serde(rename = "d")]
        text: String,
        #[serde(rename = "p")]
        pos: usize,
    },
    Comment {
        #[serde(rename = "c")]
        text: String,
        #[serde(rename = "p")]
        pos: usize,
        #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// An ordered list of components.
pub type Op = Vec<Component>;

/// Which op wins a tie when two inserts land on the same offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Text OT errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    #[error("Delete component does not match")]
    DeleteMismatch { expected: String, found: String },
    #[error("Comment component does not match")]
    CommentMismatch { expected: String, found: String },
    #[error("Delete ops delete different text in the same region of the document")]
    DeleteConflict,
    #[error("Position {pos} is outside the document (length {len})")]
    InvalidPosition { pos: usize, len: usize },
}

impl Component {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Component::Insert {
            text: text.into(),
            pos,
            undo: false,
        }
    }

    pub fn delete(pos: usize, text: impl Into<String>) -> Self {
        Component::Delete {
            text: text.into(),
            pos,
        }
    }

    pub fn comment(pos: usize, text: impl Into<String>, thread: Option<String>) -> Self {
        Component::Comment {
            text: text.into(),
            pos,
            thread,
        }
    }

    pub fn pos(&self) -> usize {
        match self {
            Component::Insert { pos, .. }
            | Component::Delete { pos, .. }
            | Component::Comment { pos, .. } => *pos,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Component::Insert { text, .. }
            | Component::Delete { text, .. }
            | Component::Comment { text, .. } => text,
        }
    }

    /// Length of the component text in characters.
    pub fn len(&self) -> usize {
        char_len(self.text())
    }

    pub fn is_empty(&self) -> bool {
        self.text().is_empty()
    }

    fn is_noop(&self) -> bool {
        match self {
            Component::Insert { text, .. } | Component::Delete { text, .. } => text.is_empty(),
            Component::Comment { .. } => false,
        }
    }

    pub(crate) fn pos_mut(&mut self) -> &mut usize {
        match self {
            Component::Insert { pos, .. }
            | Component::Delete { pos, .. }
            | Component::Comment { pos, .. } => pos,
        }
    }

    pub(crate) fn text_mut(&mut self) -> &mut String {
        match self {
            Component::Insert { text, .. }
            | Component::Delete { text, .. }
            | Component::Comment { text, .. } => text,
        }
    }
}

// ─── String helpers ──────────────────────────────────────────────────

pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of character `pos`, or `None` past the end.
fn byte_offset(s: &str, pos: usize) -> Option<usize> {
    s.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(s.len()))
        .nth(pos)
}

/// Characters `start..end` of `s`, clamped to its length.
pub(crate) fn slice_chars(s: &str, start: usize, end: usize) -> &str {
    let from = byte_offset(s, start).unwrap_or(s.len());
    let to = byte_offset(s, end).unwrap_or(s.len()).max(from);
    &s[from..to]
}

/// `s` with `insert` spliced in at character `pos`.
pub(crate) fn inject(s: &str, pos: usize, insert: &str) -> String {
    let at = byte_offset(s, pos).unwrap_or(s.len());
    let mut out = String::with_capacity(s.len() + insert.len());
    out.push_str(&s[..at]);
    out.push_str(insert);
    out.push_str(&s[at..]);
    out
}

// ─── Apply ───────────────────────────────────────────────────────────

/// Apply `op` to `snapshot`.
///
/// Deletes and comments must match the text they cover; a mismatch means the
/// op was generated against different content and is rejected.
pub fn apply(snapshot: &str, op: &[Component]) -> Result<String, OtError> {
    let mut doc = snapshot.to_string();
    for component in op {
        let start = byte_offset(&doc, component.pos()).ok_or(OtError::InvalidPosition {
            pos: component.pos(),
            len: char_len(&doc),
        })?;
        match component {
            Component::Insert { text, .. } => doc.insert_str(start, text),
            Component::Delete { text, .. } => {
                let found_len = {
                    let found = slice_chars(&doc[start..], 0, char_len(text));
                    if found != text.as_str() {
                        return Err(OtError::DeleteMismatch {
                            expected: text.clone(),
                            found: found.to_string(),
                        });
                    }
                    found.len()
                };
                doc.replace_range(start..start + found_len, "");
            }
            Component::Comment { text, .. } => {
                let found = slice_chars(&doc[start..], 0, char_len(text));
                if found != text.as_str() {
                    return Err(OtError::CommentMismatch {
                        expected: text.clone(),
                        found: found.to_string(),
                    });
                }
            }
        }
    }
    Ok(doc)
}

// ─── Transform ───────────────────────────────────────────────────────

/// Where `pos` ends up once `other` has been applied.
pub fn transform_position(pos: usize, other: &Component, insert_after: bool) -> usize {
    match other {
        Component::Insert { text, pos: p, .. } => {
            if *p < pos || (*p == pos && insert_after) {
                pos + char_len(text)
            } else {
                pos
            }
        }
        Component::Delete { text, pos: p } => {
            if pos <= *p {
                pos
            } else if pos <= p + char_len(text) {
                *p
            } else {
                pos - char_len(text)
            }
        }
        Component::Comment { .. } => pos,
    }
}

/// Push `c` onto `op`, merging it into the last component when contiguous.
fn append(op: &mut Op, c: Component) {
    if c.is_noop() {
        return;
    }
    if let Some(last) = op.last_mut() {
        let merged = match (&*last, &c) {
            (
                Component::Insert { text: lt, pos: lp, undo: lu },
                Component::Insert { text: ct, pos: cp, undo: cu },
            ) if lp <= cp && *cp <= lp + char_len(lt) && lu == cu => Some(Component::Insert {
                text: inject(lt, cp - lp, ct),
                pos: *lp,
                undo: *lu,
            }),
            (Component::Delete { text: lt, pos: lp }, Component::Delete { text: ct, pos: cp })
                if cp <= lp && *lp <= cp + char_len(ct) =>
            {
                Some(Component::Delete {
                    text: inject(ct, lp - cp, lt),
                    pos: *cp,
                })
            }
            _ => None,
        };
        if let Some(m) = merged {
            *last = m;
            return;
        }
    }
    op.push(c);
}

/// Text of `c` (at `cp`) that survives deletion of `other` (at `op`).
///
/// Fails when both cover the same region with different text.
fn remove_overlap(text: &str, cp: usize, other: &str, opos: usize) -> Result<String, OtError> {
    let clen = char_len(text);
    let olen = char_len(other);
    let mut remaining = String::new();
    if cp < opos {
        remaining.push_str(slice_chars(text, 0, opos - cp));
    }
    if cp + clen > opos + olen {
        remaining.push_str(slice_chars(text, opos + olen - cp, clen));
    }

    let start = cp.max(opos);
    let end = (cp + clen).min(opos + olen);
    let mine = slice_chars(text, start - cp, end - cp);
    let theirs = slice_chars(other, start - opos, end - opos);
    if mine != theirs {
        return Err(OtError::DeleteConflict);
    }
    Ok(remaining)
}

fn transform_component(
    dest: &mut Op,
    c: &Component,
    other: &Component,
    side: Side,
) -> Result<(), OtError> {
    match c {
        Component::Insert { text, pos, undo } => {
            append(
                dest,
                Component::Insert {
                    text: text.clone(),
                    pos: transform_position(*pos, other, side == Side::Right),
                    undo: *undo,
                },
            );
        }

        Component::Delete { text, pos } => match other {
            Component::Insert { text: inserted, pos: ipos, .. } => {
                let mut remaining: &str = text;
                if pos < ipos {
                    let split = ipos - pos;
                    append(dest, Component::delete(*pos, slice_chars(text, 0, split)));
                    remaining = slice_chars(text, split, char_len(text));
                }
                if !remaining.is_empty() {
                    append(dest, Component::delete(pos + char_len(inserted), remaining));
                }
            }
            Component::Delete { text: deleted, pos: dpos } => {
                let dlen = char_len(deleted);
                if *pos >= dpos + dlen {
                    append(dest, Component::delete(pos - dlen, text.clone()));
                } else if pos + char_len(text) <= *dpos {
                    append(dest, c.clone());
                } else {
                    let remaining = remove_overlap(text, *pos, deleted, *dpos)?;
                    if !remaining.is_empty() {
                        let new_pos = transform_position(*pos, other, false);
                        append(dest, Component::delete(new_pos, remaining));
                    }
                }
            }
            Component::Comment { .. } => append(dest, c.clone()),
        },

        Component::Comment { text, pos, thread } => match other {
            Component::Insert { text: inserted, pos: ipos, .. } => {
                if pos < ipos && *ipos < pos + char_len(text) {
                    append(
                        dest,
                        Component::comment(*pos, inject(text, ipos - pos, inserted), thread.clone()),
                    );
                } else {
                    let new_pos = transform_position(*pos, other, true);
                    append(dest, Component::comment(new_pos, text.clone(), thread.clone()));
                }
            }
            Component::Delete { text: deleted, pos: dpos } => {
                let dlen = char_len(deleted);
                if *pos >= dpos + dlen {
                    append(dest, Component::comment(pos - dlen, text.clone(), thread.clone()));
                } else if pos + char_len(text) <= *dpos {
                    append(dest, c.clone());
                } else {
                    let remaining = remove_overlap(text, *pos, deleted, *dpos)?;
                    let new_pos = transform_position(*pos, other, false);
                    append(dest, Component::comment(new_pos, remaining, thread.clone()));
                }
            }
            Component::Comment { .. } => append(dest, c.clone()),
        },
    }
    Ok(())
}

/// Transform `left` and `right`, both based on the same document, so that
/// `apply(apply(s, left), right') == apply(apply(s, right), left')`.
pub fn transform_x(mut left: Op, right: Op) -> Result<(Op, Op), OtError> {
    let mut new_right = Op::new();
    for component in right {
        let mut new_left = Op::new();
        let mut current = Some(component);
        let mut k = 0;
        while let Some(rc) = current.take() {
            if k >= left.len() {
                current = Some(rc);
                break;
            }
            let mut next = Op::new();
            transform_component(&mut new_left, &left[k], &rc, Side::Left)?;
            transform_component(&mut next, &rc, &left[k], Side::Right)?;
            k += 1;

            match next.len() {
                1 => current = next.pop(),
                0 => {
                    for l in &left[k..] {
                        append(&mut new_left, l.clone());
                    }
                }
                _ => {
                    let (l, r) = transform_x(left[k..].to_vec(), next)?;
                    for c in l {
                        append(&mut new_left, c);
                    }
                    for c in r {
                        append(&mut new_right, c);
                    }
                }
            }
        }
        if let Some(rc) = current {
            append(&mut new_right, rc);
        }
        left = new_left;
    }
    Ok((left, new_right))
}

/// Rewrite `op` so it applies after `other`. Both must share a base document.
pub fn transform(op: &[Component], other: &[Component], side: Side) -> Result<Op, OtError> {
    if other.is_empty() {
        return Ok(op.to_vec());
    }
    if op.len() == 1 && other.len() == 1 {
        let mut dest = Op::new();
        transform_component(&mut dest, &op[0], &other[0], side)?;
        return Ok(dest);
    }
    match side {
        Side::Left => Ok(transform_x(op.to_vec(), other.to_vec())?.0),
        Side::Right => Ok(transform_x(other.to_vec(), op.to_vec())?.1),
    }
}

/// Concatenate two sequential ops into one.
pub fn compose(first: &[Component], second: &[Component]) -> Op {
    let mut op = first.to_vec();
    for c in second {
        append(&mut op, c.clone());
    }
    op
}
