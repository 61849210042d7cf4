//! Whole-document replacement expressed as a text op.

use crate::ot::{Component, Op};

/// Op turning `old` into `new`: one delete and one insert at the first
/// differing offset, with the common prefix and suffix left untouched.
///
/// Returns an empty op when the texts are equal.
pub fn diff_as_op(old: &str, new: &str) -> Op {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let deleted: String = old_chars[prefix..old_chars.len() - suffix].iter().collect();
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    let mut op = Op::new();
    if !deleted.is_empty() {
        op.push(Component::delete(prefix, deleted));
    }
    if !inserted.is_empty() {
        op.push(Component::insert(prefix, inserted));
    }
    op
}
