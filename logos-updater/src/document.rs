//! Cached document state.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ranges::Ranges;

/// A hot document as held by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub project_id: Uuid,
    pub doc_id: Uuid,
    pub lines: Vec<String>,
    /// Number of ops applied since creation
    pub version: u64,
    pub ranges: Ranges,
    /// SHA-256 of the JSON-serialised lines
    pub content_hash: String,
    pub pathname: String,
    pub project_history_id: Option<String>,
    /// When the doc first diverged from the versioned store (ms since epoch)
    pub unflushed_since: Option<u64>,
    pub last_updated_at: Option<u64>,
    pub last_updated_by: Option<String>,
}

impl Document {
    /// Newline-joined content, the string ops are addressed against.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Length of the content in characters.
    pub fn text_len(&self) -> usize {
        text_len(&self.lines)
    }

    pub fn is_dirty(&self) -> bool {
        self.unflushed_since.is_some()
    }

    pub fn view(&self) -> DocumentView {
        DocumentView {
            lines: self.lines.clone(),
            version: self.version,
            ranges: self.ranges.clone(),
            pathname: self.pathname.clone(),
            project_history_id: self.project_history_id.clone(),
            unflushed_since: self.unflushed_since,
            last_updated_at: self.last_updated_at,
            last_updated_by: self.last_updated_by.clone(),
        }
    }
}

/// Read-only snapshot returned to callers of `get_doc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentView {
    pub lines: Vec<String>,
    pub version: u64,
    pub ranges: Ranges,
    pub pathname: String,
    #[serde(rename = "projectHistoryId")]
    pub project_history_id: Option<String>,
    #[serde(skip)]
    pub unflushed_since: Option<u64>,
    #[serde(rename = "lastUpdatedAt")]
    pub last_updated_at: Option<u64>,
    #[serde(rename = "lastUpdatedBy")]
    pub last_updated_by: Option<String>,
}

/// Hex SHA-256 of the JSON-serialised lines.
pub fn content_hash(lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lines_json(lines).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// JSON-serialised length of the lines, the measure `max_doc_length` applies to.
pub fn serialized_length(lines: &[String]) -> usize {
    lines_json(lines).len()
}

fn lines_json(lines: &[String]) -> String {
    serde_json::to_string(lines).unwrap_or_default()
}

/// Length of `lines` joined with newlines, in characters.
pub fn text_len(lines: &[String]) -> usize {
    let chars: usize = lines.iter().map(|l| l.chars().count()).sum();
    chars + lines.len().saturating_sub(1)
}

/// Split newline-joined content back into lines.
pub fn split_lines(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_content_hash_stable() {
        let a = content_hash(&lines(&["one", "two"]));
        let b = content_hash(&lines(&["one", "two"]));
        let c = content_hash(&lines(&["one", "two", ""]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_text_len_counts_newlines() {
        assert_eq!(text_len(&lines(&["one", "two", "three"])), 13);
        assert_eq!(text_len(&lines(&[""])), 0);
        assert_eq!(text_len(&[]), 0);
    }

    #[test]
    fn test_split_lines_roundtrip() {
        let original = lines(&["a", "", "b"]);
        assert_eq!(split_lines(&original.join("\n")), original);
        assert_eq!(split_lines(""), lines(&[""]));
    }

    #[test]
    fn test_serialized_length() {
        assert_eq!(serialized_length(&lines(&["ab"])), r#"["ab"]"#.len());
    }
}
