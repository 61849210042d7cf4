//! Client updates as submitted to the sequencer and recorded in the op log.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::ot::Component;

/// Metadata carried with an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Connection/client that produced the op (used for dup detection)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Milliseconds since epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    /// Track-changes id; when set, the op is recorded as a tracked change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tc: Option<String>,
    /// Origin of the update, e.g. "external" for whole-document replacements
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Doc path at the time of the op (added for project history)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    /// Doc length before the op (added for project history)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_length: Option<usize>,
}

/// A text update against a specific document version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Doc the update targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Uuid>,
    pub op: Vec<Component>,
    /// Version the op was generated against
    pub v: u64,
    #[serde(default)]
    pub meta: UpdateMeta,
    /// Sources for which an identical already-applied op marks this one a duplicate
    #[serde(default, rename = "dupIfSource", skip_serializing_if = "Vec::is_empty")]
    pub dup_if_source: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dup: bool,
    #[serde(default, rename = "projectHistoryId", skip_serializing_if = "Option::is_none")]
    pub project_history_id: Option<String>,
}

impl Update {
    pub fn new(op: Vec<Component>, v: u64) -> Self {
        Self {
            doc: None,
            op,
            v,
            meta: UpdateMeta::default(),
            dup_if_source: Vec::new(),
            dup: false,
            project_history_id: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.meta.source = Some(source.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.meta.user_id = Some(user_id.into());
        self
    }

    pub fn with_dup_if_source(mut self, sources: Vec<String>) -> Self {
        self.dup_if_source = sources;
        self
    }

    pub fn tracked(mut self, tc: impl Into<String>) -> Self {
        self.meta.tc = Some(tc.into());
        self
    }

    /// Replace characters outside the Basic Multilingual Plane with U+FFFD.
    ///
    /// Browser clients count offsets in UTF-16 units; a character that needs a
    /// surrogate pair would otherwise shift every later offset by one.
    pub fn sanitize(&mut self) {
        for component in &mut self.op {
            let text = component.text_mut();
            if text.chars().any(|c| (c as u32) > 0xFFFF) {
                *text = text
                    .chars()
                    .map(|c| if (c as u32) > 0xFFFF { '\u{FFFD}' } else { c })
                    .collect();
            }
        }
    }

    /// Net change in document length once the op is applied.
    pub fn length_delta(&self) -> isize {
        self.op
            .iter()
            .map(|c| match c {
                Component::Insert { .. } => c.len() as isize,
                Component::Delete { .. } => -(c.len() as isize),
                Component::Comment { .. } => 0,
            })
            .sum()
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
