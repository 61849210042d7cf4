//! JSON wire protocol for the WebSocket gateway.
//!
//! Every frame is a text message holding one JSON object tagged by `type`:
//! ```text
//! client ──► server                      server ──► client
//! ─────────────────                      ─────────────────
//! joinDoc     {projectId, docId,         joined  {docId, doc, ops}
//!              fromVersion?}             ack     {docId, version, dup}
//! applyUpdate {projectId, docId, update} event   {event}   (applied-ops fan-out)
//! leaveDoc    {projectId, docId}         left    {docId}
//! ping        {}                         error   {status, message}
//!                                        pong    {}
//! ```
//!
//! Ops use the ShareJS component shapes (`{i,p}`, `{d,p}`, `{c,p,t}`).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::broadcast::UpdaterEvent;
use crate::document::DocumentView;
use crate::error::UpdaterError;
use crate::update::Update;

/// Messages sent by a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a doc's room; `from_version` asks for the ops applied since.
    JoinDoc {
        project_id: Uuid,
        doc_id: Uuid,
        #[serde(default)]
        from_version: Option<u64>,
    },
    ApplyUpdate {
        project_id: Uuid,
        doc_id: Uuid,
        update: Update,
    },
    LeaveDoc { project_id: Uuid, doc_id: Uuid },
    Ping,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Joined {
        doc_id: Uuid,
        doc: DocumentView,
        ops: Vec<Update>,
    },
    /// The sender's own update was applied at `version`.
    Ack { doc_id: Uuid, version: u64, dup: bool },
    Left { doc_id: Uuid },
    Event { event: UpdaterEvent },
    Error { status: u16, message: String },
    Pong,
}

impl ServerMessage {
    pub fn error(err: &UpdaterError) -> Self {
        ServerMessage::Error {
            status: err.status_code(),
            message: err.to_string(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}
