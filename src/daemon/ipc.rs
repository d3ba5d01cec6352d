//! Wire protocol: newline-delimited JSON over a Unix socket.
//!
//! Request lines are an envelope carrying the logical path (what the
//! AuthGate classifies), optional headers and query parameters, and an
//! op-tagged body. Responses are `{"ok": ...}` or `{"err": {...}}` lines.
//! Once a connection upgrades to streaming, subsequent lines are plain
//! `StreamEvent` documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ApplyResult, ChangeSet, Itinerary};
use crate::error::{Effect, Transience};

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("request parse error: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("response encode error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("connection io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    pub fn transience(&self) -> Transience {
        match self {
            IpcError::Io(_) => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

/// One request line. `path` drives the AuthGate; `body` names the op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    pub body: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Apply a changeset to an itinerary.
    ApplyChanges {
        itinerary: String,
        changes: ChangeSet,
    },

    /// Replay the recorded inverse of a previously applied batch.
    Undo { itinerary: String, batch_id: String },

    /// Stateless snapshot read; the polling fallback when streaming is
    /// unavailable.
    GetItinerary { itinerary: String },

    /// Upgrade this connection to a long-lived event stream.
    Subscribe { itinerary: String },

    /// Stop the daemon.
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePayload {
    Applied(ApplyResult),
    Itinerary(Box<Itinerary>),
    Subscribed { itinerary: String, subject: String },
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(ResponsePayload),
    Err(ErrorBody),
}

impl Response {
    pub fn ok(payload: ResponsePayload) -> Self {
        Response::Ok(payload)
    }

    pub fn err(code: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Err(ErrorBody {
            code: code.into(),
            message: message.into(),
        })
    }
}

/// Stable error codes exposed on the wire.
pub mod codes {
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const OWNER_IMMUTABLE: &str = "owner_immutable";
    pub const UNKNOWN_BATCH: &str = "unknown_batch";
    pub const AUTH_REJECTED: &str = "auth_rejected";
    pub const OVERLOADED: &str = "overloaded";
    pub const PARSE_ERROR: &str = "parse_error";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const INTERNAL: &str = "internal";
}

pub fn decode_request(line: &str) -> Result<RequestEnvelope, IpcError> {
    serde_json::from_str(line).map_err(IpcError::Decode)
}

pub fn encode_response(response: &Response) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(response).map_err(IpcError::Encode)?;
    line.push('\n');
    Ok(line)
}

pub fn encode_request(envelope: &RequestEnvelope) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(envelope).map_err(IpcError::Encode)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_response(line: &str) -> Result<Response, IpcError> {
    serde_json::from_str(line).map_err(IpcError::Decode)
}
