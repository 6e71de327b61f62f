//! The wire message union and the structured remote-error value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One wire message. Serialized as a JSON object with a `kind` discriminator.
///
/// Correlation ids pair a `Request` with its eventual `Response` (and any
/// `Cancel`) on one connection. Ids are allocated by the sender of the
/// `Request` and are unique for that connection's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Message {
    /// Invoke `method` on the named `endpoint` of the peer.
    Request {
        id: u32,
        endpoint: String,
        method: String,
        #[serde(default)]
        args: Value,
        /// Remaining call budget in milliseconds, if the caller has one.
        #[serde(rename = "timeoutMs", default)]
        timeout_ms: Option<u32>,
    },
    /// The outcome of the request with the same `id`: exactly one of
    /// `result` or `error` is meaningful.
    Response {
        id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default)]
        error: Option<WireError>,
    },
    /// Best-effort request to abandon the request with the same `id`.
    /// The receiver may still send a Response; the sender no longer cares.
    Cancel { id: u32 },
}

impl Message {
    /// The correlation id this message refers to.
    pub fn id(&self) -> u32 {
        match self {
            Message::Request { id, .. } => *id,
            Message::Response { id, .. } => *id,
            Message::Cancel { id } => *id,
        }
    }
}

/// A structured error carried back in a Response frame.
///
/// `kind` is a stable, machine-matchable error type name (serialized as
/// `type` on the wire); `message` is for humans; `stack` is an optional
/// peer-side backtrace, carried verbatim and never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl WireError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for WireError {}
