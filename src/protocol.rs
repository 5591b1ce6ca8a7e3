//! Cross-task message protocol.
//!
//! Requests and replies cross the worker boundary as JSON-serializable
//! messages correlated by id. Errors travel as a typed envelope so the kind
//! survives serialization instead of being inferred from message text;
//! backtraces do not cross the boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;
use crate::model::RequestOptions;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A request message sent to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    #[serde(flatten)]
    pub command: Command,
}

/// Operations the executor understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Command {
    Fetch {
        endpoint: String,
        #[serde(default)]
        options: RequestOptions,
    },
    LoadBatch(Vec<String>),
    LoadOne(String),
    Abort {
        endpoint: String,
        #[serde(default)]
        options: RequestOptions,
    },
}

impl Command {
    pub fn response_kind(&self) -> ReplyKind {
        match self {
            Command::Fetch { .. } => ReplyKind::FetchResponse,
            Command::LoadBatch(_) => ReplyKind::LoadBatchResponse,
            Command::LoadOne(_) => ReplyKind::LoadOneResponse,
            Command::Abort { .. } => ReplyKind::AbortResponse,
        }
    }

    pub fn error_kind(&self) -> ReplyKind {
        match self {
            Command::Fetch { .. } => ReplyKind::FetchError,
            Command::LoadBatch(_) => ReplyKind::LoadBatchError,
            Command::LoadOne(_) => ReplyKind::LoadOneError,
            Command::Abort { .. } => ReplyKind::AbortError,
        }
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// A reply message from the executor, correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ReplyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyKind {
    FetchResponse,
    FetchError,
    LoadBatchResponse,
    LoadBatchError,
    LoadOneResponse,
    LoadOneError,
    AbortResponse,
    AbortError,
    /// Protocol-level failure for messages that could not be decoded at all.
    Error,
}

impl Reply {
    pub fn success(id: Uuid, kind: ReplyKind, data: Value) -> Self {
        Self {
            id,
            kind,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: Uuid, kind: ReplyKind, error: &Error) -> Self {
        Self {
            id,
            kind,
            data: None,
            error: Some(ErrorEnvelope::from(error)),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// Serializable error carrier. `kind` round-trips to the same [`Error`]
/// variant on the other side; `cause` is informational context that does not
/// participate in rehydration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl From<&Error> for ErrorEnvelope {
    fn from(error: &Error) -> Self {
        let (message, cause) = match error {
            Error::Network { status, message } => (
                message.clone(),
                status.map(|code| format!("status {code}")),
            ),
            Error::Timeout(ms) => (ms.to_string(), None),
            Error::Aborted => ("request aborted".to_string(), None),
            Error::Protocol(m) | Error::Config(m) | Error::Other(m) => (m.clone(), None),
            Error::Capacity(n) => (n.to_string(), None),
            Error::UnknownKey(key) => (key.clone(), None),
        };
        Self {
            kind: error.kind().to_string(),
            message,
            cause,
        }
    }
}

impl ErrorEnvelope {
    /// Rehydrate the typed error this envelope was built from.
    pub fn into_error(self) -> Error {
        match self.kind.as_str() {
            "network" => Error::Network {
                status: None,
                message: self.message,
            },
            "timeout" => Error::Timeout(self.message.parse().unwrap_or(0)),
            "abort" => Error::Aborted,
            "protocol" => Error::Protocol(self.message),
            "capacity" => Error::Capacity(self.message.parse().unwrap_or(0)),
            "unknown_key" => Error::UnknownKey(self.message),
            "config" => Error::Config(self.message),
            _ => Error::Other(self.message),
        }
    }
}
