//! Error types for fetchq.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Transport failure or non-success HTTP status.
    #[error("network error: {message}")]
    Network {
        status: Option<u16>,
        message: String,
    },

    /// The per-request timeout fired while the future was still pending.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// The request was cancelled before a reply arrived.
    #[error("request aborted")]
    Aborted,

    /// A cross-task message was malformed or of an unknown type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The future registry refused to grow past its configured bound.
    #[error("future registry at capacity ({0} outstanding)")]
    Capacity(usize),

    /// Resolve or reject addressed a key with no registered future.
    #[error("no future registered for key \"{0}\"")]
    UnknownKey(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable tag identifying the error variant. This is what survives the
    /// worker boundary when an error is flattened into a wire envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Network { .. } => "network",
            Error::Timeout(_) => "timeout",
            Error::Aborted => "abort",
            Error::Protocol(_) => "protocol",
            Error::Capacity(_) => "capacity",
            Error::UnknownKey(_) => "unknown_key",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }
}
