//! Structured error types for the agent
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{EndpointHash, MessageId, Pid};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("hook threw {class}: {message}")]
    Thrown { class: String, message: String },

    #[error("hook panicked: {0}")]
    Panicked(String),

    #[error("unknown parameter name '{0}'")]
    UnknownParameter(String),

    #[error("argument index {index} is outside the {limit} patchable arguments")]
    ArgumentOutOfRange { index: i64, limit: usize },
}

impl HookError {
    pub fn thrown(class: impl Into<String>, message: impl Into<String>) -> Self {
        HookError::Thrown { class: class.into(), message: message.into() }
    }
}

/// Fatal unwind raised by the host engine's own call machinery
///
/// Never produced by hooks; the dispatcher returns it to the caller unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("host engine fatal error unwind")]
pub struct Bailout;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Endpoint {0} is not registered")]
    UnknownEndpoint(EndpointHash),

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("Failed to read TLS material from {path}: {source}")]
    TlsMaterial {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Coordinator channel did not accept {0}")]
    Forward(&'static str),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{sender} {message}: chunk offset {offset} does not match received size {expected}")]
    OffsetMismatch { sender: Pid, message: MessageId, expected: u64, offset: u64 },

    #[error("{sender} {message}: chunk ending at {end} exceeds message size {total}")]
    SizeExceeded { sender: Pid, message: MessageId, end: u64, total: u64 },

    #[error("{sender} {message}: message size changed from {previous} to {total}")]
    TotalSizeChanged { sender: Pid, message: MessageId, previous: u64, total: u64 },

    #[error("Truncated frame of {0} bytes")]
    TruncatedFrame(usize),

    #[error("Malformed coordinator envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Unknown coordinator command type {0}")]
    UnknownCommand(u32),

    #[error(transparent)]
    Decode(#[from] bincode::Error),
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("fork() failed: {0}")]
    ForkFailed(#[source] std::io::Error),

    #[error("Unable to start maintenance thread: {0}")]
    MaintenanceThread(#[source] std::io::Error),

    #[error("Coordinator channel error: {0}")]
    Channel(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {name}: {reason}")]
    InvalidValue { name: String, value: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
