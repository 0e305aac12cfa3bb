//! Error taxonomy for the session core.
//!
//! Every error that reaches the event sink is `Clone`, so payloads are
//! rendered to strings at the boundary where they are produced.

use std::path::PathBuf;

use crate::types::MessageSeverity;

/// Any failure the session reports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("session invariant violated: {0}")]
    Lifecycle(String),
}

impl SessionError {
    /// Severity used when this error is surfaced as a message.
    #[must_use]
    pub fn severity(&self) -> MessageSeverity {
        match self {
            Self::Lifecycle(_) => MessageSeverity::Critical,
            Self::Protocol(_) => MessageSeverity::Log,
            Self::Provision(_) | Self::Transport(_) => MessageSeverity::Error,
        }
    }
}

/// Local server could not be provisioned. Fatal to the current start attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    #[error("server install directory not found: {}", .0.display())]
    MissingInstallDir(PathBuf),
    #[error("no server artifact matching \"{pattern}\" in {}", dir.display())]
    MissingArtifact { dir: PathBuf, pattern: String },
    #[error("{command} not found: {reason}")]
    ExecutableNotFound { command: String, reason: String },
    #[error("failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },
}

/// Connection-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error(
        "failed to connect to analysis server at {host}:{port} after {attempts} attempts: {last_error}"
    )]
    Exhausted {
        host: String,
        port: u16,
        attempts: u32,
        last_error: String,
    },
    /// A newer start/stop invalidated this attempt. Never surfaced to the sink.
    #[error("connection attempt superseded")]
    Superseded,
    #[error("initialize handshake failed: {0}")]
    Handshake(String),
    #[error("analysis server connection closed: {0}")]
    Closed(String),
    #[error("failed to send to analysis server: {0}")]
    Send(String),
}

/// Malformed or unexpected payload from the server. Logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed {method} payload: {reason}")]
    Malformed { method: String, reason: String },
    #[error("unknown progress kind {raw:?} for token {token}")]
    UnknownProgressKind { token: String, raw: String },
}
