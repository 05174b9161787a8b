//! Tunnel and orchestration error types

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use bw_core::TransportError;
use bw_protocol::{ErrorCode, ProtocolError};

/// Errors from tunnel RPC calls
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The callee answered with an error envelope
    #[error("{code}: {message}")]
    Remote { code: ErrorCode, message: String },

    /// The tunnel session ended before the call completed
    #[error("Tunnel closed")]
    Closed,

    /// No answer to a ping in time
    #[error("Ping timed out after {0:?}")]
    PingTimeout(Duration),

    /// Malformed frame on the wire
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Message payload did not match the call's type
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    /// Listener failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    pub fn remote(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::remote(ErrorCode::PermissionDenied, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::remote(ErrorCode::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::remote(ErrorCode::Internal, message)
    }

    pub fn unimplemented(what: impl fmt::Display) -> Self {
        Self::remote(ErrorCode::Unimplemented, format!("{} is not implemented", what))
    }

    /// Code to put in an error envelope
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Remote { code, .. } => *code,
            Self::InvalidMessage(_) => ErrorCode::InvalidArgument,
            Self::Closed | Self::PingTimeout(_) | Self::Transport(_) => ErrorCode::Unavailable,
            Self::Protocol(_) | Self::Io(_) => ErrorCode::Internal,
        }
    }

    /// Message to put in an error envelope; remote errors pass through unchanged
    pub fn message(&self) -> String {
        match self {
            Self::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the error ends the whole tunnel session rather than one call
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Transport(_) | Self::Protocol(_) | Self::Io(_)
        )
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Io(e) => e,
            TunnelError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, err),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Step of the multi-hop handshake an error happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The caller's workload inside the container
    RunInContainer,
    /// Dialing the host through the outer tunnel, and everything after
    TunnelToHost,
    /// Injecting and running the outer SSH server
    ConnectToServer,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::RunInContainer => "run in container",
            Phase::TunnelToHost => "tunnel to host",
            Phase::ConnectToServer => "connect to server",
        };
        f.write_str(name)
    }
}

/// Errors from the multi-hop orchestrator
#[derive(Error, Debug)]
pub enum OrchestrationError {
    /// A phase failed; the cause chain is part of the message
    #[error("{phase}: {cause:#}")]
    Failed { phase: Phase, cause: anyhow::Error },

    /// The caller cancelled the attempt
    #[error("Cancelled")]
    Cancelled,
}

impl OrchestrationError {
    pub fn failed(phase: Phase, cause: impl Into<anyhow::Error>) -> Self {
        Self::Failed {
            phase,
            cause: cause.into(),
        }
    }

    /// Phase the error is tagged with, `None` when cancelled
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Failed { phase, .. } => Some(*phase),
            Self::Cancelled => None,
        }
    }
}
