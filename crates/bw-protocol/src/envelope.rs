//! RPC envelopes carried inside protocol frames
//!
//! Every frame holds exactly one [`Envelope`]. The frame header repeats the
//! envelope's [`FrameKind`] so a reader can route or skip frames without
//! deserializing them.
//!
//! # Call Flow
//!
//! Unary call:
//!
//! 1. Caller sends `Request { method, payload }` under a fresh call ID
//! 2. Callee answers with `Response { payload }` or `Error { code, message }`
//!
//! Server-streaming call:
//!
//! 1. Caller sends `Request`
//! 2. Callee sends zero or more `Chunk(bytes)` frames, in order
//! 3. Callee ends with `StreamEnd`, or `Error` if the stream failed
//! 4. Caller may send `Cancel` at any point to stop the stream early
//!
//! Request and response payloads are the JSON encoding of the call's message
//! type (see [`crate::message`]). Chunks are raw bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Call request
    Request = 0x01,
    /// Unary call response
    Response = 0x02,
    /// Stream data chunk
    Chunk = 0x03,
    /// End of a stream
    StreamEnd = 0x04,
    /// Caller abandoned the call
    Cancel = 0x05,
    /// Error response
    Error = 0xFF,
}

impl FrameKind {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::Response),
            0x03 => Some(Self::Chunk),
            0x04 => Some(Self::StreamEnd),
            0x05 => Some(Self::Cancel),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Tunnel RPC operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Ping,
    ForwardPort,
    StopForwardPort,
    DockerCredentials,
    GitUser,
    GitCredentials,
    GitSshSignature,
    Log,
    SendResult,
    StreamGitClone,
    StreamWorkspace,
    StreamMount,
}

impl Method {
    /// Whether the call answers with a chunk stream instead of a single message
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Method::StreamGitClone | Method::StreamWorkspace | Method::StreamMount
        )
    }

    /// Stable method name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Method::Ping => "Ping",
            Method::ForwardPort => "ForwardPort",
            Method::StopForwardPort => "StopForwardPort",
            Method::DockerCredentials => "DockerCredentials",
            Method::GitUser => "GitUser",
            Method::GitCredentials => "GitCredentials",
            Method::GitSshSignature => "GitSSHSignature",
            Method::Log => "Log",
            Method::SendResult => "SendResult",
            Method::StreamGitClone => "StreamGitClone",
            Method::StreamWorkspace => "StreamWorkspace",
            Method::StreamMount => "StreamMount",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/tunnel.Tunnel/{}", self.name())
    }
}

/// Error codes for error envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unclassified failure inside the callee
    Internal = 0,
    /// Call rejected by policy
    PermissionDenied = 1,
    /// Request payload could not be understood
    InvalidArgument = 2,
    /// Callee does not implement the method
    Unimplemented = 3,
    /// Callee could not reach what it needed to answer
    Unavailable = 4,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Internal => "internal",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::Unimplemented => "unimplemented",
            ErrorCode::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Protocol envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Call request
    Request {
        /// Operation to invoke
        method: Method,
        /// JSON-encoded request message
        payload: String,
    },

    /// Unary response
    Response {
        /// JSON-encoded response message
        payload: String,
    },

    /// Stream data
    Chunk(Bytes),

    /// Stream finished cleanly
    StreamEnd,

    /// Caller is no longer interested in the call
    Cancel,

    /// Error response
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
}

impl Envelope {
    /// Get the frame kind for this envelope
    pub fn kind(&self) -> FrameKind {
        match self {
            Envelope::Request { .. } => FrameKind::Request,
            Envelope::Response { .. } => FrameKind::Response,
            Envelope::Chunk(_) => FrameKind::Chunk,
            Envelope::StreamEnd => FrameKind::StreamEnd,
            Envelope::Cancel => FrameKind::Cancel,
            Envelope::Error { .. } => FrameKind::Error,
        }
    }

    /// Build a request envelope from a serializable message
    pub fn request<T: Serialize>(method: Method, message: &T) -> Result<Self, serde_json::Error> {
        Ok(Envelope::Request {
            method,
            payload: serde_json::to_string(message)?,
        })
    }

    /// Build a response envelope from a serializable message
    pub fn response<T: Serialize>(message: &T) -> Result<Self, serde_json::Error> {
        Ok(Envelope::Response {
            payload: serde_json::to_string(message)?,
        })
    }
}
