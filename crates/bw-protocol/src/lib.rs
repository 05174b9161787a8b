//! bw-protocol: Wire protocol for the burrow tunnel RPC
//!
//! This crate defines the framing used to carry tunnel RPC calls over a
//! single duplex byte stream (typically the stdio of a process spawned
//! through an SSH exec channel), plus the JSON message types exchanged by
//! those calls.

pub mod call;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod message;

pub use call::CallId;
pub use codec::{Frame, FrameCodec};
pub use envelope::{Envelope, ErrorCode, FrameKind, Method};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
