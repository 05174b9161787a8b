//! bw-core: Core abstractions and configuration for burrow
//!
//! This crate provides the listener abstraction shared by the tunnel RPC
//! server and the embedded SSH server, the stdio transport adapter that
//! turns a pair of byte streams into such a listener, and the configuration
//! structures used by every component.

pub mod config;
pub mod error;
pub mod stdio;
pub mod traits;
pub mod types;
pub mod user;

pub use error::{ConfigError, TransportError};
pub use stdio::{StdioListener, StdioStream};
pub use traits::{Listener, TcpAcceptor};
pub use types::WorkspaceInfo;
