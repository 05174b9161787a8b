//! bw-ssh: SSH plumbing for burrow
//!
//! [`SshClient`] speaks SSH over any duplex byte stream, which is how the
//! orchestrator dials through the stdio of a remote helper process.
//! [`server::SshServer`] is the embedded server that terminates the last hop:
//! shell/exec with or without a PTY, SFTP, TCP and Unix socket forwarding,
//! and a proxy mode that splices sessions onto an inner SSH client.

pub mod client;
pub mod error;
pub mod server;

pub use client::SshClient;
pub use russh::keys::{PrivateKey, PublicKey};
pub use error::SshError;
pub use server::{ServerOptions, SessionMode, SshServer};
