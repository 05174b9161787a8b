//! SSH error types

use thiserror::Error;

/// Errors raised by the SSH client and server
#[derive(Error, Debug)]
pub enum SshError {
    /// Protocol-level error from russh
    #[error("SSH error: {0}")]
    Russh(#[from] russh::Error),

    /// Key parsing or generation failed
    #[error("Key error: {0}")]
    Keys(#[from] russh::keys::Error),

    /// A host key could not be generated
    #[error("generate host key: {0}")]
    HostKey(String),

    /// An authorized_keys entry could not be used
    #[error("parse authorized key: {0}")]
    AuthorizedKey(String),

    /// The server refused to authenticate us
    #[error("Authentication rejected for user {0}")]
    AuthRejected(String),

    /// A channel could not be used
    #[error("Channel error: {0}")]
    Channel(String),

    /// A subprocess or remote session exited unsuccessfully
    #[error("process exited with status {0}")]
    ExitCode(u32),

    /// The remote session closed without reporting an exit status
    #[error("session closed without exit status")]
    NoExitStatus,

    /// A process could not be started
    #[error("start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Pseudo-terminal allocation or I/O failed
    #[error("PTY error: {0}")]
    Pty(String),

    /// The server token could not be decoded
    #[error("Invalid token: {0}")]
    Token(String),

    /// Error raised by a session handler
    #[error("Session error: {0}")]
    Session(#[from] anyhow::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    /// Status reported to the SSH client for this error.
    ///
    /// Exit-code errors keep their code; everything else is 1.
    pub fn exit_code(&self) -> u32 {
        match self {
            SshError::ExitCode(code) => *code,
            _ => 1,
        }
    }

    /// Whether this error only carries a process exit status
    pub fn is_exit_code(&self) -> bool {
        matches!(self, SshError::ExitCode(_))
    }
}

/// Status for a finished workload
pub fn exit_status(result: &Result<(), SshError>) -> u32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.exit_code(),
    }
}
