//! Embedded SSH server
//!
//! Serves shell and exec sessions (with or without a PTY), the `sftp`
//! subsystem, and TCP and Unix socket forwarding in both directions. In
//! proxy mode every session is instead spliced onto a session of an inner
//! [`SshClient`].

mod activity;
mod auth;
mod command;
mod exec;
mod forward;
mod handler;
mod output;
mod proxy;
mod pty;
mod sftp;

pub use activity::track_activity;
pub use auth::{generate_host_key, load_host_key, parse_authorized_keys, ServerToken};
pub use command::CommandSpec;
pub use pty::{relay_resizes, TerminalResizer, WindowSize};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::{PrivateKey, PublicKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use bw_core::config::SshServerConfig;
use bw_core::traits::{Listener, TcpAcceptor};
use bw_core::TransportError;

use crate::client::SshClient;
use crate::error::SshError;
use handler::SessionHandler;

/// What a session channel runs
#[derive(Clone)]
pub enum SessionMode {
    /// Run shells and commands on this machine
    Local,
    /// Splice every session onto a session of this already-connected client
    Proxy(Arc<SshClient>),
}

/// Behavior shared by every connection of a server
#[derive(Clone)]
pub struct ServerOptions {
    /// Shell program and leading arguments
    pub shell: Vec<String>,

    /// Preferred working directory, used only when it exists
    pub workdir: Option<PathBuf>,

    /// User the server process runs as
    pub current_user: String,

    /// Allowed client keys; empty means every client is accepted
    pub authorized_keys: Vec<PublicKey>,

    /// Local execution or proxying
    pub mode: SessionMode,
}

impl ServerOptions {
    /// Options for local execution derived from `config`
    pub fn from_config(config: &SshServerConfig) -> Self {
        let shell = config
            .shell
            .clone()
            .unwrap_or_else(|| bw_core::user::login_shell(None));

        Self {
            shell: shell.split_whitespace().map(str::to_string).collect(),
            workdir: config.workdir.clone(),
            current_user: bw_core::user::current_username(),
            authorized_keys: Vec::new(),
            mode: SessionMode::Local,
        }
    }

    /// Restrict authentication to `keys`
    pub fn with_authorized_keys(mut self, keys: Vec<PublicKey>) -> Self {
        self.authorized_keys = keys;
        self
    }

    /// Proxy every session onto `client`
    pub fn with_proxy(mut self, client: Arc<SshClient>) -> Self {
        self.mode = SessionMode::Proxy(client);
        self
    }
}

/// SSH server over any [`Listener`]
pub struct SshServer {
    config: Arc<russh::server::Config>,
    options: Arc<ServerOptions>,
    span: tracing::Span,
}

impl SshServer {
    /// Create a server presenting `host_key`
    pub fn new(
        host_key: PrivateKey,
        options: ServerOptions,
        auth_rejection_time: Duration,
        span: tracing::Span,
    ) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.auth_rejection_time = auth_rejection_time;
        config.auth_rejection_time_initial = Some(Duration::from_secs(0));
        config.inactivity_timeout = None;

        Self {
            config: Arc::new(config),
            options: Arc::new(options),
            span,
        }
    }

    /// Accept connections from `listener` until it closes or `cancel` fires
    pub async fn serve<L: Listener>(
        &self,
        listener: &L,
        cancel: CancellationToken,
    ) -> Result<(), SshError> {
        tracing::info!(parent: &self.span, "SSH server listening on {}", listener.addr());

        let mut connections = JoinSet::new();
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(parent: &self.span, "SSH server shutting down");
                    break Ok(());
                }

                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        tracing::debug!(parent: &self.span, "Connection task ended abnormally: {}", e);
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.connection_future(stream, peer, cancel.child_token());
                        connections.spawn(server);
                    }
                    Err(TransportError::ListenerClosed(addr)) => {
                        tracing::debug!(parent: &self.span, "Listener {} closed", addr);
                        break Ok(());
                    }
                    Err(e) => {
                        tracing::error!(parent: &self.span, "Failed to accept connection: {}", e);
                        break Err(SshError::Io(std::io::Error::other(e.to_string())));
                    }
                },
            }
        };

        listener.close().await;
        connections.shutdown().await;
        result
    }

    /// Serve a single already-established connection to completion
    pub async fn serve_connection<S>(&self, stream: S, peer: String) -> Result<(), SshError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.connection_future(stream, peer, CancellationToken::new())
            .await;
        Ok(())
    }

    fn connection_future<S>(
        &self,
        stream: S,
        peer: String,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = ()> + Send + 'static
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = Arc::clone(&self.config);
        let span = tracing::debug_span!(parent: &self.span, "connection", peer = %peer);
        let handler = SessionHandler::new(Arc::clone(&self.options), peer.clone(), cancel, span.clone());

        async move {
            tracing::debug!("New connection from {}", peer);
            match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => match session.await {
                    Ok(()) => tracing::debug!("Connection from {} closed normally", peer),
                    Err(e) => tracing::warn!("Connection from {} closed with error: {}", peer, e),
                },
                Err(e) => tracing::warn!("SSH handshake with {} failed: {}", peer, e),
            }
        }
        .instrument(span)
    }

    /// Bind `address` and serve until `cancel` fires.
    ///
    /// An address that is already in use is assumed to be served by another
    /// instance, so this logs and returns success.
    pub async fn listen_and_serve(
        &self,
        address: &str,
        cancel: CancellationToken,
    ) -> Result<(), SshError> {
        let listener = match TcpAcceptor::bind(address).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::info!(
                    parent: &self.span,
                    "Address {} already in use, assuming an SSH server is already running",
                    address
                );
                return Ok(());
            }
            Err(e) => return Err(SshError::Io(e)),
        };

        self.serve(&listener, cancel).await
    }
}
