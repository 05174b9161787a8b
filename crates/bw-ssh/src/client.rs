//! SSH client over an arbitrary duplex stream
//!
//! No socket is involved: the orchestrator hands in one end of an in-process
//! pipe whose other end is wired to a remote `helper ssh-server --stdio`.

use std::sync::Arc;

use russh::client::{self, Config, Handle, Msg};
use russh::keys::{HashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::Instrument;

use crate::error::SshError;

/// Authenticated SSH connection
pub struct SshClient {
    handle: Handle<ClientHandler>,
    user: String,
    span: tracing::Span,
}

impl SshClient {
    /// Connect over `stream` using `none` authentication.
    ///
    /// Only meaningful over transports that are already trusted, such as the
    /// stdio of a process started through another SSH session.
    pub async fn connect<S>(stream: S, user: &str, span: tracing::Span) -> Result<Self, SshError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut handle = Self::handshake(stream).instrument(span.clone()).await?;

        tracing::debug!(parent: &span, "Authenticating as '{}'", user);
        if !handle.authenticate_none(user).await?.success() {
            return Err(SshError::AuthRejected(user.to_string()));
        }

        Ok(Self {
            handle,
            user: user.to_string(),
            span,
        })
    }

    async fn handshake<S>(stream: S) -> Result<Handle<ClientHandler>, SshError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = Arc::new(Config {
            inactivity_timeout: None,
            ..Default::default()
        });
        client::connect_stream(config, stream, ClientHandler).await
    }

    /// User this client authenticated as
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Whether the underlying connection has gone away
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Open a new session channel
    pub async fn open_session(&self) -> Result<Channel<Msg>, SshError> {
        Ok(self.handle.channel_open_session().await?)
    }

    /// Run `command`, wiring its stdio to the given streams.
    ///
    /// Returns `Ok(())` on exit status 0 and [`SshError::ExitCode`] otherwise.
    /// End-of-stream on `stdin` is forwarded as channel EOF.
    pub async fn run<I, O, E>(
        &self,
        command: &str,
        mut stdin: I,
        mut stdout: O,
        mut stderr: E,
    ) -> Result<(), SshError>
    where
        I: AsyncRead + Unpin + Send,
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        tracing::debug!(parent: &self.span, "Run command: {}", command);

        let mut channel = self.open_session().await?;
        channel.exec(true, command).await?;

        let mut writer = channel.make_writer();
        let stdin_copy = async move {
            let copied = tokio::io::copy(&mut stdin, &mut writer).await;
            let _ = writer.shutdown().await;
            copied
        };
        tokio::pin!(stdin_copy);

        let mut stdin_open = true;
        let mut status = None;
        loop {
            tokio::select! {
                copied = &mut stdin_copy, if stdin_open => {
                    stdin_open = false;
                    if let Err(e) = copied {
                        tracing::debug!(parent: &self.span, "Error piping stdin: {}", e);
                    }
                }
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        stdout.write_all(data).await?;
                        stdout.flush().await?;
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                        stderr.write_all(data).await?;
                        stderr.flush().await?;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => status = Some(exit_status),
                    Some(ChannelMsg::Close) | None => break,
                    _ => {}
                },
            }
        }

        match status {
            Some(0) => Ok(()),
            Some(code) => Err(SshError::ExitCode(code)),
            None => Err(SshError::NoExitStatus),
        }
    }

    /// Run `command` with empty stdin and collect its stdout
    pub async fn output(&self, command: &str) -> Result<Vec<u8>, SshError> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let result = self
            .run(command, tokio::io::empty(), &mut stdout, &mut stderr)
            .await;

        if let Err(e) = result {
            if !stderr.is_empty() {
                tracing::debug!(
                    parent: &self.span,
                    "{} failed: {}",
                    command,
                    String::from_utf8_lossy(&stderr).trim()
                );
            }
            return Err(e);
        }
        Ok(stdout)
    }

    /// Open a `direct-tcpip` channel to `host:port` on the server side
    pub async fn direct_tcpip(
        &self,
        host: &str,
        port: u16,
    ) -> Result<impl AsyncRead + AsyncWrite + Unpin + Send + 'static, SshError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await?;
        Ok(channel.into_stream())
    }

    /// Open a `direct-streamlocal@openssh.com` channel to a Unix socket on the server side
    pub async fn direct_streamlocal(
        &self,
        socket_path: &str,
    ) -> Result<impl AsyncRead + AsyncWrite + Unpin + Send + 'static, SshError> {
        let channel = self
            .handle
            .channel_open_direct_streamlocal(socket_path)
            .await?;
        Ok(channel.into_stream())
    }

    /// Disconnect politely; errors are ignored
    pub async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
        {
            tracing::debug!(parent: &self.span, "Disconnect failed: {}", e);
        }
    }
}

/// russh client callbacks
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = SshError;

    /// The transport is already trusted, so any host key is accepted
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Server host key: {}",
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }
}
