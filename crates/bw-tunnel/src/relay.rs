//! Relay hop between two tunnel endpoints
//!
//! Each inbound call is either answered here or forwarded verbatim to the
//! upstream [`Tunnel`], with its response or error relayed unchanged.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use bw_core::config::RelayConfig;
use bw_core::{Listener, StdioListener};
use bw_protocol::message::{
    ExecutionResult, ForwardPortRequest, ForwardPortResponse, GitCredentials, LogLevel,
    LogMessage, Message, StopForwardPortRequest, StopForwardPortResponse, StreamMountRequest,
};

use crate::error::TunnelError;
use crate::rpc::{ByteStream, Tunnel, TunnelServer};

pub struct ProxyServer {
    upstream: Arc<dyn Tunnel>,
    config: RelayConfig,
    result: OnceLock<ExecutionResult>,
}

impl ProxyServer {
    pub fn new(upstream: Arc<dyn Tunnel>, config: RelayConfig) -> Self {
        Self {
            upstream,
            config,
            result: OnceLock::new(),
        }
    }

    /// The result latched from the first `send_result`, if any
    pub fn result(&self) -> Option<ExecutionResult> {
        self.result.get().cloned()
    }
}

#[async_trait]
impl Tunnel for ProxyServer {
    async fn ping(&self) -> Result<(), TunnelError> {
        Ok(())
    }

    async fn forward_port(
        &self,
        request: ForwardPortRequest,
    ) -> Result<ForwardPortResponse, TunnelError> {
        self.upstream.forward_port(request).await
    }

    async fn stop_forward_port(
        &self,
        request: StopForwardPortRequest,
    ) -> Result<StopForwardPortResponse, TunnelError> {
        self.upstream.stop_forward_port(request).await
    }

    async fn docker_credentials(&self, request: Message) -> Result<Message, TunnelError> {
        if !self.config.allow_docker_credentials {
            return Err(TunnelError::permission_denied("docker credentials forbidden"));
        }
        self.upstream.docker_credentials(request).await
    }

    async fn git_user(&self) -> Result<Message, TunnelError> {
        self.upstream.git_user().await
    }

    async fn git_credentials(&self, request: Message) -> Result<Message, TunnelError> {
        let Some((username, token)) = self.config.git_identity() else {
            return self.upstream.git_credentials(request).await;
        };

        let mut credentials: GitCredentials = request
            .to_value()
            .map_err(|e| TunnelError::invalid_argument(format!("decode git credentials request: {}", e)))?;
        credentials.username = Some(username);
        credentials.password = Some(token);
        Ok(Message::from_value(&credentials)?)
    }

    async fn git_ssh_signature(&self, request: Message) -> Result<Message, TunnelError> {
        self.upstream.git_ssh_signature(request).await
    }

    async fn log(&self, message: LogMessage) -> Result<(), TunnelError> {
        match message.level {
            LogLevel::Error => tracing::debug!("agent error: {}", message.message),
            _ => tracing::debug!("agent: {}", message.message),
        }
        Ok(())
    }

    async fn send_result(&self, result: Message) -> Result<(), TunnelError> {
        let parsed: ExecutionResult = result
            .to_value()
            .map_err(|e| TunnelError::invalid_argument(format!("decode result: {}", e)))?;
        if self.result.set(parsed).is_err() {
            tracing::debug!("Result already received, keeping the first one");
        }
        self.upstream.send_result(result).await
    }

    async fn stream_git_clone(&self) -> Result<ByteStream, TunnelError> {
        self.upstream.stream_git_clone().await
    }

    async fn stream_workspace(&self) -> Result<ByteStream, TunnelError> {
        self.upstream.stream_workspace().await
    }

    async fn stream_mount(&self, request: StreamMountRequest) -> Result<ByteStream, TunnelError> {
        self.upstream.stream_mount(request).await
    }
}

/// Serve a relay over `reader`/`writer` until the session ends or `cancel` fires.
///
/// Returns the result the agent sent, if it sent one. A transport failure is
/// returned as an error; the latched result is lost in that case.
pub async fn run_proxy_server<R, W>(
    reader: R,
    writer: W,
    upstream: Arc<dyn Tunnel>,
    config: RelayConfig,
    cancel: CancellationToken,
    span: tracing::Span,
) -> Result<Option<ExecutionResult>, TunnelError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let listener = StdioListener::new(reader, writer, false).with_label("relay");
    let show_logs = config.show_logs;
    let proxy = Arc::new(ProxyServer::new(upstream, config));

    let server = TunnelServer::new(proxy.clone(), span).with_logging(show_logs);
    let served = server.serve(&listener, cancel).await;
    listener.close().await;

    served?;
    Ok(proxy.result())
}
