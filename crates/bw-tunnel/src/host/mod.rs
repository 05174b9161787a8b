//! The answering end of a tunnel
//!
//! [`HostTunnel`] answers every call from local resources: the git and
//! docker configuration of the user running it, a workspace directory, and
//! an optional SSH connection that forwarded ports are relayed through.

mod archive;
mod docker;
mod git;
mod ports;

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use bw_protocol::message::{
    DockerCredentialsRequest, ExecutionResult, ForwardPortRequest, ForwardPortResponse,
    GitCredentials, GitSshSignatureRequest, LogLevel, LogMessage, Message, StopForwardPortRequest,
    StopForwardPortResponse, StreamMountRequest,
};

use crate::error::TunnelError;
use crate::rpc::{ByteStream, Tunnel};

pub use archive::GitCloneSource;
pub use ports::{PortForwarder, PortSpec};

#[derive(Default)]
pub struct HostTunnel {
    workspace_dir: Option<PathBuf>,
    git_clone: Option<GitCloneSource>,
    docker_config: Option<PathBuf>,
    forwarder: Option<Arc<PortForwarder>>,
    result: OnceLock<ExecutionResult>,
}

impl HostTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory streamed by `stream_workspace`
    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = Some(dir.into());
        self
    }

    /// Repository streamed by `stream_git_clone`
    pub fn with_git_clone(mut self, source: GitCloneSource) -> Self {
        self.git_clone = Some(source);
        self
    }

    /// Docker config consulted for registry credentials instead of the default
    pub fn with_docker_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.docker_config = Some(path.into());
        self
    }

    /// Serve `forward_port` through this forwarder
    pub fn with_forwarder(mut self, forwarder: Arc<PortForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Result the agent sent, if any
    pub fn result(&self) -> Option<ExecutionResult> {
        self.result.get().cloned()
    }

    fn forwarder(&self) -> Result<&PortForwarder, TunnelError> {
        self.forwarder
            .as_deref()
            .ok_or_else(|| TunnelError::unimplemented("port forwarding without a connection"))
    }
}

fn decode<T: serde::de::DeserializeOwned>(request: &Message, what: &str) -> Result<T, TunnelError> {
    request
        .to_value()
        .map_err(|e| TunnelError::invalid_argument(format!("decode {}: {}", what, e)))
}

#[async_trait]
impl Tunnel for HostTunnel {
    async fn ping(&self) -> Result<(), TunnelError> {
        Ok(())
    }

    async fn forward_port(
        &self,
        request: ForwardPortRequest,
    ) -> Result<ForwardPortResponse, TunnelError> {
        self.forwarder()?.forward(&request.port).await?;
        Ok(ForwardPortResponse {})
    }

    async fn stop_forward_port(
        &self,
        request: StopForwardPortRequest,
    ) -> Result<StopForwardPortResponse, TunnelError> {
        if let Some(forwarder) = &self.forwarder {
            forwarder.stop(&request.port);
        }
        Ok(StopForwardPortResponse {})
    }

    async fn docker_credentials(&self, request: Message) -> Result<Message, TunnelError> {
        let request: DockerCredentialsRequest = decode(&request, "docker credentials request")?;
        let path = self
            .docker_config
            .clone()
            .or_else(docker::default_config_path)
            .ok_or_else(|| TunnelError::internal("no docker config location"))?;
        let credentials = docker::lookup(&path, &request.server_url).await?;
        Ok(Message::from_value(&credentials)?)
    }

    async fn git_user(&self) -> Result<Message, TunnelError> {
        Ok(Message::from_value(&git::user().await)?)
    }

    async fn git_credentials(&self, request: Message) -> Result<Message, TunnelError> {
        let request: GitCredentials = decode(&request, "git credentials request")?;
        let credentials = git::fill_credentials(&request).await?;
        Ok(Message::from_value(&credentials)?)
    }

    async fn git_ssh_signature(&self, request: Message) -> Result<Message, TunnelError> {
        let request: GitSshSignatureRequest = decode(&request, "signature request")?;
        Ok(Message::from_value(&git::ssh_signature(&request).await?)?)
    }

    async fn log(&self, message: LogMessage) -> Result<(), TunnelError> {
        match message.level {
            LogLevel::Debug => tracing::debug!("{}", message.message),
            LogLevel::Info | LogLevel::Done => tracing::info!("{}", message.message),
            LogLevel::Warning => tracing::warn!("{}", message.message),
            LogLevel::Error => tracing::error!("{}", message.message),
        }
        Ok(())
    }

    async fn send_result(&self, result: Message) -> Result<(), TunnelError> {
        let parsed: ExecutionResult = decode(&result, "result")?;
        if self.result.set(parsed).is_err() {
            tracing::debug!("Result already received, keeping the first one");
        }
        Ok(())
    }

    async fn stream_git_clone(&self) -> Result<ByteStream, TunnelError> {
        let source = self
            .git_clone
            .as_ref()
            .ok_or_else(|| TunnelError::unimplemented("git clone without a repository"))?;
        archive::stream_clone(source).await
    }

    async fn stream_workspace(&self) -> Result<ByteStream, TunnelError> {
        let dir = self
            .workspace_dir
            .as_ref()
            .ok_or_else(|| TunnelError::unimplemented("workspace streaming without a directory"))?;
        archive::tar_directory(dir)
    }

    async fn stream_mount(&self, request: StreamMountRequest) -> Result<ByteStream, TunnelError> {
        let source = archive::mount_source(&request.mount)?;
        archive::tar_directory(&source)
    }
}
