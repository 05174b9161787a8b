//! The `Tunnel` capability
//!
//! Implemented independently by the answering agent ([`HostTunnel`]), the
//! relay hop ([`ProxyServer`]) and the remote end of a connection
//! ([`TunnelClient`]), so any of them can sit behind a [`TunnelServer`].
//!
//! [`HostTunnel`]: crate::host::HostTunnel
//! [`ProxyServer`]: crate::relay::ProxyServer
//! [`TunnelClient`]: crate::rpc::TunnelClient
//! [`TunnelServer`]: crate::rpc::TunnelServer

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use bw_protocol::message::{
    ForwardPortRequest, ForwardPortResponse, LogMessage, Message, StopForwardPortRequest,
    StopForwardPortResponse, StreamMountRequest,
};

use crate::error::TunnelError;

/// Ordered, finite sequence of byte chunks returned by streaming calls
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TunnelError>> + Send>>;

#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> Result<(), TunnelError>;

    /// Start relaying a port; the payload flows over a separate channel
    async fn forward_port(
        &self,
        request: ForwardPortRequest,
    ) -> Result<ForwardPortResponse, TunnelError>;

    /// Stop a relay started by `forward_port`; stopping an unknown port succeeds
    async fn stop_forward_port(
        &self,
        request: StopForwardPortRequest,
    ) -> Result<StopForwardPortResponse, TunnelError>;

    async fn docker_credentials(&self, request: Message) -> Result<Message, TunnelError>;

    async fn git_user(&self) -> Result<Message, TunnelError>;

    async fn git_credentials(&self, request: Message) -> Result<Message, TunnelError>;

    async fn git_ssh_signature(&self, request: Message) -> Result<Message, TunnelError>;

    /// Best-effort log relay from the agent
    async fn log(&self, message: LogMessage) -> Result<(), TunnelError>;

    /// Final result of the agent, delivered once per session
    async fn send_result(&self, result: Message) -> Result<(), TunnelError>;

    async fn stream_git_clone(&self) -> Result<ByteStream, TunnelError>;

    async fn stream_workspace(&self) -> Result<ByteStream, TunnelError>;

    async fn stream_mount(&self, request: StreamMountRequest) -> Result<ByteStream, TunnelError>;
}
