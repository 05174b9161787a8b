//! Test doubles shared by the integration suites

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use bw_protocol::message::{
    ForwardPortRequest, ForwardPortResponse, GitCredentials, LogMessage, Message,
    StopForwardPortRequest, StopForwardPortResponse, StreamMountRequest,
};
use bw_tunnel::{ByteStream, Tunnel, TunnelClient, TunnelError, TunnelServer};

/// Upstream that counts calls and answers with canned data
#[derive(Default)]
pub struct RecordingTunnel {
    pub git_credentials_calls: AtomicUsize,
    pub docker_calls: AtomicUsize,
    pub log_calls: AtomicUsize,
    pub results: std::sync::Mutex<Vec<String>>,
    /// Returned by every streaming call, split into chunks of `chunk_size`
    pub stream_data: Vec<u8>,
    pub chunk_size: usize,
}

impl RecordingTunnel {
    pub fn with_stream(data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            stream_data: data,
            chunk_size,
            ..Default::default()
        }
    }

    fn stream(&self) -> ByteStream {
        let size = self.chunk_size.max(1);
        let chunks: Vec<Result<Bytes, TunnelError>> = self
            .stream_data
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(futures::stream::iter(chunks))
    }
}

#[async_trait]
impl Tunnel for RecordingTunnel {
    async fn ping(&self) -> Result<(), TunnelError> {
        Ok(())
    }

    async fn forward_port(
        &self,
        _request: ForwardPortRequest,
    ) -> Result<ForwardPortResponse, TunnelError> {
        Ok(ForwardPortResponse {})
    }

    async fn stop_forward_port(
        &self,
        _request: StopForwardPortRequest,
    ) -> Result<StopForwardPortResponse, TunnelError> {
        Ok(StopForwardPortResponse {})
    }

    async fn docker_credentials(&self, request: Message) -> Result<Message, TunnelError> {
        self.docker_calls.fetch_add(1, Ordering::SeqCst);
        Ok(request)
    }

    async fn git_user(&self) -> Result<Message, TunnelError> {
        Ok(Message::new(r#"{"name":"Upstream","email":"up@example.com"}"#))
    }

    async fn git_credentials(&self, request: Message) -> Result<Message, TunnelError> {
        self.git_credentials_calls.fetch_add(1, Ordering::SeqCst);
        let mut creds: GitCredentials = request.to_value()?;
        creds.username = Some("upstream".to_string());
        creds.password = Some("from-upstream".to_string());
        Ok(Message::from_value(&creds)?)
    }

    async fn git_ssh_signature(&self, _request: Message) -> Result<Message, TunnelError> {
        Err(TunnelError::internal("no signing key"))
    }

    async fn log(&self, _message: LogMessage) -> Result<(), TunnelError> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_result(&self, result: Message) -> Result<(), TunnelError> {
        if let Ok(mut results) = self.results.lock() {
            results.push(result.message);
        }
        Ok(())
    }

    async fn stream_git_clone(&self) -> Result<ByteStream, TunnelError> {
        Ok(self.stream())
    }

    async fn stream_workspace(&self) -> Result<ByteStream, TunnelError> {
        Ok(self.stream())
    }

    async fn stream_mount(&self, _request: StreamMountRequest) -> Result<ByteStream, TunnelError> {
        Ok(self.stream())
    }
}

/// Serve `service` on one end of an in-memory pipe and return a client on the other
pub fn connect(service: Arc<dyn Tunnel>) -> (TunnelClient, CancellationToken) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();
    let server = TunnelServer::new(service, tracing::Span::none());
    let server_cancel = cancel.clone();
    tokio::spawn(async move { server.serve_connection(server_end, server_cancel).await });
    (TunnelClient::connect(client_end, tracing::Span::none()), cancel)
}
