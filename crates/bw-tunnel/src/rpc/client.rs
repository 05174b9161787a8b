//! Tunnel RPC client
//!
//! Multiplexes concurrent calls over one connection by call id. The client
//! implements [`Tunnel`] itself, so it can be the upstream of a relay.

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use bw_protocol::message::{
    Empty, ForwardPortRequest, ForwardPortResponse, LogMessage, Message, StopForwardPortRequest,
    StopForwardPortResponse, StreamMountRequest,
};
use bw_protocol::{CallId, Envelope, Frame, FrameCodec, Method};

use super::service::{ByteStream, Tunnel};
use crate::error::TunnelError;

/// A hop that does not answer a ping within this is considered dead
pub const PING_TIMEOUT: Duration = Duration::from_secs(3);

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Chunks buffered per streaming call before the reader task waits
const STREAM_CHANNEL_CAPACITY: usize = 32;

enum Pending {
    Unary(oneshot::Sender<Result<String, TunnelError>>),
    Stream(mpsc::Sender<Result<Bytes, TunnelError>>),
}

struct Shared {
    pending: DashMap<CallId, Pending>,
    closed: CancellationToken,
}

impl Shared {
    /// Fail every outstanding call; runs once the connection is gone
    async fn fail_pending(&self) {
        let ids: Vec<CallId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                match pending {
                    Pending::Unary(tx) => {
                        let _ = tx.send(Err(TunnelError::Closed));
                    }
                    Pending::Stream(tx) => {
                        let _ = tx.send(Err(TunnelError::Closed)).await;
                    }
                }
            }
        }
    }
}

pub struct TunnelClient {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
    next_id: AtomicU32,
    ping_timeout: Duration,
}

impl TunnelClient {
    /// Start a client over `stream`
    pub fn connect<S>(stream: S, span: tracing::Span) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            closed: CancellationToken::new(),
        });

        tokio::spawn(
            write_frames(FramedWrite::new(writer, FrameCodec::new()), rx, shared.closed.clone())
                .instrument(span.clone()),
        );
        tokio::spawn(
            read_frames(FramedRead::new(reader, FrameCodec::new()), Arc::clone(&shared))
                .instrument(span),
        );

        Self {
            shared,
            outbound,
            next_id: AtomicU32::new(1),
            ping_timeout: PING_TIMEOUT,
        }
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Resolves once the connection is gone
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Tear the connection down; outstanding calls fail with `Closed`
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    fn next_call_id(&self) -> CallId {
        loop {
            // Zero is skipped on wrap-around
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return CallId::new(id);
            }
        }
    }

    async fn start<T: Serialize>(
        &self,
        method: Method,
        request: &T,
        pending: Pending,
    ) -> Result<CallId, TunnelError> {
        let envelope = Envelope::request(method, request)?;
        let id = self.next_call_id();
        self.shared.pending.insert(id, pending);

        // Checked after registering so a concurrent teardown cannot miss the call
        if self.is_closed() {
            self.shared.pending.remove(&id);
            return Err(TunnelError::Closed);
        }

        if self.outbound.send(Frame::new(id, envelope)).await.is_err() {
            self.shared.pending.remove(&id);
            return Err(TunnelError::Closed);
        }
        Ok(id)
    }

    async fn call<Req, Resp>(&self, method: Method, request: &Req) -> Result<Resp, TunnelError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let (tx, rx) = oneshot::channel();
        self.start(method, request, Pending::Unary(tx)).await?;
        let payload = rx.await.map_err(|_| TunnelError::Closed)??;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn call_stream<Req>(&self, method: Method, request: &Req) -> Result<ByteStream, TunnelError>
    where
        Req: Serialize + Sync,
    {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let id = self.start(method, request, Pending::Stream(tx)).await?;
        Ok(Box::pin(CallStream {
            id,
            rx,
            shared: Arc::clone(&self.shared),
            outbound: self.outbound.clone(),
        }))
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

async fn write_frames<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = sink.send(frame).await {
            tracing::debug!("Tunnel write failed: {}", e);
            closed.cancel();
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_frames<R>(mut frames: FramedRead<R, FrameCodec>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => route(&shared, frame).await,
            Some(Err(e)) => {
                tracing::warn!("Tunnel read failed: {}", e);
                break;
            }
            None => {
                tracing::debug!("Tunnel closed by peer");
                break;
            }
        }
    }
    shared.closed.cancel();
    shared.fail_pending().await;
}

async fn route(shared: &Shared, frame: Frame) {
    let id = frame.call_id;
    match frame.envelope {
        Envelope::Response { payload } => match shared.pending.remove(&id) {
            Some((_, Pending::Unary(tx))) => {
                let _ = tx.send(Ok(payload));
            }
            Some((_, Pending::Stream(_))) => {
                tracing::warn!("Unary response for streaming {}", id);
            }
            None => tracing::trace!("Response for unknown {}", id),
        },
        Envelope::Error { code, message } => {
            let err = TunnelError::Remote { code, message };
            match shared.pending.remove(&id) {
                Some((_, Pending::Unary(tx))) => {
                    let _ = tx.send(Err(err));
                }
                Some((_, Pending::Stream(tx))) => {
                    let _ = tx.send(Err(err)).await;
                }
                None => tracing::trace!("Error for unknown {}: {}", id, err),
            }
        }
        Envelope::Chunk(bytes) => {
            // Clone the sender out so the map is not locked across the await
            let sender = match shared.pending.get(&id).as_deref() {
                Some(Pending::Stream(tx)) => Some(tx.clone()),
                _ => None,
            };
            if let Some(tx) = sender {
                if tx.send(Ok(bytes)).await.is_err() {
                    shared.pending.remove(&id);
                }
            }
        }
        Envelope::StreamEnd => {
            shared.pending.remove(&id);
        }
        other => tracing::warn!("Ignoring unexpected {:?} frame for {}", other.kind(), id),
    }
}

/// Receiving side of a streaming call; dropping it early cancels the call
struct CallStream {
    id: CallId,
    rx: mpsc::Receiver<Result<Bytes, TunnelError>>,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
}

impl Stream for CallStream {
    type Item = Result<Bytes, TunnelError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        if self.shared.pending.remove(&self.id).is_some() {
            let _ = self
                .outbound
                .try_send(Frame::new(self.id, Envelope::Cancel));
        }
    }
}

#[async_trait]
impl Tunnel for TunnelClient {
    async fn ping(&self) -> Result<(), TunnelError> {
        tokio::time::timeout(self.ping_timeout, self.call::<_, Empty>(Method::Ping, &Empty {}))
            .await
            .map_err(|_| TunnelError::PingTimeout(self.ping_timeout))??;
        Ok(())
    }

    async fn forward_port(
        &self,
        request: ForwardPortRequest,
    ) -> Result<ForwardPortResponse, TunnelError> {
        self.call(Method::ForwardPort, &request).await
    }

    async fn stop_forward_port(
        &self,
        request: StopForwardPortRequest,
    ) -> Result<StopForwardPortResponse, TunnelError> {
        self.call(Method::StopForwardPort, &request).await
    }

    async fn docker_credentials(&self, request: Message) -> Result<Message, TunnelError> {
        self.call(Method::DockerCredentials, &request).await
    }

    async fn git_user(&self) -> Result<Message, TunnelError> {
        self.call(Method::GitUser, &Empty {}).await
    }

    async fn git_credentials(&self, request: Message) -> Result<Message, TunnelError> {
        self.call(Method::GitCredentials, &request).await
    }

    async fn git_ssh_signature(&self, request: Message) -> Result<Message, TunnelError> {
        self.call(Method::GitSshSignature, &request).await
    }

    async fn log(&self, message: LogMessage) -> Result<(), TunnelError> {
        self.call::<_, Empty>(Method::Log, &message).await?;
        Ok(())
    }

    async fn send_result(&self, result: Message) -> Result<(), TunnelError> {
        self.call::<_, Empty>(Method::SendResult, &result).await?;
        Ok(())
    }

    async fn stream_git_clone(&self) -> Result<ByteStream, TunnelError> {
        self.call_stream(Method::StreamGitClone, &Empty {}).await
    }

    async fn stream_workspace(&self) -> Result<ByteStream, TunnelError> {
        self.call_stream(Method::StreamWorkspace, &Empty {}).await
    }

    async fn stream_mount(&self, request: StreamMountRequest) -> Result<ByteStream, TunnelError> {
        self.call_stream(Method::StreamMount, &request).await
    }
}
