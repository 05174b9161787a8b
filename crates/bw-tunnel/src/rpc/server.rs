//! Tunnel RPC server
//!
//! Serves a [`Tunnel`] implementation over a single connection. Every
//! request runs on its own task, all frames leave through one writer task,
//! and a failing call only fails that call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use bw_core::Listener;
use bw_protocol::message::{Empty, LogMessage, Message, StreamMountRequest};
use bw_protocol::{CallId, Envelope, Frame, FrameCodec, Method};

use super::service::{ByteStream, Tunnel};
use super::stream::{copy_stream, ChunkWriter};
use crate::error::TunnelError;

/// Outbound frames queued before call tasks are paused
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Default size of the buffer in front of streamed responses
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 10 * 1024;

/// How long in-flight calls may finish after the peer stopped sending
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of dispatching one call
pub(crate) enum Reply {
    Unary(String),
    Stream(ByteStream),
}

pub struct TunnelServer {
    service: Arc<dyn Tunnel>,
    show_logs: bool,
    stream_buffer_size: usize,
    span: tracing::Span,
}

impl TunnelServer {
    pub fn new(service: Arc<dyn Tunnel>, span: tracing::Span) -> Self {
        Self {
            service,
            show_logs: false,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            span,
        }
    }

    /// Log every call and every failed call
    pub fn with_logging(mut self, show_logs: bool) -> Self {
        self.show_logs = show_logs;
        self
    }

    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size.max(1);
        self
    }

    /// Accept one connection from `listener` and serve it.
    ///
    /// Returns when the connection closes or `cancel` fires. The listener is
    /// closed on the way out.
    pub async fn serve<L: Listener>(
        &self,
        listener: &L,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                listener.close().await;
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let result = match accepted {
            Ok((conn, peer)) => {
                tracing::debug!(parent: &self.span, "Serving tunnel on {}", peer);
                self.serve_connection(conn, cancel).await
            }
            Err(e) => Err(e.into()),
        };
        listener.close().await;
        result
    }

    /// Serve calls arriving on `stream` until it closes or `cancel` fires
    pub async fn serve_connection<S>(
        &self,
        stream: S,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut frames = FramedRead::new(reader, FrameCodec::new());
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let writer_task = tokio::spawn(
            write_frames(FramedWrite::new(writer, FrameCodec::new()), rx)
                .instrument(self.span.clone()),
        );

        let mut calls: JoinSet<CallId> = JoinSet::new();
        let mut in_flight: HashMap<CallId, AbortHandle> = HashMap::new();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(false),

                Some(finished) = calls.join_next() => {
                    if let Ok(call_id) = finished {
                        in_flight.remove(&call_id);
                    }
                }

                frame = frames.next() => match frame {
                    None => break Ok(true),
                    Some(Err(e)) => break Err(TunnelError::from(e)),
                    Some(Ok(frame)) => self.handle_frame(frame, &tx, &mut calls, &mut in_flight),
                },
            }
        };

        // A peer that stopped sending may still be waiting for answers
        if matches!(result, Ok(true)) && !calls.is_empty() {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while calls.join_next().await.is_some() {}
            })
            .await;
        }
        calls.shutdown().await;
        drop(tx);
        let _ = writer_task.await;

        tracing::debug!(parent: &self.span, "Tunnel connection closed");
        result.map(|_| ())
    }

    fn handle_frame(
        &self,
        frame: Frame,
        tx: &mpsc::Sender<Frame>,
        calls: &mut JoinSet<CallId>,
        in_flight: &mut HashMap<CallId, AbortHandle>,
    ) {
        let call_id = frame.call_id;
        match frame.envelope {
            Envelope::Request { method, payload } => {
                let call = Call {
                    id: call_id,
                    method,
                    service: Arc::clone(&self.service),
                    tx: tx.clone(),
                    show_logs: self.show_logs,
                    stream_buffer_size: self.stream_buffer_size,
                };
                let handle = calls.spawn(call.run(payload).instrument(self.span.clone()));
                if let Some(previous) = in_flight.insert(call_id, handle) {
                    tracing::warn!("Duplicate {}, aborting the earlier one", call_id);
                    previous.abort();
                }
            }
            Envelope::Cancel => {
                if let Some(handle) = in_flight.remove(&call_id) {
                    tracing::debug!("Caller cancelled {}", call_id);
                    handle.abort();
                }
            }
            other => {
                tracing::warn!("Ignoring unexpected {:?} frame for {}", other.kind(), call_id);
            }
        }
    }
}

async fn write_frames<W>(mut sink: FramedWrite<W, FrameCodec>, mut rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            tracing::debug!("Tunnel write failed: {}", e);
            return;
        }
    }
    let _ = sink.close().await;
}

/// One request being answered
struct Call {
    id: CallId,
    method: Method,
    service: Arc<dyn Tunnel>,
    tx: mpsc::Sender<Frame>,
    show_logs: bool,
    stream_buffer_size: usize,
}

impl Call {
    async fn run(self, payload: String) -> CallId {
        if self.show_logs {
            tracing::debug!("Received {} request", self.method);
        }

        let envelope = match dispatch(self.service.as_ref(), self.method, &payload).await {
            Ok(Reply::Unary(payload)) => Envelope::Response { payload },
            Ok(Reply::Stream(stream)) => {
                let writer = ChunkWriter::new(self.id, self.tx.clone());
                match copy_stream(stream, writer, self.stream_buffer_size).await {
                    Ok(total) => {
                        tracing::trace!("Streamed {} bytes for {}", total, self.method);
                        Envelope::StreamEnd
                    }
                    Err(e) => self.failed(e),
                }
            }
            Err(e) => self.failed(e),
        };

        let _ = self.tx.send(Frame::new(self.id, envelope)).await;
        self.id
    }

    fn failed(&self, err: TunnelError) -> Envelope {
        if self.show_logs {
            tracing::error!("Error in {}: {}", self.method, err);
        }
        Envelope::Error {
            code: err.code(),
            message: err.message(),
        }
    }
}

fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, TunnelError> {
    serde_json::from_str(payload).map_err(|e| TunnelError::invalid_argument(e.to_string()))
}

fn unary<T: Serialize>(message: &T) -> Result<Reply, TunnelError> {
    Ok(Reply::Unary(serde_json::to_string(message)?))
}

/// Route one request to the matching `Tunnel` operation
pub(crate) async fn dispatch(
    service: &dyn Tunnel,
    method: Method,
    payload: &str,
) -> Result<Reply, TunnelError> {
    match method {
        Method::Ping => {
            service.ping().await?;
            unary(&Empty {})
        }
        Method::ForwardPort => unary(&service.forward_port(decode(payload)?).await?),
        Method::StopForwardPort => unary(&service.stop_forward_port(decode(payload)?).await?),
        Method::DockerCredentials => {
            unary(&service.docker_credentials(decode::<Message>(payload)?).await?)
        }
        Method::GitUser => unary(&service.git_user().await?),
        Method::GitCredentials => unary(&service.git_credentials(decode::<Message>(payload)?).await?),
        Method::GitSshSignature => {
            unary(&service.git_ssh_signature(decode::<Message>(payload)?).await?)
        }
        Method::Log => {
            service.log(decode::<LogMessage>(payload)?).await?;
            unary(&Empty {})
        }
        Method::SendResult => {
            service.send_result(decode::<Message>(payload)?).await?;
            unary(&Empty {})
        }
        Method::StreamGitClone => Ok(Reply::Stream(service.stream_git_clone().await?)),
        Method::StreamWorkspace => Ok(Reply::Stream(service.stream_workspace().await?)),
        Method::StreamMount => Ok(Reply::Stream(
            service.stream_mount(decode::<StreamMountRequest>(payload)?).await?,
        )),
    }
}
