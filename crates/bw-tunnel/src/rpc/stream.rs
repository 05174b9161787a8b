//! Byte-stream plumbing for streaming calls

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::PollSender;

use bw_protocol::{CallId, Envelope, Frame};

use super::service::ByteStream;
use crate::error::TunnelError;

/// Largest chunk a single write turns into
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Writer turning every write into a `Chunk` frame of one call
///
/// Backpressure comes from the bounded frame channel.
pub struct ChunkWriter {
    call_id: CallId,
    sender: PollSender<Frame>,
}

impl ChunkWriter {
    pub fn new(call_id: CallId, sender: mpsc::Sender<Frame>) -> Self {
        Self {
            call_id,
            sender: PollSender::new(sender),
        }
    }
}

fn channel_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel writer closed")
}

impl AsyncWrite for ChunkWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.sender.poll_reserve(cx)).map_err(|_| channel_closed())?;

        let n = buf.len().min(MAX_CHUNK_SIZE);
        let frame = Frame::new(this.call_id, Envelope::Chunk(Bytes::copy_from_slice(&buf[..n])));
        this.sender.send_item(frame).map_err(|_| channel_closed())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().sender.close();
        Poll::Ready(Ok(()))
    }
}

/// Copy `stream` into `writer` through a buffer of `buffer_size` bytes.
///
/// The buffer is flushed at the end so a partial final chunk is not lost.
pub async fn copy_stream<W>(
    mut stream: ByteStream,
    writer: W,
    buffer_size: usize,
) -> Result<u64, TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::with_capacity(buffer_size, writer);
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    writer.flush().await?;
    Ok(total)
}

/// Stream the output of a reader
pub fn byte_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + 'static,
{
    Box::pin(ReaderStream::new(reader).map(|chunk| chunk.map_err(TunnelError::from)))
}

/// Read a byte stream as an `AsyncRead`
pub fn into_reader(stream: ByteStream) -> impl AsyncRead + Send + Unpin {
    StreamReader::new(stream.map(|chunk| chunk.map_err(io::Error::from)))
}
