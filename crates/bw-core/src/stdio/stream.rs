//! The single synthetic connection of a stdio listener

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

/// A reader and a writer joined into one duplex stream
///
/// Once the owning listener is closed reads return end-of-stream and writes
/// fail with `BrokenPipe`. When constructed with an end-of-stream token,
/// reaching end-of-stream on the reader cancels it.
pub struct StdioStream<R, W> {
    reader: R,
    writer: W,
    closed: CancellationToken,
    eof: Option<CancellationToken>,
}

impl<R, W> StdioStream<R, W> {
    pub(crate) fn new(
        reader: R,
        writer: W,
        closed: CancellationToken,
        eof: Option<CancellationToken>,
    ) -> Self {
        Self {
            reader,
            writer,
            closed,
            eof,
        }
    }

    /// Split back into the underlying halves
    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for StdioStream<R, W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed.is_cancelled() {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.reader).poll_read(cx, buf))?;

        if buf.filled().len() == before && buf.remaining() > 0 {
            if let Some(eof) = &this.eof {
                if !eof.is_cancelled() {
                    tracing::debug!("stdio reader reached end of stream");
                    eof.cancel();
                }
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for StdioStream<R, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stdio listener closed",
            )));
        }
        Pin::new(&mut this.writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}
