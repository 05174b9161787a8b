//! Single-connection listener over a reader/writer pair

use async_trait::async_trait;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, Stdin, Stdout};
use tokio_util::sync::CancellationToken;

use super::stream::StdioStream;
use crate::error::TransportError;
use crate::traits::Listener;

/// Listener handing out one [`StdioStream`]
///
/// The first `accept` returns the connection immediately. Every later
/// `accept` waits until [`close`](Listener::close) is called and then fails
/// with [`TransportError::ListenerClosed`].
pub struct StdioListener<R, W> {
    conn: Mutex<Option<StdioStream<R, W>>>,
    closed: CancellationToken,
    done: CancellationToken,
    label: String,
}

impl<R, W> StdioListener<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Build a listener over `reader` and `writer`.
    ///
    /// With `exit_on_close`, end-of-stream on the reader fires [`done`](Self::done)
    /// so the owner can shut down.
    pub fn new(reader: R, writer: W, exit_on_close: bool) -> Self {
        let closed = CancellationToken::new();
        let done = CancellationToken::new();
        let eof = exit_on_close.then(|| done.clone());
        Self {
            conn: Mutex::new(Some(StdioStream::new(reader, writer, closed.clone(), eof))),
            closed,
            done,
            label: "pipe".to_string(),
        }
    }

    /// Override the label reported by `addr`
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Fires when the reader reaches end-of-stream (only with `exit_on_close`)
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn take_conn(&self) -> Option<StdioStream<R, W>> {
        match self.conn.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl StdioListener<Stdin, Stdout> {
    /// Listener over this process's stdin and stdout
    pub fn from_process(exit_on_close: bool) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), exit_on_close).with_label("process")
    }
}

#[async_trait]
impl<R, W> Listener for StdioListener<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Conn = StdioStream<R, W>;

    async fn accept(&self) -> Result<(Self::Conn, String), TransportError> {
        if !self.closed.is_cancelled() {
            if let Some(conn) = self.take_conn() {
                return Ok((conn, self.addr()));
            }
        }
        self.closed.cancelled().await;
        Err(TransportError::ListenerClosed(self.addr()))
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Some(conn) = self.take_conn() {
            let (_reader, mut writer) = conn.into_inner();
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Ignoring error closing stdio writer: {}", e);
            }
        }
    }

    fn addr(&self) -> String {
        format!("stdio:{}", self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_accept_returns_connection_then_blocks_until_close() {
        let (_client, server) = duplex(64);
        let (reader, writer) = tokio::io::split(server);
        let listener = Arc::new(StdioListener::new(reader, writer, false));

        let (_conn, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, "stdio:pipe");

        let second = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        listener.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::ListenerClosed(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_client, server) = duplex(64);
        let (reader, writer) = tokio::io::split(server);
        let listener = StdioListener::new(reader, writer, false);

        listener.close().await;
        listener.close().await;
        assert!(listener.is_closed());
        assert!(listener.accept().await.is_err());
    }

    #[tokio::test]
    async fn test_close_before_accept_shuts_down_writer() {
        let (mut client, server) = duplex(64);
        let (reader, writer) = tokio::io::split(server);
        let listener = StdioListener::new(reader, writer, false);

        listener.close().await;
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_connection_carries_bytes_both_ways() {
        let (mut client, server) = duplex(64);
        let (reader, writer) = tokio::io::split(server);
        let listener = StdioListener::new(reader, writer, false);
        let (mut conn, _) = listener.accept().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_end_of_stream_fires_done_with_exit_on_close() {
        let (client, server) = duplex(64);
        let (reader, writer) = tokio::io::split(server);
        let listener = StdioListener::new(reader, writer, true);
        let done = listener.done();
        let (mut conn, _) = listener.accept().await.unwrap();

        drop(client);
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), done.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_end_of_stream_without_exit_on_close_leaves_done() {
        let (client, server) = duplex(64);
        let (reader, writer) = tokio::io::split(server);
        let listener = StdioListener::new(reader, writer, false);
        let done = listener.done();
        let (mut conn, _) = listener.accept().await.unwrap();

        drop(client);
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.unwrap();
        assert!(!done.is_cancelled());
    }

    #[tokio::test]
    async fn test_writes_fail_after_close() {
        let (_client, server) = duplex(64);
        let (reader, writer) = tokio::io::split(server);
        let listener = StdioListener::new(reader, writer, false);
        let (mut conn, _) = listener.accept().await.unwrap();

        listener.close().await;
        let err = conn.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
