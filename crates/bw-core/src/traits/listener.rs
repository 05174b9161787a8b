//! Listener abstraction shared by the tunnel RPC server and the SSH server

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Source of inbound connections
///
/// `accept` blocks until a connection is available or the listener is
/// closed; `close` must be safe to call concurrently with a blocked
/// `accept` and more than once.
#[async_trait]
pub trait Listener: Send + Sync {
    /// The connection type handed out by `accept`
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection, returning it with a peer description
    async fn accept(&self) -> Result<(Self::Conn, String), TransportError>;

    /// Stop accepting; pending and later `accept` calls fail
    async fn close(&self);

    /// Human-readable listening address
    fn addr(&self) -> String;
}

/// TCP implementation of [`Listener`]
pub struct TcpAcceptor {
    inner: TcpListener,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl TcpAcceptor {
    /// Bind to `addr`. `io::ErrorKind::AddrInUse` is passed through untouched
    /// so callers can tell an occupied port apart from other failures.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> std::io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            inner,
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    /// The bound socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    type Conn = TcpStream;

    async fn accept(&self) -> Result<(TcpStream, String), TransportError> {
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(TransportError::ListenerClosed(self.addr()))
            }
            result = self.inner.accept() => {
                let (stream, peer) = result?;
                Ok((stream, peer.to_string()))
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn addr(&self) -> String {
        self.local_addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tcp_accept_and_close() {
        let listener = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_conn, peer) = listener.accept().await.unwrap();
        assert!(peer.starts_with("127.0.0.1:"));
        client.await.unwrap();

        listener.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .unwrap();
        assert!(matches!(result, Err(TransportError::ListenerClosed(_))));
    }

    #[tokio::test]
    async fn test_bind_in_use_reports_addr_in_use() {
        let first = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let err = TcpAcceptor::bind(first.local_addr()).await.err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
    }
}
