//! TCP and Unix socket forwarding in both directions

use std::sync::Arc;

use dashmap::DashMap;
use russh::server::{Handle, Msg};
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Active reverse-forward listeners of one connection, keyed by bind address
#[derive(Default, Clone)]
pub(crate) struct ForwardRegistry {
    listeners: Arc<DashMap<String, CancellationToken>>,
}

impl ForwardRegistry {
    fn insert(&self, key: String, token: CancellationToken) {
        if let Some(previous) = self.listeners.insert(key, token) {
            previous.cancel();
        }
    }

    /// Stop the listener bound at `key`; false if there was none
    pub(crate) fn cancel(&self, key: &str) -> bool {
        match self.listeners.remove(key) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }
}

pub(crate) fn tcp_key(address: &str, port: u32) -> String {
    format!("{}:{}", address, port)
}

fn bind_port(port: u32) -> std::io::Result<u16> {
    u16::try_from(port).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("port {} out of range", port),
        )
    })
}

/// Identity of a socket file we bound, so cleanup never removes a successor
#[cfg(unix)]
struct BoundSocket {
    path: String,
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
impl BoundSocket {
    fn capture(path: &str) -> std::io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::symlink_metadata(path)?;
        Ok(Self {
            path: path.to_string(),
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    /// Remove the file if it is still the one we created; true if removed
    fn remove(&self) -> bool {
        use std::os::unix::fs::MetadataExt;
        match std::fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.dev() == self.dev && meta.ino() == self.ino => {
                std::fs::remove_file(&self.path).is_ok()
            }
            Ok(_) => {
                tracing::debug!("{} was rebound, leaving it", self.path);
                false
            }
            Err(_) => false,
        }
    }
}

async fn splice<S>(channel: Channel<Msg>, mut stream: S, what: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut channel_stream = channel.into_stream();
    match tokio::io::copy_bidirectional(&mut channel_stream, &mut stream).await {
        Ok((up, down)) => tracing::debug!("Forward {} done ({} bytes up, {} down)", what, up, down),
        Err(e) => tracing::debug!("Forward {} ended: {}", what, e),
    }
}

/// `direct-tcpip`: connect to `host:port` and splice it onto `channel`
pub(crate) fn direct_tcpip(channel: Channel<Msg>, host: String, port: u32) {
    tracing::debug!("Accepted forward: {}:{}", host, port);
    tokio::spawn(async move {
        let target = tcp_key(&host, port);
        match TcpStream::connect(&target).await {
            Ok(stream) => splice(channel, stream, target).await,
            Err(e) => tracing::warn!("Failed to connect to {}: {}", target, e),
        }
    });
}

/// `direct-streamlocal@openssh.com`: connect to a Unix socket
#[cfg(unix)]
pub(crate) fn direct_streamlocal(channel: Channel<Msg>, socket_path: String) {
    tracing::debug!("Accepted socket forward: {}", socket_path);
    tokio::spawn(async move {
        match tokio::net::UnixStream::connect(&socket_path).await {
            Ok(stream) => splice(channel, stream, socket_path).await,
            Err(e) => tracing::warn!("Failed to connect to {}: {}", socket_path, e),
        }
    });
}

/// `tcpip-forward`: listen on `address:port` and open a `forwarded-tcpip`
/// channel back to the client for every connection.
///
/// A zero `port` is replaced by the port actually bound.
pub(crate) async fn reverse_tcpip(
    handle: Handle,
    address: &str,
    port: &mut u32,
    registry: &ForwardRegistry,
    parent: &CancellationToken,
) -> std::io::Result<()> {
    let bind_host = if address.is_empty() { "0.0.0.0" } else { address };
    let listener = TcpListener::bind((bind_host, bind_port(*port)?)).await?;
    if *port == 0 {
        *port = u32::from(listener.local_addr()?.port());
    }
    tracing::debug!("attempt to bind {}:{} - granted", address, port);

    let token = parent.child_token();
    registry.insert(tcp_key(address, *port), token.clone());

    let connected_address = address.to_string();
    let connected_port = *port;
    tokio::spawn(async move {
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept error on {}:{}: {}", connected_address, connected_port, e);
                        break;
                    }
                },
            };

            let handle = handle.clone();
            let connected_address = connected_address.clone();
            tokio::spawn(async move {
                match handle
                    .channel_open_forwarded_tcpip(
                        connected_address.clone(),
                        connected_port,
                        peer.ip().to_string(),
                        u32::from(peer.port()),
                    )
                    .await
                {
                    Ok(channel) => splice(channel, stream, tcp_key(&connected_address, connected_port)).await,
                    Err(e) => tracing::warn!("Failed to open forwarded-tcpip channel: {}", e),
                }
            });
        }
        tracing::debug!("Stopped forwarding {}:{}", connected_address, connected_port);
    });

    Ok(())
}

/// `streamlocal-forward@openssh.com`: listen on a Unix socket path.
///
/// An existing file at `socket_path` is removed first.
#[cfg(unix)]
pub(crate) async fn reverse_streamlocal(
    handle: Handle,
    socket_path: &str,
    registry: &ForwardRegistry,
    parent: &CancellationToken,
) -> std::io::Result<()> {
    tracing::debug!("attempt to bind socket {}", socket_path);
    if tokio::fs::symlink_metadata(socket_path).await.is_ok() {
        tracing::debug!("{} already exists, removing", socket_path);
        let _ = tokio::fs::remove_file(socket_path).await;
    }

    let listener = tokio::net::UnixListener::bind(socket_path)?;
    let bound = BoundSocket::capture(socket_path)?;
    let token = parent.child_token();
    registry.insert(socket_path.to_string(), token.clone());

    let path = socket_path.to_string();
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!("Accept error on {}: {}", path, e);
                        break;
                    }
                },
            };

            let handle = handle.clone();
            let path = path.clone();
            tokio::spawn(async move {
                match handle.channel_open_forwarded_streamlocal(path.clone()).await {
                    Ok(channel) => splice(channel, stream, path).await,
                    Err(e) => tracing::warn!("Failed to open forwarded-streamlocal channel: {}", e),
                }
            });
        }
        drop(listener);
        bound.remove();
        tracing::debug!("Stopped forwarding {}", path);
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_stops_registered_listener() {
        let registry = ForwardRegistry::default();
        let token = CancellationToken::new();
        registry.insert(tcp_key("127.0.0.1", 9000), token.clone());
        assert_eq!(registry.len(), 1);

        assert!(registry.cancel("127.0.0.1:9000"));
        assert!(token.is_cancelled());
        assert_eq!(registry.len(), 0);
        assert!(!registry.cancel("127.0.0.1:9000"));
    }

    #[test]
    fn test_rebinding_same_key_cancels_previous() {
        let registry = ForwardRegistry::default();
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        registry.insert("/tmp/agent.sock".to_string(), first.clone());
        registry.insert("/tmp/agent.sock".to_string(), second.clone());

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_port_above_u16_is_rejected() {
        assert_eq!(bind_port(0).unwrap(), 0);
        assert_eq!(bind_port(65535).unwrap(), 65535);
        let err = bind_port(65536).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[cfg(unix)]
    #[test]
    fn test_cleanup_leaves_rebound_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let path = path.to_str().unwrap();

        let first = std::os::unix::net::UnixListener::bind(path).unwrap();
        let first_bound = BoundSocket::capture(path).unwrap();

        std::fs::remove_file(path).unwrap();
        let _second = std::os::unix::net::UnixListener::bind(path).unwrap();
        drop(first);

        assert!(!first_bound.remove());
        assert!(std::path::Path::new(path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_cleanup_removes_own_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let path = path.to_str().unwrap();

        let listener = std::os::unix::net::UnixListener::bind(path).unwrap();
        let bound = BoundSocket::capture(path).unwrap();
        drop(listener);

        assert!(bound.remove());
        assert!(!std::path::Path::new(path).exists());
    }
}
