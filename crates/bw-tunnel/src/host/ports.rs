//! Local listeners relayed through an SSH connection

use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use bw_ssh::SshClient;

use crate::error::TunnelError;

/// Where a forwarded port listens and connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    Tcp { host: String, port: u16 },
    Unix(String),
}

impl PortSpec {
    /// Parse `host:port`, `:port`, a bare port, or an absolute socket path
    pub fn parse(spec: &str) -> Result<Self, TunnelError> {
        let spec = spec.trim();
        if spec.starts_with('/') {
            return Ok(PortSpec::Unix(spec.to_string()));
        }

        let (host, port) = match spec.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => ("", spec),
        };
        let port: u16 = port
            .parse()
            .map_err(|_| TunnelError::invalid_argument(format!("invalid port {:?}", spec)))?;
        let host = if host.is_empty() { "localhost" } else { host };
        Ok(PortSpec::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

/// Forwards local ports to the same address on the far side of an SSH client
pub struct PortForwarder {
    client: Arc<SshClient>,
    active: DashMap<String, CancellationToken>,
    cancel: CancellationToken,
}

impl PortForwarder {
    pub fn new(client: Arc<SshClient>, cancel: CancellationToken) -> Self {
        Self {
            client,
            active: DashMap::new(),
            cancel,
        }
    }

    /// Start forwarding `spec`; forwarding an already forwarded spec is a no-op
    pub async fn forward(&self, spec: &str) -> Result<(), TunnelError> {
        if self.active.contains_key(spec) {
            return Ok(());
        }

        let token = self.cancel.child_token();
        match PortSpec::parse(spec)? {
            PortSpec::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), port)).await?;
                tracing::info!("Forwarding {}:{}", host, port);
                tokio::spawn(accept_tcp(listener, Arc::clone(&self.client), host, port, token.clone()));
            }
            PortSpec::Unix(path) => self.forward_unix(path, token.clone()).await?,
        }
        self.active.insert(spec.to_string(), token);
        Ok(())
    }

    #[cfg(unix)]
    async fn forward_unix(&self, path: String, token: CancellationToken) -> Result<(), TunnelError> {
        let _ = tokio::fs::remove_file(&path).await;
        let listener = tokio::net::UnixListener::bind(&path)?;
        tracing::info!("Forwarding socket {}", path);
        tokio::spawn(accept_unix(listener, Arc::clone(&self.client), path, token));
        Ok(())
    }

    #[cfg(not(unix))]
    async fn forward_unix(&self, path: String, _token: CancellationToken) -> Result<(), TunnelError> {
        Err(TunnelError::invalid_argument(format!(
            "socket forwarding of {} needs a unix host",
            path
        )))
    }

    /// Stop forwarding `spec`; unknown specs are ignored
    pub fn stop(&self, spec: &str) {
        if let Some((_, token)) = self.active.remove(spec) {
            tracing::info!("Stopped forwarding {}", spec);
            token.cancel();
        }
    }

    pub fn active(&self) -> Vec<String> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }
}

async fn accept_tcp(
    listener: TcpListener,
    client: Arc<SshClient>,
    host: String,
    port: u16,
    token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!("Accept on {}:{} failed: {}", host, port, e);
                    break;
                }
            },
        };
        let client = Arc::clone(&client);
        let host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_tcp(stream, &client, &host, port).await {
                tracing::debug!("Forward to {}:{} ended: {}", host, port, e);
            }
        });
    }
}

async fn relay_tcp(
    mut stream: TcpStream,
    client: &SshClient,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let mut remote = client.direct_tcpip(host, port).await?;
    tokio::io::copy_bidirectional(&mut stream, &mut remote).await?;
    Ok(())
}

#[cfg(unix)]
async fn accept_unix(
    listener: tokio::net::UnixListener,
    client: Arc<SshClient>,
    path: String,
    token: CancellationToken,
) {
    loop {
        let mut stream = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!("Accept on {} failed: {}", path, e);
                    break;
                }
            },
        };
        let client = Arc::clone(&client);
        let path = path.clone();
        tokio::spawn(async move {
            let relayed = async {
                let mut remote = client.direct_streamlocal(&path).await?;
                tokio::io::copy_bidirectional(&mut stream, &mut remote).await?;
                anyhow::Ok(())
            };
            if let Err(e) = relayed.await {
                tracing::debug!("Forward to {} ended: {}", path, e);
            }
        });
    }
    let _ = tokio::fs::remove_file(&path).await;
}
