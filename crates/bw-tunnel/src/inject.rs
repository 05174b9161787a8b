//! Getting the agent binary onto the far side of a hop
//!
//! [`ScriptInjector`] runs the command behind a POSIX shell preamble that
//! downloads the agent when it is missing, stale or a download is forced.
//! The preamble announces its end on stderr so the injection timeout bounds
//! only the download, never the command itself.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;

use crate::container::WorkspaceClient;
use crate::io::{BoxedWriter, CommandIo};

/// Line the preamble writes to stderr once the agent is in place
const INJECTED_MARKER: &str = "__burrow_agent_ready__";

/// Where the agent lives and how to get it
#[derive(Debug, Clone)]
pub struct InjectOptions {
    /// The agent is this very binary, so its checksum must match
    pub local: bool,
    /// Agent path on the far side
    pub remote_path: String,
    /// Download location used when the agent is missing or stale
    pub download_url: String,
    pub force_download: bool,
    /// Bounds the injection phase only
    pub timeout: Duration,
}

#[async_trait]
pub trait AgentInjector: Send + Sync {
    /// Make sure the agent exists on the far side, then run `command` there
    async fn inject_and_execute(
        &self,
        client: &dyn WorkspaceClient,
        options: &InjectOptions,
        command: &str,
        io: CommandIo,
    ) -> anyhow::Result<()>;
}

/// Quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, Default)]
pub struct ScriptInjector {
    /// SHA-256 of the local agent binary, checked against the remote one
    local_checksum: Option<String>,
}

impl ScriptInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare remote agents against the binary at `path`
    pub fn with_local_binary(path: &Path) -> io::Result<Self> {
        let binary = std::fs::read(path)?;
        Ok(Self {
            local_checksum: Some(hex::encode(Sha256::digest(&binary))),
        })
    }

    /// Shell script that injects the agent and then `exec`s `command`
    pub fn script(&self, options: &InjectOptions, command: &str) -> String {
        let checksum = if options.local {
            self.local_checksum.clone().unwrap_or_default()
        } else {
            String::new()
        };

        format!(
            r#"set -e
agent={agent}
url={url}
expected={checksum}
force={force}
needs_download() {{
  [ "$force" = true ] && return 0
  [ -x "$agent" ] || return 0
  if [ -n "$expected" ]; then
    actual=$(sha256sum "$agent" 2>/dev/null | cut -d' ' -f1)
    [ "$actual" = "$expected" ] || return 0
  fi
  return 1
}}
if needs_download; then
  mkdir -p "$(dirname "$agent")"
  if command -v curl >/dev/null 2>&1; then
    curl -fsSL "$url" -o "$agent.tmp"
  elif command -v wget >/dev/null 2>&1; then
    wget -q -O "$agent.tmp" "$url"
  else
    echo "neither curl nor wget is available to download $url" >&2
    exit 1
  fi
  chmod +x "$agent.tmp"
  mv -f "$agent.tmp" "$agent"
fi
echo {marker} >&2
exec {command}
"#,
            agent = shell_quote(&options.remote_path),
            url = shell_quote(&options.download_url),
            checksum = shell_quote(&checksum),
            force = if options.force_download { "true" } else { "false" },
            marker = INJECTED_MARKER,
            command = command,
        )
    }
}

#[async_trait]
impl AgentInjector for ScriptInjector {
    async fn inject_and_execute(
        &self,
        client: &dyn WorkspaceClient,
        options: &InjectOptions,
        command: &str,
        io: CommandIo,
    ) -> anyhow::Result<()> {
        let script = self.script(options, command);
        let (injected_tx, mut injected_rx) = oneshot::channel();
        let io = CommandIo {
            stderr: Box::new(MarkerWriter::new(io.stderr, injected_tx)),
            ..io
        };

        let wrapped = format!("sh -c {}", shell_quote(&script));
        let run = client.command(&wrapped, io);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result.context("inject agent"),
            Ok(()) = &mut injected_rx => {
                tracing::debug!("Agent ready at {}", options.remote_path);
            }
            _ = tokio::time::sleep(options.timeout) => {
                anyhow::bail!("timed out after {:?} injecting agent", options.timeout);
            }
        }

        run.await
    }
}

/// Stderr wrapper that swallows the preamble's output up to the ready marker
struct MarkerWriter {
    inner: BoxedWriter,
    pending: Vec<u8>,
    signal: Option<oneshot::Sender<()>>,
}

impl MarkerWriter {
    fn new(inner: BoxedWriter, signal: oneshot::Sender<()>) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            signal: Some(signal),
        }
    }

    /// Write out bytes that followed the marker in the same write
    fn poll_backlog(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.drain(..n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MarkerWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.signal.is_some() {
            this.pending.extend_from_slice(buf);
            while let Some(end) = this.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = this.pending.drain(..=end).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end();
                if line == INJECTED_MARKER {
                    if let Some(signal) = this.signal.take() {
                        let _ = signal.send(());
                    }
                    break;
                }
                if !line.is_empty() {
                    tracing::debug!("inject: {}", line);
                }
            }
            return Poll::Ready(Ok(buf.len()));
        }

        ready!(this.poll_backlog(cx))?;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.signal.is_none() {
            ready!(this.poll_backlog(cx))?;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.signal.is_none() {
            ready!(this.poll_backlog(cx))?;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
