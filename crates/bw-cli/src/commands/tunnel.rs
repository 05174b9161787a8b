//! `burrow tunnel serve` and `burrow tunnel relay`
//!
//! Both speak the tunnel protocol on this process's stdin/stdout. `serve`
//! answers calls from local resources; `relay` sits between a caller and an
//! upstream `burrow tunnel serve` (or another relay) started as a child.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use bw_core::config::{RelayConfig, TunnelConfig};
use bw_core::{Listener, StdioListener};
use bw_protocol::message::ExecutionResult;
use bw_tunnel::host::GitCloneSource;
use bw_tunnel::{run_proxy_server, HostTunnel, TunnelClient, TunnelServer};

/// What `tunnel serve` offers to the caller
#[derive(Debug, Default, Clone)]
pub struct ServeArgs {
    pub workspace: Option<PathBuf>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub docker_config: Option<PathBuf>,
    pub show_logs: bool,
}

impl ServeArgs {
    fn host_tunnel(&self) -> HostTunnel {
        let mut tunnel = HostTunnel::new();
        if let Some(dir) = &self.workspace {
            tunnel = tunnel.with_workspace_dir(dir);
        }
        if let Some(repository) = &self.repository {
            tunnel = tunnel.with_git_clone(GitCloneSource {
                repository: repository.clone(),
                branch: self.branch.clone(),
            });
        }
        if let Some(path) = &self.docker_config {
            tunnel = tunnel.with_docker_config(path);
        }
        tunnel
    }
}

/// Serve the host tunnel until the caller disconnects or `cancel` fires
pub async fn serve_command(
    args: ServeArgs,
    config: &TunnelConfig,
    result_file: Option<&Path>,
    cancel: CancellationToken,
) -> Result<()> {
    let tunnel = Arc::new(args.host_tunnel());
    let listener = StdioListener::from_process(true);
    let serve_cancel = stop_on_done(&listener, &cancel);

    let server = TunnelServer::new(tunnel.clone(), tracing::info_span!("tunnel"))
        .with_logging(args.show_logs)
        .with_stream_buffer_size(config.stream_buffer_size);
    server.serve(&listener, serve_cancel).await?;
    listener.close().await;

    report_result(tunnel.result(), result_file).await
}

/// Relay between this process's stdio and `upstream`, a command speaking the
/// tunnel protocol on its own stdio
pub async fn relay_command(
    upstream: &[String],
    config: RelayConfig,
    tunnel: &TunnelConfig,
    result_file: Option<&Path>,
    cancel: CancellationToken,
) -> Result<()> {
    let Some((program, args)) = upstream.split_first() else {
        bail!("No upstream command given");
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start upstream {}", program))?;
    let child_stdin = child.stdin.take().context("upstream stdin is not piped")?;
    let child_stdout = child.stdout.take().context("upstream stdout is not piped")?;

    let (stream, _) = StdioListener::new(child_stdout, child_stdin, false)
        .with_label("upstream")
        .accept()
        .await?;
    let client = Arc::new(
        TunnelClient::connect(stream, tracing::info_span!("upstream"))
            .with_ping_timeout(tunnel.ping_timeout),
    );

    let result = run_proxy_server(
        tokio::io::stdin(),
        tokio::io::stdout(),
        client.clone(),
        config,
        cancel,
        tracing::info_span!("relay"),
    )
    .await?;

    client.close();
    match tokio::time::timeout(tunnel.ping_timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!("Upstream exited with {}", status),
        Ok(Err(e)) => tracing::debug!("Failed to wait for upstream: {}", e),
        Err(_) => {
            tracing::debug!("Upstream still running, killing it");
            let _ = child.kill().await;
        }
    }

    report_result(result, result_file).await
}

/// Child token of `cancel` that also fires when the listener's peer leaves
fn stop_on_done<R, W>(listener: &StdioListener<R, W>, cancel: &CancellationToken) -> CancellationToken
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let done = listener.done();
    let token = cancel.child_token();
    tokio::spawn({
        let token = token.clone();
        async move {
            tokio::select! {
                _ = done.cancelled() => token.cancel(),
                _ = token.cancelled() => {}
            }
        }
    });
    token
}

async fn report_result(result: Option<ExecutionResult>, result_file: Option<&Path>) -> Result<()> {
    let Some(result) = result else {
        tracing::info!("Session ended without a result");
        return Ok(());
    };

    tracing::info!("Received result for remote user '{}'", result.remote_user);
    if let Some(path) = result_file {
        let json = serde_json::to_vec_pretty(&result)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write result to {:?}", path))?;
    }
    Ok(())
}
