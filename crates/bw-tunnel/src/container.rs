//! Multi-hop tunnel into a container
//!
//! 1. Inject the agent on the host and start `helper ssh-server --stdio`
//!    there, wired to an in-process pipe
//! 2. Dial an SSH client through that pipe (the host)
//! 3. On the host run `agent container-tunnel`, wired to a second pipe, and
//!    dial a second SSH client through it (the container)
//! 4. Hand the container client to the caller while a background task keeps
//!    the host's copy of the workspace info fresh
//!
//! Whichever of the outer tunnel and the workload finishes first decides
//! the result.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use bw_core::config::TunnelConfig;
use bw_core::WorkspaceInfo;
use bw_ssh::SshClient;

use crate::error::{OrchestrationError, Phase};
use crate::inject::{shell_quote, AgentInjector, InjectOptions};
use crate::io::{CommandIo, LogWriter};

/// Capacity of each in-process pipe between an SSH client and a remote command
const PIPE_CAPACITY: usize = 64 * 1024;

/// What the orchestrator needs to know about a workspace and its host
#[async_trait]
pub trait WorkspaceClient: Send + Sync {
    /// Path of the agent binary on the host
    fn agent_path(&self) -> String;

    /// Whether the host agent is this very binary
    fn agent_local(&self) -> bool;

    /// Where the host can download the agent from
    fn agent_url(&self) -> String;

    /// Directory the host agent keeps workspace state in
    fn agent_dir(&self) -> Option<String> {
        None
    }

    /// User the SSH hops authenticate as; empty means the server's own user
    fn ssh_user(&self) -> String {
        String::new()
    }

    /// Reload options that feed into the workspace info
    async fn refresh_options(&self) -> anyhow::Result<()>;

    async fn workspace_info(&self) -> anyhow::Result<WorkspaceInfo>;

    /// Run `command` on the host with the given stdio
    async fn command(&self, command: &str, io: CommandIo) -> anyhow::Result<()>;
}

pub struct ContainerTunnel {
    client: Arc<dyn WorkspaceClient>,
    injector: Arc<dyn AgentInjector>,
    config: TunnelConfig,
    debug: bool,
    span: tracing::Span,
}

impl ContainerTunnel {
    pub fn new(
        client: Arc<dyn WorkspaceClient>,
        injector: Arc<dyn AgentInjector>,
        config: TunnelConfig,
        span: tracing::Span,
    ) -> Self {
        Self {
            client,
            injector,
            config,
            debug: false,
            span,
        }
    }

    /// Start the remote SSH server with debug logging
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn inject_options(&self) -> InjectOptions {
        InjectOptions {
            local: self.client.agent_local(),
            remote_path: self.client.agent_path(),
            download_url: self.client.agent_url(),
            force_download: false,
            timeout: self.config.inject_timeout,
        }
    }

    fn server_command(&self) -> String {
        let mut command = format!(
            "{} helper ssh-server --stdio",
            shell_quote(&self.client.agent_path())
        );
        if self.debug {
            command.push_str(" --debug");
        }
        command
    }

    /// Run the tunnel and hand the container client to `handler`.
    ///
    /// Cancelling `cancel` aborts both branches, drops every pipe end and
    /// returns [`OrchestrationError::Cancelled`].
    pub async fn run<F, Fut>(&self, handler: F, cancel: CancellationToken) -> Result<(), OrchestrationError>
    where
        F: FnOnce(Arc<SshClient>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (host_end, server_end) = tokio::io::duplex(PIPE_CAPACITY);
        let mut branches: JoinSet<Result<(), OrchestrationError>> = JoinSet::new();

        let client = Arc::clone(&self.client);
        let injector = Arc::clone(&self.injector);
        let options = self.inject_options();
        let command = self.server_command();
        branches.spawn(
            async move {
                let (reader, writer) = tokio::io::split(server_end);
                let io = CommandIo::new(reader, writer, LogWriter::new("ssh-server"));
                injector
                    .inject_and_execute(client.as_ref(), &options, &command, io)
                    .await
                    .map_err(|e| OrchestrationError::failed(Phase::ConnectToServer, e))
            }
            .instrument(self.span.clone()),
        );

        let workload = Workload {
            client: Arc::clone(&self.client),
            config: self.config.clone(),
            span: self.span.clone(),
        };
        branches.spawn(
            async move {
                workload
                    .run(host_end, handler)
                    .await
                    .map_err(|e| OrchestrationError::failed(Phase::TunnelToHost, e))
            }
            .instrument(self.span.clone()),
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(OrchestrationError::Cancelled),
            Some(first) = branches.join_next() => match first {
                Ok(result) => result,
                Err(e) => Err(OrchestrationError::failed(Phase::TunnelToHost, e)),
            },
        };

        branches.shutdown().await;
        result
    }

    /// Push fresh workspace info to the host once
    pub async fn update_config(&self, host: &SshClient) -> anyhow::Result<()> {
        update_config(self.client.as_ref(), host).await
    }
}

/// Everything after the outer tunnel is up
struct Workload {
    client: Arc<dyn WorkspaceClient>,
    config: TunnelConfig,
    span: tracing::Span,
}

impl Workload {
    async fn run<F, Fut>(self, host_end: DuplexStream, handler: F) -> anyhow::Result<()>
    where
        F: FnOnce(Arc<SshClient>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let user = self.client.ssh_user();
        let host = SshClient::connect(host_end, &user, self.span.clone())
            .await
            .context("dial host")?;
        let host = Arc::new(host);

        let info = self.client.workspace_info().await?.encode()?;
        let command = format!(
            "{} agent container-tunnel --workspace-info {}",
            shell_quote(&self.client.agent_path()),
            shell_quote(&info)
        );

        let (container_end, tunnel_end) = tokio::io::duplex(PIPE_CAPACITY);
        let mut background = JoinSet::new();

        let tunnel_host = Arc::clone(&host);
        background.spawn(
            async move {
                let (reader, writer) = tokio::io::split(tunnel_end);
                if let Err(e) = tunnel_host
                    .run(&command, reader, writer, LogWriter::new("container-tunnel"))
                    .await
                {
                    tracing::debug!("Container tunnel ended: {}", e);
                }
            }
            .instrument(self.span.clone()),
        );

        if !self.config.proxy {
            background.spawn(
                refresh_loop(
                    Arc::clone(&self.client),
                    Arc::clone(&host),
                    self.config.refresh_interval,
                )
                .instrument(self.span.clone()),
            );
        }

        let result = async {
            let container = SshClient::connect(container_end, &user, self.span.clone())
                .await
                .context("dial container")?;
            handler(Arc::new(container))
                .await
                .map_err(|e| OrchestrationError::failed(Phase::RunInContainer, e))?;
            anyhow::Ok(())
        }
        .await;

        background.shutdown().await;
        host.disconnect().await;
        result
    }
}

async fn refresh_loop(
    client: Arc<dyn WorkspaceClient>,
    host: Arc<SshClient>,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = update_config(client.as_ref(), &host).await {
            tracing::error!("Error updating remote workspace: {:#}", e);
        }
    }
}

async fn update_config(client: &dyn WorkspaceClient, host: &SshClient) -> anyhow::Result<()> {
    client.refresh_options().await.context("refresh options")?;
    let info = client.workspace_info().await?.encode()?;

    let mut command = format!(
        "{} agent workspace update-config --workspace-info {}",
        shell_quote(&client.agent_path()),
        shell_quote(&info)
    );
    if let Some(dir) = client.agent_dir() {
        command.push_str(&format!(" --agent-dir {}", shell_quote(&dir)));
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    host.run(&command, tokio::io::empty(), &mut stdout, &mut stderr)
        .await
        .with_context(|| {
            format!(
                "update config: {}",
                String::from_utf8_lossy(&stderr).trim()
            )
        })?;
    tracing::debug!("Updated workspace config on host");
    Ok(())
}
