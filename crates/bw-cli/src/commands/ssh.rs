//! `burrow ssh`: tunnel into a workspace container and run a command there

use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use bw_core::config::TunnelConfig;
use bw_core::WorkspaceInfo;
use bw_ssh::{SshClient, SshError};
use bw_tunnel::host::PortForwarder;
use bw_tunnel::inject::shell_quote;
use bw_tunnel::{CommandIo, ContainerTunnel, OrchestrationError, ScriptInjector, WorkspaceClient};

use super::agent::decode_workspace_info;

#[derive(Debug, Clone)]
pub struct SshArgs {
    /// Prefix that runs a command on the host, e.g. `ssh devbox`; empty runs locally
    pub host_command: String,
    pub workspace_info: String,
    pub agent_path: String,
    pub agent_url: String,
    /// The host agent is this binary; its checksum is verified remotely
    pub local_agent: bool,
    pub agent_dir: Option<String>,
    pub user: Option<String>,
    pub forward_ports: Vec<String>,
    pub command: Vec<String>,
}

/// Workspace reached by prefixing every host command with `host_command`
pub struct HostCommandClient {
    host_command: String,
    info: WorkspaceInfo,
    agent_path: String,
    agent_url: String,
    agent_local: bool,
    agent_dir: Option<String>,
    user: String,
}

impl HostCommandClient {
    pub fn new(args: &SshArgs, info: WorkspaceInfo) -> Self {
        Self {
            host_command: args.host_command.trim().to_string(),
            info,
            agent_path: args.agent_path.clone(),
            agent_url: args.agent_url.clone(),
            agent_local: args.local_agent,
            agent_dir: args.agent_dir.clone(),
            user: args.user.clone().unwrap_or_default(),
        }
    }

    /// Full shell line that runs `command` on the host
    pub fn host_line(&self, command: &str) -> String {
        if self.host_command.is_empty() {
            command.to_string()
        } else {
            format!("{} {}", self.host_command, shell_quote(command))
        }
    }
}

#[async_trait]
impl WorkspaceClient for HostCommandClient {
    fn agent_path(&self) -> String {
        self.agent_path.clone()
    }

    fn agent_local(&self) -> bool {
        self.agent_local
    }

    fn agent_url(&self) -> String {
        self.agent_url.clone()
    }

    fn agent_dir(&self) -> Option<String> {
        self.agent_dir.clone()
    }

    fn ssh_user(&self) -> String {
        self.user.clone()
    }

    async fn refresh_options(&self) -> Result<()> {
        Ok(())
    }

    async fn workspace_info(&self) -> Result<WorkspaceInfo> {
        Ok(self.info.clone())
    }

    async fn command(&self, command: &str, io: CommandIo) -> Result<()> {
        let line = self.host_line(command);
        tracing::debug!("Host command: {}", line);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start host command")?;

        let mut child_stdin = child.stdin.take().context("host stdin is not piped")?;
        let mut child_stdout = child.stdout.take().context("host stdout is not piped")?;
        let mut child_stderr = child.stderr.take().context("host stderr is not piped")?;
        let CommandIo {
            mut stdin,
            mut stdout,
            mut stderr,
        } = io;

        // stdin may never end, so it must not hold up the exit
        let input = tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stdin, &mut child_stdin).await {
                tracing::debug!("Host stdin copy ended: {}", e);
            }
            let _ = child_stdin.shutdown().await;
        });
        let output = async {
            tokio::io::copy(&mut child_stdout, &mut stdout).await?;
            stdout.flush().await
        };
        let errors = async {
            tokio::io::copy(&mut child_stderr, &mut stderr).await?;
            stderr.flush().await
        };

        let (status, output, errors) = tokio::join!(child.wait(), output, errors);
        input.abort();

        let status = status.context("Failed to wait for host command")?;
        if let Err(e) = output.and(errors) {
            tracing::debug!("Host output copy ended: {}", e);
        }
        if !status.success() {
            bail!("host command exited with {}", status);
        }
        Ok(())
    }
}

/// Run the orchestrated session; the remote exit status becomes ours
pub async fn ssh_command(
    args: SshArgs,
    config: TunnelConfig,
    debug: bool,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let info = decode_workspace_info(&args.workspace_info)?;
    if args.command.is_empty() && args.forward_ports.is_empty() {
        bail!("Nothing to do: give a command or at least one --forward-port");
    }

    let injector = if args.local_agent {
        let exe: PathBuf = std::env::current_exe().context("Failed to locate this binary")?;
        ScriptInjector::with_local_binary(&exe)
            .with_context(|| format!("Failed to hash {:?}", exe))?
    } else {
        ScriptInjector::new()
    };

    let client = Arc::new(HostCommandClient::new(&args, info));
    let tunnel = ContainerTunnel::new(
        client,
        Arc::new(injector),
        config,
        tracing::info_span!("ssh"),
    )
    .with_debug(debug);

    let status = Arc::new(AtomicU32::new(0));
    let handler = {
        let status = Arc::clone(&status);
        let command = args
            .command
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        let forward_ports = args.forward_ports.clone();
        let cancel = cancel.clone();
        move |container: Arc<SshClient>| async move {
            let forwards = cancel.child_token();
            let _stop_forwards = forwards.clone().drop_guard();
            let forwarder = PortForwarder::new(Arc::clone(&container), forwards);
            for spec in &forward_ports {
                forwarder
                    .forward(spec)
                    .await
                    .with_context(|| format!("forward {}", spec))?;
            }

            if command.is_empty() {
                tracing::info!("Forwarding {} until interrupted", forward_ports.join(", "));
                cancel.cancelled().await;
                return anyhow::Ok(());
            }

            let code = match container
                .run(
                    &command,
                    tokio::io::stdin(),
                    tokio::io::stdout(),
                    tokio::io::stderr(),
                )
                .await
            {
                Ok(()) => 0,
                Err(SshError::ExitCode(code)) => code,
                Err(SshError::NoExitStatus) => 1,
                Err(e) => return Err(e.into()),
            };
            status.store(code, Ordering::SeqCst);
            container.disconnect().await;
            anyhow::Ok(())
        }
    };

    match tunnel.run(handler, cancel).await {
        Ok(()) => {
            let code = status.load(Ordering::SeqCst);
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        Err(OrchestrationError::Cancelled) => {
            tracing::info!("Cancelled");
            Ok(ExitCode::from(130))
        }
        Err(e) => Err(e.into()),
    }
}
