//! burrow CLI
//!
//! Single binary for every hop of a nested tunnel:
//! - `helper ssh-server`: the embedded SSH server, usually over stdio
//! - `agent ...`: host-side commands the orchestrator runs
//! - `tunnel serve` / `tunnel relay`: the tunnel RPC service and a relay hop
//! - `ssh`: the orchestrator itself

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use bw_core::config::{ConfigFile, RelayConfig};
use burrow::commands::{self, ServeArgs, SshArgs, SshServerArgs};
use burrow::{logging, shutdown};

#[derive(Parser)]
#[command(name = "burrow")]
#[command(author, version, about = "Nested tunnels and remote terminals over any byte stream")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Helper processes started on the far side of a hop
    Helper {
        #[command(subcommand)]
        action: HelperAction,
    },

    /// Host-side agent commands
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Tunnel RPC service on stdio
    Tunnel {
        #[command(subcommand)]
        action: TunnelAction,
    },

    /// Tunnel into a workspace container and run a command
    Ssh {
        /// Command prefix that runs a shell line on the host (e.g. "ssh devbox")
        #[arg(long, default_value = "")]
        host_command: String,
        /// Encoded workspace info
        #[arg(long)]
        workspace_info: String,
        /// Agent path on the host
        #[arg(long, default_value = "/tmp/burrow")]
        agent_path: String,
        /// Where the host downloads the agent from
        #[arg(long, default_value = "")]
        agent_url: String,
        /// The host agent is this binary; verify its checksum on the host
        #[arg(long)]
        local_agent: bool,
        /// Directory the host agent keeps workspace state in
        #[arg(long)]
        agent_dir: Option<String>,
        /// User to log in as on both hops
        #[arg(short, long)]
        user: Option<String>,
        /// Forward a local port or socket into the container (repeatable)
        #[arg(short = 'L', long = "forward-port")]
        forward_ports: Vec<String>,
        /// Command to run inside the container
        #[arg(last = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand)]
enum HelperAction {
    /// Start the embedded SSH server
    SshServer {
        /// Address to listen on (overrides config)
        #[arg(long)]
        address: Option<String>,
        /// Serve a single connection on stdin/stdout
        #[arg(long)]
        stdio: bool,
        /// Preferred working directory for sessions
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Shell to run instead of the login shell
        #[arg(long)]
        shell: Option<String>,
        /// Encoded authorized keys and host key
        #[arg(long, env = "BURROW_SSH_TOKEN")]
        token: Option<String>,
        /// Periodically touch the activity file
        #[arg(long)]
        track_activity: bool,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Bridge stdio to the SSH helper inside the workspace container
    ContainerTunnel {
        /// Encoded workspace info
        #[arg(long)]
        workspace_info: String,
    },

    /// Workspace state on the host
    Workspace {
        #[command(subcommand)]
        action: WorkspaceAction,
    },
}

#[derive(Subcommand)]
enum WorkspaceAction {
    /// Store the latest workspace info
    UpdateConfig {
        /// Encoded workspace info
        #[arg(long)]
        workspace_info: String,
        /// Directory workspace state is kept in
        #[arg(long)]
        agent_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum TunnelAction {
    /// Answer tunnel calls from local git, docker and files
    Serve {
        /// Directory streamed to the caller
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Repository cloned and streamed to the caller
        #[arg(long)]
        repository: Option<String>,
        /// Branch of --repository
        #[arg(long, requires = "repository")]
        branch: Option<String>,
        /// Docker config consulted for registry credentials
        #[arg(long)]
        docker_config: Option<PathBuf>,
        /// Log every call
        #[arg(long)]
        show_logs: bool,
        /// Write the agent's result here
        #[arg(long)]
        result_file: Option<PathBuf>,
    },

    /// Relay calls to an upstream tunnel command, answering some locally
    Relay {
        /// Forward docker credential requests upstream
        #[arg(long)]
        allow_docker_credentials: bool,
        /// Static git username answered locally
        #[arg(long, requires = "git_token")]
        git_username: Option<String>,
        /// Static git token answered locally
        #[arg(long, env = "BURROW_GIT_TOKEN")]
        git_token: Option<String>,
        /// Log every relayed call
        #[arg(long)]
        show_logs: bool,
        /// Write the agent's result here
        #[arg(long)]
        result_file: Option<PathBuf>,
        /// Upstream command speaking the tunnel protocol on its stdio
        #[arg(last = true, required = true)]
        upstream: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    logging::init(
        logging::level(cli.debug, cli.quiet, cli.verbose),
        cli.log_file.as_deref(),
    )?;

    let config = ConfigFile::load_or_default(cli.config.as_deref())
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    let cancel = shutdown::on_signal();

    match cli.command {
        Commands::Helper { action } => match action {
            HelperAction::SshServer {
                address,
                stdio,
                workdir,
                shell,
                token,
                track_activity,
            } => {
                let args = SshServerArgs {
                    address,
                    stdio,
                    workdir,
                    shell,
                    token,
                    track_activity,
                };
                commands::ssh_server_command(args, config.ssh_server, cancel).await?;
            }
        },

        Commands::Agent { action } => match action {
            AgentAction::ContainerTunnel { workspace_info } => {
                return commands::container_tunnel_command(&workspace_info, cli.debug).await;
            }
            AgentAction::Workspace {
                action:
                    WorkspaceAction::UpdateConfig {
                        workspace_info,
                        agent_dir,
                    },
            } => {
                commands::update_config_command(&workspace_info, agent_dir.as_deref()).await?;
            }
        },

        Commands::Tunnel { action } => match action {
            TunnelAction::Serve {
                workspace,
                repository,
                branch,
                docker_config,
                show_logs,
                result_file,
            } => {
                let args = ServeArgs {
                    workspace,
                    repository,
                    branch,
                    docker_config,
                    show_logs: show_logs || config.relay.show_logs,
                };
                commands::serve_command(args, &config.tunnel, result_file.as_deref(), cancel)
                    .await?;
            }
            TunnelAction::Relay {
                allow_docker_credentials,
                git_username,
                git_token,
                show_logs,
                result_file,
                upstream,
            } => {
                let relay = RelayConfig {
                    allow_docker_credentials: allow_docker_credentials
                        || config.relay.allow_docker_credentials,
                    git_username: git_username.or(config.relay.git_username),
                    git_token: git_token.or(config.relay.git_token),
                    show_logs: show_logs || config.relay.show_logs,
                };
                commands::relay_command(
                    &upstream,
                    relay,
                    &config.tunnel,
                    result_file.as_deref(),
                    cancel,
                )
                .await?;
            }
        },

        Commands::Ssh {
            host_command,
            workspace_info,
            agent_path,
            agent_url,
            local_agent,
            agent_dir,
            user,
            forward_ports,
            command,
        } => {
            let args = SshArgs {
                host_command,
                workspace_info,
                agent_path,
                agent_url,
                local_agent,
                agent_dir,
                user,
                forward_ports,
                command,
            };
            return commands::ssh_command(args, config.tunnel, cli.debug, cancel).await;
        }
    }

    Ok(ExitCode::SUCCESS)
}
