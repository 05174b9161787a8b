//! CLI command implementations

mod agent;
mod helper;
mod ssh;
mod tunnel;

pub use agent::{
    agent_dir, container_exec_args, container_tunnel_command, decode_workspace_info,
    update_config_command, WORKSPACE_FILE,
};
pub use helper::{ssh_server_command, SshServerArgs};
pub use ssh::{ssh_command, HostCommandClient, SshArgs};
pub use tunnel::{relay_command, serve_command, ServeArgs};
