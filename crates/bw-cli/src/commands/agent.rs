//! Host-side agent commands the orchestrator runs through the outer hop

use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};

use anyhow::{bail, Context, Result};
use tokio::process::Command;

use bw_core::config::default_config_dir;
use bw_core::WorkspaceInfo;

/// Agent path inside the container when the workspace info names none
const DEFAULT_CONTAINER_AGENT: &str = "/usr/local/bin/burrow";

/// File the workspace info is stored in, below `<agent dir>/<workspace id>/`
pub const WORKSPACE_FILE: &str = "workspace.json";

/// Decode a `--workspace-info` argument
pub fn decode_workspace_info(encoded: &str) -> Result<WorkspaceInfo> {
    let info = WorkspaceInfo::decode(encoded).context("Invalid --workspace-info")?;
    if info.id.is_empty() {
        bail!("Invalid --workspace-info: workspace id is empty");
    }
    Ok(info)
}

/// Arguments of `<runtime> exec` that start the SSH helper inside the container
pub fn container_exec_args(info: &WorkspaceInfo, debug: bool) -> Result<Vec<String>> {
    let container = info
        .container_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .with_context(|| format!("Workspace {} has no container", info.id))?;

    let mut args = vec!["exec".to_string(), "-i".to_string()];
    if let Some(user) = info.container_user.as_deref().filter(|u| !u.is_empty()) {
        args.push("-u".to_string());
        args.push(user.to_string());
    }
    args.push(container.to_string());
    args.push(
        info.container_agent_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTAINER_AGENT.to_string()),
    );
    args.extend(["helper", "ssh-server", "--stdio"].map(String::from));
    if let Some(workdir) = info.workdir.as_deref().filter(|w| !w.is_empty()) {
        args.push("--workdir".to_string());
        args.push(workdir.to_string());
    }
    if debug {
        args.push("--debug".to_string());
    }
    Ok(args)
}

/// `burrow agent container-tunnel`: bridge this process's stdio to the
/// SSH helper inside the workspace container
pub async fn container_tunnel_command(encoded: &str, debug: bool) -> Result<ExitCode> {
    let info = decode_workspace_info(encoded)?;
    let args = container_exec_args(&info, debug)?;
    tracing::debug!("Starting container helper: {} {}", info.runtime, args.join(" "));

    let status = Command::new(&info.runtime)
        .args(&args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("Failed to run {}", info.runtime))?;

    tracing::debug!("Container helper exited with {}", status);
    Ok(match status.code() {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    })
}

/// Directory workspace state lives in: flag, then workspace info, then default
pub fn agent_dir(flag: Option<&Path>, info: &WorkspaceInfo) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| info.agent_dir.clone())
        .unwrap_or_else(|| default_config_dir().join("agent"))
}

/// `burrow agent workspace update-config`: persist the latest workspace info
pub async fn update_config_command(encoded: &str, agent_dir_flag: Option<&Path>) -> Result<PathBuf> {
    let info = decode_workspace_info(encoded)?;
    let dir = agent_dir(agent_dir_flag, &info).join(&info.id);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create {:?}", dir))?;

    let path = dir.join(WORKSPACE_FILE);
    let json = serde_json::to_vec_pretty(&info)?;
    let staging = dir.join(format!(".{}.tmp", WORKSPACE_FILE));
    tokio::fs::write(&staging, json)
        .await
        .with_context(|| format!("Failed to write {:?}", staging))?;
    tokio::fs::rename(&staging, &path)
        .await
        .with_context(|| format!("Failed to replace {:?}", path))?;

    tracing::debug!("Updated workspace config at {:?}", path);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> WorkspaceInfo {
        WorkspaceInfo {
            id: "ws-1".to_string(),
            runtime: "podman".to_string(),
            container_id: Some("abc123".to_string()),
            container_user: Some("vscode".to_string()),
            workdir: Some("/workspaces/ws-1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_exec_args_name_user_container_and_helper() {
        let args = container_exec_args(&info(), true).unwrap();
        assert_eq!(
            args,
            [
                "exec", "-i", "-u", "vscode", "abc123", "/usr/local/bin/burrow", "helper",
                "ssh-server", "--stdio", "--workdir", "/workspaces/ws-1", "--debug",
            ]
        );
    }

    #[test]
    fn test_exec_args_need_a_container() {
        let mut info = info();
        info.container_id = None;
        assert!(container_exec_args(&info, false).is_err());
    }

    #[test]
    fn test_empty_id_is_rejected() {
        let encoded = WorkspaceInfo::default().encode().unwrap();
        assert!(decode_workspace_info(&encoded).is_err());
    }

    #[test]
    fn test_agent_dir_precedence() {
        let mut info = info();
        info.agent_dir = Some(PathBuf::from("/var/lib/burrow"));
        assert_eq!(
            agent_dir(Some(Path::new("/tmp/flag")), &info),
            PathBuf::from("/tmp/flag")
        );
        assert_eq!(agent_dir(None, &info), PathBuf::from("/var/lib/burrow"));
    }

    #[tokio::test]
    async fn test_update_config_writes_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = info().encode().unwrap();

        let path = update_config_command(&encoded, Some(dir.path())).await.unwrap();
        assert_eq!(path, dir.path().join("ws-1").join(WORKSPACE_FILE));

        let stored: WorkspaceInfo =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored, info());

        let mut changed = info();
        changed.workdir = Some("/elsewhere".to_string());
        update_config_command(&changed.encode().unwrap(), Some(dir.path()))
            .await
            .unwrap();
        let stored: WorkspaceInfo =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored.workdir.as_deref(), Some("/elsewhere"));
    }
}
