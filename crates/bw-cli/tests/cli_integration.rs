//! CLI integration tests
//!
//! Tests the burrow CLI using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;

use bw_core::WorkspaceInfo;

fn burrow() -> Command {
    Command::cargo_bin("burrow")
        .expect("Failed to locate burrow binary - ensure it's built before running tests")
}

fn workspace_info(runtime: &str) -> String {
    WorkspaceInfo {
        id: "ws-1".to_string(),
        runtime: runtime.to_string(),
        container_id: Some("abc123".to_string()),
        ..Default::default()
    }
    .encode()
    .unwrap()
}

#[test]
fn test_cli_help() {
    burrow()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("burrow"))
        .stdout(predicate::str::contains("Nested tunnels"));
}

#[test]
fn test_cli_version() {
    burrow()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("burrow"));
}

#[test]
fn test_cli_ssh_server_help() {
    burrow()
        .args(["helper", "ssh-server", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--stdio"))
        .stdout(predicate::str::contains("--token"));
}

#[test]
fn test_cli_agent_help() {
    burrow()
        .args(["agent", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("container-tunnel"))
        .stdout(predicate::str::contains("workspace"));
}

#[test]
fn test_cli_relay_requires_upstream() {
    burrow().args(["tunnel", "relay"]).assert().failure();
}

#[test]
fn test_bad_workspace_info_fails() {
    burrow()
        .args(["agent", "container-tunnel", "--workspace-info", "not-base64!"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("workspace-info"));
}

#[test]
fn test_container_tunnel_runs_runtime_exec() {
    burrow()
        .args(["agent", "container-tunnel", "--workspace-info"])
        .arg(workspace_info("echo"))
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "exec -i abc123 /usr/local/bin/burrow helper ssh-server --stdio",
        ));
}

#[test]
fn test_container_tunnel_propagates_exit_status() {
    burrow()
        .args(["agent", "container-tunnel", "--workspace-info"])
        .arg(workspace_info("false"))
        .assert()
        .code(1);
}

#[test]
fn test_update_config_writes_workspace_file() {
    let dir = tempfile::tempdir().unwrap();

    burrow()
        .args(["agent", "workspace", "update-config", "--workspace-info"])
        .arg(workspace_info("docker"))
        .arg("--agent-dir")
        .arg(dir.path())
        .assert()
        .success();

    let stored = std::fs::read_to_string(dir.path().join("ws-1").join("workspace.json")).unwrap();
    assert!(stored.contains("abc123"));
}

#[test]
fn test_missing_config_file_fails() {
    burrow()
        .args(["--config", "/nonexistent/burrow.toml", "agent", "workspace", "update-config"])
        .args(["--workspace-info", &workspace_info("docker")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config"));
}

#[test]
fn test_ssh_needs_work_to_do() {
    burrow()
        .args(["ssh", "--workspace-info"])
        .arg(workspace_info("docker"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Nothing to do"));
}
