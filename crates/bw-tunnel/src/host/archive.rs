//! Directory and clone streams produced by local commands

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::StreamExt;
use tokio::process::Command;

use crate::error::TunnelError;
use crate::rpc::{byte_stream, ByteStream};

/// Stream the stdout of `command`; a failing exit status ends the stream with an error.
///
/// `keep` is dropped only after the command finished, e.g. a scratch directory.
pub(crate) fn command_stream<K>(
    mut command: Command,
    what: String,
    keep: K,
) -> Result<ByteStream, TunnelError>
where
    K: Send + 'static,
{
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = command
        .spawn()
        .map_err(|e| TunnelError::internal(format!("start {}: {}", what, e)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TunnelError::internal(format!("{}: no stdout", what)))?;

    let status = futures::stream::once(async move {
        let status = child.wait().await;
        drop(keep);
        match status {
            Ok(status) if status.success() => None,
            Ok(status) => Some(Err(TunnelError::internal(format!("{}: {}", what, status)))),
            Err(e) => Some(Err(TunnelError::from(e))),
        }
    })
    .filter_map(futures::future::ready);

    Ok(Box::pin(byte_stream(stdout).chain(status)))
}

/// Tar the contents of `dir` to a stream
pub(crate) fn tar_directory(dir: &Path) -> Result<ByteStream, TunnelError> {
    if !dir.is_dir() {
        return Err(TunnelError::invalid_argument(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let mut command = Command::new("tar");
    command.arg("-C").arg(dir).args(["-cf", "-", "."]);
    command_stream(command, format!("tar {}", dir.display()), ())
}

/// Source directory of a mount spec.
///
/// Accepts `type=bind,src=/a,dst=/b` style specs (`src` or `source`) and bare paths.
pub(crate) fn mount_source(mount: &str) -> Result<PathBuf, TunnelError> {
    let mount = mount.trim();
    if mount.is_empty() {
        return Err(TunnelError::invalid_argument("empty mount"));
    }
    if !mount.contains('=') {
        return Ok(PathBuf::from(mount));
    }

    mount
        .split(',')
        .filter_map(|part| part.split_once('='))
        .find(|(key, _)| matches!(key.trim(), "src" | "source"))
        .map(|(_, value)| PathBuf::from(value.trim()))
        .ok_or_else(|| TunnelError::invalid_argument(format!("mount {} has no source", mount)))
}

/// Repository to clone for `stream_git_clone`
#[derive(Debug, Clone)]
pub struct GitCloneSource {
    pub repository: String,
    pub branch: Option<String>,
}

/// Clone the repository into a scratch directory and stream it as a tar archive
pub(crate) async fn stream_clone(source: &GitCloneSource) -> Result<ByteStream, TunnelError> {
    let scratch = tempfile::tempdir()?;
    let target = scratch.path().join("repo");

    let mut clone = Command::new("git");
    clone.arg("clone").arg("--quiet");
    if let Some(branch) = &source.branch {
        clone.arg("--branch").arg(branch);
    }
    clone.arg(&source.repository).arg(&target);
    let output = clone
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| TunnelError::internal(format!("start git clone: {}", e)))?;
    if !output.status.success() {
        return Err(TunnelError::internal(format!(
            "git clone {}: {}",
            source.repository,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let mut tar = Command::new("tar");
    tar.arg("-C").arg(&target).args(["-cf", "-", "."]);
    command_stream(tar, format!("tar {}", source.repository), scratch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_source_from_spec() {
        assert_eq!(
            mount_source("type=bind,src=/data/cache,dst=/cache").unwrap(),
            PathBuf::from("/data/cache")
        );
        assert_eq!(
            mount_source("type=bind,source=/a,target=/b").unwrap(),
            PathBuf::from("/a")
        );
    }

    #[test]
    fn test_mount_source_bare_path() {
        assert_eq!(mount_source("/srv/files").unwrap(), PathBuf::from("/srv/files"));
    }

    #[test]
    fn test_mount_source_without_src_is_invalid() {
        assert!(mount_source("type=volume,dst=/b").is_err());
        assert!(mount_source("  ").is_err());
    }

    #[tokio::test]
    async fn test_failing_command_ends_stream_with_error() {
        let mut command = Command::new("sh");
        command.args(["-c", "printf partial; exit 3"]);
        let mut stream = command_stream(command, "sh".to_string(), ()).unwrap();

        let mut data = Vec::new();
        let mut failed = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(_) => failed = true,
            }
        }
        assert_eq!(data, b"partial");
        assert!(failed);
    }
}
