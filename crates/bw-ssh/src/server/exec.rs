//! Non-PTY sessions: three copy loops around a child process

use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::command::CommandSpec;
use super::output::SessionOutput;
use crate::error::SshError;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Run `spec` with piped stdio.
///
/// Waits for both output loops to finish before reaping the process; stdin
/// is copied independently and abandoned once output is done. When `cancel`
/// fires first the process is killed.
pub(crate) async fn run(
    spec: &CommandSpec,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    output: &SessionOutput,
    cancel: &CancellationToken,
) -> Result<(), SshError> {
    let mut child = spec
        .to_tokio()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SshError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdin_task = tokio::spawn(async move {
        let Some(mut stdin) = stdin else { return };
        while let Some(data) = stdin_rx.recv().await {
            if let Err(e) = stdin.write_all(&data).await {
                tracing::debug!("Error piping stdin: {}", e);
                break;
            }
        }
    });

    let finished = async {
        tokio::join!(
            pump(stdout, output, Stream::Stdout),
            pump(stderr, output, Stream::Stderr)
        );
        child.wait().await
    };

    let status = tokio::select! {
        status = finished => status,
        _ = cancel.cancelled() => {
            stdin_task.abort();
            tracing::debug!("Session closed, killing {}", spec.program);
            // kill_on_drop takes the child down with it
            return Err(SshError::Channel("session closed".to_string()));
        }
    };
    stdin_task.abort();

    status_to_result(status?)
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, output: &SessionOutput, stream: Stream) {
    let Some(mut reader) = reader else { return };
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Error reading process output: {}", e);
                break;
            }
        };
        let written = match stream {
            Stream::Stdout => output.stdout(&buf[..n]).await,
            Stream::Stderr => output.stderr(&buf[..n]).await,
        };
        if let Err(e) = written {
            tracing::debug!("Error piping process output: {}", e);
            break;
        }
    }
}

/// Map a process exit status onto the session result
pub(crate) fn status_to_result(status: ExitStatus) -> Result<(), SshError> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(SshError::ExitCode(code as u32));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(SshError::ExitCode(128 + signal as u32));
        }
    }
    Err(SshError::ExitCode(1))
}
