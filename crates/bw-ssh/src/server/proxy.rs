//! Proxy sessions: splice a host-side session onto an inner SSH session

use std::sync::Arc;

use russh::ChannelMsg;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::output::SessionOutput;
use super::pty::{PtyRequest, WindowSize};
use crate::client::SshClient;
use crate::error::SshError;

/// What the host-side client asked for
pub(crate) struct ProxyRequest {
    pub pty: Option<PtyRequest>,
    pub env: Vec<(String, String)>,
    pub command: Option<String>,
}

/// Run one proxied session.
///
/// The first of {stdin copy error, stdout/stderr copy error, inner session
/// end} ends it. The inner exit status becomes the session's status. When
/// the host-side channel goes away (`cancel`) the inner session is closed.
pub(crate) async fn run(
    inner: Arc<SshClient>,
    request: ProxyRequest,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    mut resizes: mpsc::UnboundedReceiver<WindowSize>,
    output: &SessionOutput,
    cancel: &CancellationToken,
) -> Result<(), SshError> {
    let mut channel = inner.open_session().await.map_err(|e| {
        tracing::error!("Failed to establish remote connection: {}", e);
        e
    })?;

    for (name, value) in &request.env {
        channel.set_env(false, name.as_str(), value.as_str()).await?;
    }

    if let Some(pty) = &request.pty {
        channel
            .request_pty(
                false,
                &pty.term,
                pty.size.cols,
                pty.size.rows,
                pty.size.pix_width,
                pty.size.pix_height,
                &[],
            )
            .await?;
    }

    match &request.command {
        Some(command) => channel.exec(true, command.as_str()).await?,
        None => channel.request_shell(true).await?,
    }

    let mut writer = channel.make_writer();
    let stdin_copy = async move {
        while let Some(data) = stdin_rx.recv().await {
            writer.write_all(&data).await.map_err(|e| {
                SshError::Channel(format!("host stdin -> remote stdin: {}", e))
            })?;
        }
        let _ = writer.shutdown().await;
        Ok::<(), SshError>(())
    };
    tokio::pin!(stdin_copy);

    let mut stdin_open = true;
    let mut status = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Host session closed, closing inner session");
                if let Err(e) = channel.close().await {
                    tracing::debug!("close inner session: {}", e);
                }
                return Err(SshError::Channel("host session closed".to_string()));
            }

            copied = &mut stdin_copy, if stdin_open => {
                stdin_open = false;
                copied?;
            }

            Some(size) = resizes.recv() => {
                if let Err(e) = channel
                    .window_change(size.cols, size.rows, size.pix_width, size.pix_height)
                    .await
                {
                    tracing::error!("change window: {}", e);
                }
            }

            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { ref data }) => {
                    output.stdout(data).await.map_err(|e| {
                        SshError::Channel(format!("remote stdout -> host stdout: {}", e))
                    })?;
                }
                Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                    output.stderr(data).await.map_err(|e| {
                        SshError::Channel(format!("remote stderr -> host stderr: {}", e))
                    })?;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => status = Some(exit_status),
                Some(ChannelMsg::Close) | None => break,
                _ => {}
            },
        }
    }

    tracing::debug!("Inner session ended with status {:?}", status);
    match status {
        Some(0) => Ok(()),
        Some(code) => Err(SshError::ExitCode(code)),
        None => Err(SshError::NoExitStatus),
    }
}
