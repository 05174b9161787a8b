//! PTY sessions backed by portable-pty

use std::io::{Read, Write};
use std::time::Duration;

use portable_pty::{native_pty_system, ChildKiller, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::command::CommandSpec;
use super::output::SessionOutput;
use crate::error::SshError;

/// Terminal dimensions as carried by `pty-req` and `window-change`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

impl From<WindowSize> for PtySize {
    fn from(size: WindowSize) -> Self {
        PtySize {
            rows: clamp_u16(size.rows),
            cols: clamp_u16(size.cols),
            pixel_width: clamp_u16(size.pix_width),
            pixel_height: clamp_u16(size.pix_height),
        }
    }
}

fn clamp_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// A PTY requested by the client
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PtyRequest {
    pub term: String,
    pub size: WindowSize,
}

/// Something that can be told about a new window size
pub trait TerminalResizer: Send {
    fn resize(&mut self, size: WindowSize) -> Result<(), SshError>;
}

impl TerminalResizer for Box<dyn MasterPty + Send> {
    fn resize(&mut self, size: WindowSize) -> Result<(), SshError> {
        MasterPty::resize(self.as_ref(), size.into())
            .map_err(|e| SshError::Pty(format!("resize: {}", e)))
    }
}

/// Apply every window-size event from `sizes`, in order, until the sender goes away
pub async fn relay_resizes<R: TerminalResizer>(
    mut sizes: mpsc::UnboundedReceiver<WindowSize>,
    mut resizer: R,
) -> R {
    while let Some(size) = sizes.recv().await {
        tracing::debug!("Resizing PTY to {}x{}", size.cols, size.rows);
        if let Err(e) = resizer.resize(size) {
            tracing::warn!("{}", e);
        }
    }
    resizer
}

/// Run `spec` on a fresh pseudo-terminal; `cancel` kills the process
pub(crate) async fn run(
    mut spec: CommandSpec,
    request: &PtyRequest,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    resizes: mpsc::UnboundedReceiver<WindowSize>,
    output: &SessionOutput,
    cancel: &CancellationToken,
) -> Result<(), SshError> {
    spec.set_env("TERM", &request.term);

    let pair = native_pty_system()
        .openpty(request.size.into())
        .map_err(|e| SshError::Pty(format!("start pty: {}", e)))?;

    let mut child = pair
        .slave
        .spawn_command(spec.to_pty())
        .map_err(|e| SshError::Pty(format!("start {}: {}", spec.program, e)))?;
    drop(pair.slave);
    let mut killer = child.clone_killer();

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SshError::Pty(format!("clone reader: {}", e)))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| SshError::Pty(format!("take writer: {}", e)))?;

    let resize_task = tokio::spawn(relay_resizes(resizes, pair.master));

    tokio::task::spawn_blocking(move || {
        while let Some(data) = stdin_rx.blocking_recv() {
            if writer.write_all(&data).and_then(|_| writer.flush()).is_err() {
                break;
            }
        }
    });

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(32);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let pump_output = output.clone();
    let mut pump = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if let Err(e) = pump_output.stdout(&data).await {
                tracing::debug!("Error piping PTY output: {}", e);
                break;
            }
        }
    });

    let mut wait = tokio::task::spawn_blocking(move || child.wait());
    let status = tokio::select! {
        status = &mut wait => status,
        _ = cancel.cancelled() => {
            tracing::debug!("Session closed, killing {}", spec.program);
            if let Err(e) = killer.kill() {
                tracing::warn!("Failed to kill {}: {}", spec.program, e);
            }
            pump.abort();
            resize_task.abort();
            return Err(SshError::Channel("session closed".to_string()));
        }
    };
    let status = status.map_err(|e| SshError::Pty(format!("wait: {}", e)))??;
    tracing::info!("PTY process exited with code {}", status.exit_code());

    // give trailing output a moment to drain
    if tokio::time::timeout(Duration::from_secs(1), &mut pump)
        .await
        .is_err()
    {
        pump.abort();
    }
    resize_task.abort();

    match status.exit_code() {
        0 => Ok(()),
        code => Err(SshError::ExitCode(code)),
    }
}
