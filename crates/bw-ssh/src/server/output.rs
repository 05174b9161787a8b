//! Writing workload output back to a session channel

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};

use crate::error::{exit_status, SshError};

/// Output side of one session channel
#[derive(Clone)]
pub(crate) struct SessionOutput {
    handle: Handle,
    channel: ChannelId,
}

impl SessionOutput {
    pub(crate) fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }

    pub(crate) async fn stdout(&self, data: &[u8]) -> Result<(), SshError> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| SshError::Channel("session closed while writing stdout".to_string()))
    }

    pub(crate) async fn stderr(&self, data: &[u8]) -> Result<(), SshError> {
        self.handle
            .extended_data(self.channel, 1, CryptoVec::from_slice(data))
            .await
            .map_err(|_| SshError::Channel("session closed while writing stderr".to_string()))
    }

    /// Report the workload's outcome and close the channel.
    ///
    /// Errors that are not a plain exit status are written to stderr first.
    pub(crate) async fn finish(&self, result: Result<(), SshError>) {
        if let Err(e) = &result {
            if !e.is_exit_code() {
                tracing::error!("Exit error: {}", e);
                if let Err(write_err) = self.stderr(e.to_string().as_bytes()).await {
                    tracing::error!("Failed to write error to session: {}", write_err);
                }
            }
        }

        let status = exit_status(&result);
        tracing::debug!("Session {:?} exiting with status {}", self.channel, status);
        if self
            .handle
            .exit_status_request(self.channel, status)
            .await
            .is_err()
        {
            tracing::debug!("Session {:?} closed before exit status was sent", self.channel);
        }
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}
