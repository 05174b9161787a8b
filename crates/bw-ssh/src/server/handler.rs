//! Per-connection russh handler
//!
//! Collects per-channel state (PTY request, env, window changes, stdin) and
//! starts the workload once the client sends `shell`, `exec` or `subsystem`.

use std::collections::HashMap;
use std::sync::Arc;

use russh::keys::{HashAlg, PublicKey};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::auth::is_authorized;
use super::command::CommandSpec;
use super::forward::{self, tcp_key, ForwardRegistry};
use super::output::SessionOutput;
use super::proxy::{self, ProxyRequest};
use super::pty::{PtyRequest, WindowSize};
use super::{exec, sftp, ServerOptions, SessionMode};

/// Buffered stdin chunks per session before the SSH read loop is paused
const STDIN_CHANNEL_CAPACITY: usize = 32;

struct ChannelState {
    pty: Option<PtyRequest>,
    env: Vec<(String, String)>,
    stdin: Option<mpsc::Sender<Vec<u8>>>,
    resize: Option<mpsc::UnboundedSender<WindowSize>>,
    /// Cancelled when the channel closes or the connection ends
    cancel: CancellationToken,
}

impl ChannelState {
    fn new(parent: &CancellationToken) -> Self {
        Self {
            pty: None,
            env: Vec::new(),
            stdin: None,
            resize: None,
            cancel: parent.child_token(),
        }
    }
}

/// Handler for a single SSH connection
pub(crate) struct SessionHandler {
    options: Arc<ServerOptions>,
    peer: String,
    user: String,
    /// Session channels whose workload has not started yet
    channels: HashMap<ChannelId, Channel<Msg>>,
    states: HashMap<ChannelId, ChannelState>,
    forwards: ForwardRegistry,
    /// Cancelled when the connection ends; parents every forward listener
    cancel: CancellationToken,
    span: tracing::Span,
}

impl SessionHandler {
    pub(crate) fn new(
        options: Arc<ServerOptions>,
        peer: String,
        cancel: CancellationToken,
        span: tracing::Span,
    ) -> Self {
        Self {
            options,
            peer,
            user: String::new(),
            channels: HashMap::new(),
            states: HashMap::new(),
            forwards: ForwardRegistry::default(),
            cancel,
            span,
        }
    }

    /// User the session runs as, `None` when it is the server's own user
    fn target_user(&self) -> Option<&str> {
        (!self.user.is_empty() && self.user != self.options.current_user)
            .then_some(self.user.as_str())
    }

    fn state(&mut self, channel: ChannelId) -> &mut ChannelState {
        let parent = &self.cancel;
        self.states
            .entry(channel)
            .or_insert_with(|| ChannelState::new(parent))
    }

    fn start_workload(
        &mut self,
        channel: ChannelId,
        command: Option<String>,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        self.channels.remove(&channel);

        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_CHANNEL_CAPACITY);
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        let state = self.state(channel);
        state.stdin = Some(stdin_tx);
        state.resize = Some(resize_tx);
        let pty = state.pty.clone();
        let env = state.env.clone();
        let cancel = state.cancel.clone();

        let output = SessionOutput::new(session.handle(), channel);
        session.channel_success(channel)?;

        match &self.options.mode {
            SessionMode::Local => {
                let spec = CommandSpec::for_session(
                    &self.options,
                    &self.user,
                    command.as_deref(),
                    pty.is_some(),
                    &env,
                );
                match self.target_user() {
                    Some(user) => tracing::info!("Executing with su as {}: {}", user, spec),
                    None => tracing::info!("Executing with shell: {}", spec),
                }

                tokio::spawn(
                    async move {
                        let result = match pty {
                            Some(request) => {
                                super::pty::run(spec, &request, stdin_rx, resize_rx, &output, &cancel)
                                    .await
                            }
                            None => exec::run(&spec, stdin_rx, &output, &cancel).await,
                        };
                        finish(&output, result, &cancel).await;
                    }
                    .instrument(self.span.clone()),
                );
            }
            SessionMode::Proxy(client) => {
                let client = Arc::clone(client);
                let request = ProxyRequest { pty, env, command };
                tokio::spawn(
                    async move {
                        let result =
                            proxy::run(client, request, stdin_rx, resize_rx, &output, &cancel).await;
                        finish(&output, result, &cancel).await;
                    }
                    .instrument(self.span.clone()),
                );
            }
        }
        Ok(())
    }
}

/// Report the outcome unless the channel is already gone
async fn finish(output: &SessionOutput, result: Result<(), crate::SshError>, cancel: &CancellationToken) {
    if cancel.is_cancelled() {
        tracing::debug!("Channel gone, dropping workload result");
        return;
    }
    output.finish(result).await;
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Handler for SessionHandler {
    type Error = anyhow::Error;

    /// Accept anyone when no keys are configured; the transport is trusted
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.options.authorized_keys.is_empty() {
            tracing::debug!("Accepting {} from {} without credentials", user, self.peer);
            self.user = user.to_string();
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let keys = &self.options.authorized_keys;
        if keys.is_empty() || is_authorized(keys, public_key) {
            tracing::debug!(
                "Accepted key {} for {}",
                public_key.fingerprint(HashAlg::Sha256),
                user
            );
            self.user = user.to_string();
            return Ok(Auth::Accept);
        }

        tracing::debug!(
            "Declined public key {}",
            public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Session channel opened: {:?}", channel.id());
        self.states
            .insert(channel.id(), ChannelState::new(&self.cancel));
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        forward::direct_tcpip(channel, host_to_connect.to_string(), port_to_connect);
        Ok(true)
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        forward::direct_streamlocal(channel, socket_path.to_string());
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("PTY request: term={}, cols={}, rows={}", term, col_width, row_height);
        self.state(channel).pty = Some(PtyRequest {
            term: term.to_string(),
            size: WindowSize {
                cols: col_width,
                rows: row_height,
                pix_width,
                pix_height,
            },
        });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.state(channel)
            .env
            .push((variable_name.to_string(), variable_value.to_string()));
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Declining agent forwarding on {:?}", channel);
        Ok(false)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_workload(channel, None, session)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.start_workload(channel, Some(command), session)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            tracing::debug!("Unsupported subsystem {}", name);
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        let root = bw_core::user::home_dir(self.target_user())
            .unwrap_or_else(|| std::path::PathBuf::from("/"));
        let output = SessionOutput::new(session.handle(), channel_id);
        session.channel_success(channel_id)?;

        tokio::spawn(sftp::serve(channel.into_stream(), root, output).instrument(self.span.clone()));
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = WindowSize {
            cols: col_width,
            rows: row_height,
            pix_width,
            pix_height,
        };
        let Some(state) = self.states.get_mut(&channel) else {
            return Ok(());
        };
        match (&state.resize, &mut state.pty) {
            (Some(resize), _) => {
                let _ = resize.send(size);
            }
            // not started yet: the PTY opens at the latest size
            (None, Some(pty)) => pty.size = size,
            (None, None) => {}
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(stdin) = self.states.get(&channel).and_then(|s| s.stdin.clone()) {
            if stdin.send(data.to_vec()).await.is_err() {
                tracing::trace!("Dropping {} bytes for finished workload", data.len());
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        if let Some(state) = self.states.get_mut(&channel) {
            state.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        if let Some(state) = self.states.remove(&channel) {
            state.cancel.cancel();
        }
        self.channels.remove(&channel);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match forward::reverse_tcpip(session.handle(), address, port, &self.forwards, &self.cancel)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!("Failed to bind {}:{}: {}", address, port, e);
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.forwards.cancel(&tcp_key(address, port)))
    }

    async fn streamlocal_forward(
        &mut self,
        socket_path: &str,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match forward::reverse_streamlocal(session.handle(), socket_path, &self.forwards, &self.cancel)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!("Failed to bind socket {}: {}", socket_path, e);
                Ok(false)
            }
        }
    }

    async fn cancel_streamlocal_forward(
        &mut self,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.forwards.cancel(socket_path))
    }
}
