//! `burrow helper ssh-server`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use bw_core::config::SshServerConfig;
use bw_core::StdioListener;
use bw_ssh::server::{
    generate_host_key, load_host_key, parse_authorized_keys, track_activity, ServerToken,
};
use bw_ssh::{PrivateKey, PublicKey, ServerOptions, SshServer};

/// Command-line overrides for the embedded SSH server
#[derive(Debug, Default, Clone)]
pub struct SshServerArgs {
    pub address: Option<String>,
    pub stdio: bool,
    pub workdir: Option<PathBuf>,
    pub shell: Option<String>,
    pub token: Option<String>,
    pub track_activity: bool,
}

impl SshServerArgs {
    fn apply(&self, config: &mut SshServerConfig) {
        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if self.workdir.is_some() {
            config.workdir = self.workdir.clone();
        }
        if self.shell.is_some() {
            config.shell = self.shell.clone();
        }
        config.track_activity |= self.track_activity;
    }
}

/// Serve SSH on stdio or a TCP address until the peer leaves or `cancel` fires
pub async fn ssh_server_command(
    args: SshServerArgs,
    mut config: SshServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    args.apply(&mut config);

    let token = args
        .token
        .as_deref()
        .map(ServerToken::parse)
        .transpose()
        .context("Invalid --token")?;
    let host_key = resolve_host_key(&config, token.as_ref())?;
    let authorized_keys = resolve_authorized_keys(&config, token.as_ref())?;
    if authorized_keys.is_empty() {
        tracing::debug!("No authorized keys configured, accepting every client");
    }

    let options = ServerOptions::from_config(&config).with_authorized_keys(authorized_keys);
    let server = SshServer::new(
        host_key,
        options,
        config.auth_rejection_time,
        tracing::info_span!("ssh-server"),
    );

    if config.track_activity {
        tokio::spawn(track_activity(
            config.activity_file.clone(),
            config.activity_interval,
            cancel.child_token(),
        ));
    }

    if !args.stdio {
        server.listen_and_serve(&config.address, cancel).await?;
        return Ok(());
    }

    let listener = StdioListener::from_process(true);
    let done = listener.done();
    let serve_cancel = cancel.child_token();
    tokio::spawn({
        let serve_cancel = serve_cancel.clone();
        async move {
            tokio::select! {
                _ = done.cancelled() => {
                    tracing::debug!("stdin closed, stopping SSH server");
                    serve_cancel.cancel();
                }
                _ = serve_cancel.cancelled() => {}
            }
        }
    });

    server.serve(&listener, serve_cancel).await?;
    Ok(())
}

fn resolve_host_key(config: &SshServerConfig, token: Option<&ServerToken>) -> Result<PrivateKey> {
    if let Some(key) = token.map(ServerToken::host_key).transpose()?.flatten() {
        return Ok(key);
    }
    match &config.host_key_path {
        Some(path) => load_host_key(path)
            .with_context(|| format!("Failed to load host key from {:?}", path)),
        None => Ok(generate_host_key()?),
    }
}

fn resolve_authorized_keys(
    config: &SshServerConfig,
    token: Option<&ServerToken>,
) -> Result<Vec<PublicKey>> {
    // an empty list accepts every client, so a supplied list must yield keys
    if let Some(token) = token.filter(|t| !t.authorized_keys.is_empty()) {
        let keys = token
            .authorized_keys()
            .context("Invalid authorized keys in --token")?;
        if keys.is_empty() {
            bail!("--token carries authorized keys but none could be read");
        }
        return Ok(keys);
    }
    match &config.authorized_keys_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read authorized keys from {:?}", path))?;
            let keys = parse_authorized_keys(&text)
                .with_context(|| format!("Invalid authorized keys in {:?}", path))?;
            if keys.is_empty() {
                bail!("No authorized keys in {:?}", path);
            }
            Ok(keys)
        }
        None => Ok(Vec::new()),
    }
}
