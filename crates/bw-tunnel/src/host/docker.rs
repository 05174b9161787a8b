//! Registry credentials from the local docker config

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use std::collections::HashMap;

use bw_protocol::message::DockerCredentials;

use crate::error::TunnelError;

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "identitytoken")]
    identity_token: Option<String>,
}

/// `$DOCKER_CONFIG/config.json`, or `~/.docker/config.json`
pub(crate) fn default_config_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
}

/// Host part of a registry reference, so `https://index.docker.io/v1/` matches `index.docker.io`
fn registry_host(server: &str) -> &str {
    let server = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    server.split('/').next().unwrap_or(server)
}

fn decode_entry(server_url: &str, entry: &AuthEntry) -> Result<DockerCredentials, TunnelError> {
    if let Some(token) = &entry.identity_token {
        return Ok(DockerCredentials {
            server_url: server_url.to_string(),
            username: "<token>".to_string(),
            secret: token.clone(),
        });
    }

    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Ok(DockerCredentials {
            server_url: server_url.to_string(),
            username: username.clone(),
            secret: password.clone(),
        });
    }

    let auth = entry.auth.as_deref().unwrap_or_default();
    let decoded = BASE64
        .decode(auth)
        .map_err(|e| TunnelError::internal(format!("decode auth for {}: {}", server_url, e)))?;
    let decoded = String::from_utf8_lossy(&decoded);
    let (username, secret) = decoded
        .split_once(':')
        .ok_or_else(|| TunnelError::internal(format!("malformed auth for {}", server_url)))?;
    Ok(DockerCredentials {
        server_url: server_url.to_string(),
        username: username.to_string(),
        secret: secret.to_string(),
    })
}

/// Look up credentials for `server_url` in the docker config at `path`.
///
/// An unknown server, or a missing config file, yields empty credentials.
pub(crate) async fn lookup(path: &Path, server_url: &str) -> Result<DockerCredentials, TunnelError> {
    let empty = DockerCredentials {
        server_url: server_url.to_string(),
        ..Default::default()
    };

    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(empty),
        Err(e) => return Err(e.into()),
    };
    let config: DockerConfig = serde_json::from_str(&content)
        .map_err(|e| TunnelError::internal(format!("parse {}: {}", path.display(), e)))?;

    let wanted = registry_host(server_url);
    match config
        .auths
        .iter()
        .find(|(server, _)| registry_host(server) == wanted)
    {
        Some((_, entry)) => decode_entry(server_url, entry),
        None => Ok(empty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_decodes_basic_auth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let auth = BASE64.encode("jane:hunter2");
        std::fs::write(
            &path,
            format!(r#"{{"auths":{{"https://index.docker.io/v1/":{{"auth":"{}"}}}}}}"#, auth),
        )
        .unwrap();

        let creds = lookup(&path, "index.docker.io").await.unwrap();
        assert_eq!(creds.username, "jane");
        assert_eq!(creds.secret, "hunter2");
        assert_eq!(creds.server_url, "index.docker.io");
    }

    #[tokio::test]
    async fn test_lookup_unknown_server_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"auths":{}}"#).unwrap();

        let creds = lookup(&path, "ghcr.io").await.unwrap();
        assert!(creds.username.is_empty());
        assert!(creds.secret.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let creds = lookup(&dir.path().join("absent.json"), "ghcr.io").await.unwrap();
        assert!(creds.username.is_empty());
    }
}
