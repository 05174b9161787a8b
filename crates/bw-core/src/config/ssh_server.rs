//! Embedded SSH server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for `burrow helper ssh-server`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshServerConfig {
    /// Address to bind when not serving over stdio
    pub address: String,

    /// Preferred working directory for sessions, used when it exists
    pub workdir: Option<PathBuf>,

    /// Shell to run instead of the user's login shell
    pub shell: Option<String>,

    /// Private host key (OpenSSH or PEM). A fresh Ed25519 key is generated when unset.
    pub host_key_path: Option<PathBuf>,

    /// authorized_keys file; when unset every client is accepted
    pub authorized_keys_path: Option<PathBuf>,

    /// Periodically touch `activity_file` while serving
    pub track_activity: bool,

    /// File touched when `track_activity` is on
    pub activity_file: PathBuf,

    /// How often the activity file is touched
    #[serde(with = "duration_secs")]
    pub activity_interval: Duration,

    /// Delay before answering a rejected authentication attempt
    #[serde(with = "duration_secs")]
    pub auth_rejection_time: Duration,
}

impl Default for SshServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8022".to_string(),
            workdir: None,
            shell: None,
            host_key_path: None,
            authorized_keys_path: None,
            track_activity: false,
            activity_file: std::env::temp_dir().join("burrow.activity"),
            activity_interval: Duration::from_secs(10),
            auth_rejection_time: Duration::from_secs(1),
        }
    }
}
