//! Relay hop configuration

use serde::{Deserialize, Serialize};

/// Policy of a relay sitting between two tunnel endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Forward `docker_credentials` upstream instead of rejecting it
    pub allow_docker_credentials: bool,

    /// Static git username answered locally together with `git_token`
    pub git_username: Option<String>,

    /// Static git token; when set, git credential requests never leave the relay
    pub git_token: Option<String>,

    /// Log every relayed method and its error
    pub show_logs: bool,
}

impl RelayConfig {
    /// The static identity, if a non-empty token is configured
    pub fn git_identity(&self) -> Option<(String, String)> {
        self.git_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .map(|token| {
                (
                    self.git_username.clone().unwrap_or_default(),
                    token.to_string(),
                )
            })
    }
}
