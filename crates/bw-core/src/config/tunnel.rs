//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the multi-hop tunnel orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Period of the background workspace-info refresh
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,

    /// Upper bound on the agent injection phase only
    #[serde(with = "duration_secs")]
    pub inject_timeout: Duration,

    /// A hop that does not answer a ping within this is considered dead
    #[serde(with = "duration_secs")]
    pub ping_timeout: Duration,

    /// Size of the buffered writer used for streaming calls
    pub stream_buffer_size: usize,

    /// Skip the refresh loop (the orchestrator runs as a proxy)
    pub proxy: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            inject_timeout: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(3),
            stream_buffer_size: 10 * 1024,
            proxy: false,
        }
    }
}
