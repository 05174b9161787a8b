//! Types shared between the orchestrator and the agent commands

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigError;

const ZSTD_LEVEL: i32 = 3;

/// Description of a workspace handed to agent commands on the command line
///
/// Travels as `base64(zstd(json))` in a `--workspace-info` argument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    /// Workspace identifier
    pub id: String,

    /// Container engine binary used by the host agent
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Container the workspace runs in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,

    /// User to run as inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_user: Option<String>,

    /// Path of the agent binary inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_agent_path: Option<String>,

    /// Working directory inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    /// Directory where the host agent keeps workspace state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_dir: Option<PathBuf>,

    /// Options that only the workspace tooling interprets
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

fn default_runtime() -> String {
    "docker".to_string()
}

impl WorkspaceInfo {
    /// Encode for the command line
    pub fn encode(&self) -> Result<String, ConfigError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ConfigError::Invalid(format!("encode workspace info: {}", e)))?;
        let compressed = zstd::stream::encode_all(&json[..], ZSTD_LEVEL)
            .map_err(|e| ConfigError::Invalid(format!("compress workspace info: {}", e)))?;
        Ok(BASE64.encode(compressed))
    }

    /// Decode a `--workspace-info` argument
    pub fn decode(encoded: &str) -> Result<Self, ConfigError> {
        let compressed = BASE64
            .decode(encoded.trim())
            .map_err(|e| ConfigError::Invalid(format!("decode workspace info: {}", e)))?;
        let json = zstd::stream::decode_all(&compressed[..])
            .map_err(|e| ConfigError::Invalid(format!("decompress workspace info: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| ConfigError::Invalid(format!("parse workspace info: {}", e)))
    }
}
