//! Message types carried as JSON payloads of tunnel RPC calls
//!
//! Field names are camelCase on the wire. Optional fields are omitted when
//! empty so both ends may add fields without breaking older peers.

use serde::{Deserialize, Serialize};

/// Message with no content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Opaque JSON payload, interpreted by the call it is sent with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
}

impl Message {
    /// Wrap an already-encoded payload
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Encode a value as the payload of a message
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message: serde_json::to_string(value)?,
        })
    }

    /// Decode the payload into a value
    pub fn to_value<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.message)
    }
}

/// Severity of a relayed log line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Done,
}

/// Structured log line relayed from the agent to its caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
}

/// Request to relay a port
///
/// `port` is `host:port`, `:port`, a bare port number, or an absolute Unix
/// socket path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPortRequest {
    pub port: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPortResponse {}

/// Request to stop a port relay started with [`ForwardPortRequest`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopForwardPortRequest {
    pub port: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopForwardPortResponse {}

/// Request to stream the contents of a mount source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMountRequest {
    pub mount: String,
}

/// Git credential helper exchange, both request and answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Git author identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitUser {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerCredentialsRequest {
    #[serde(default)]
    pub server_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerCredentials {
    pub server_url: String,
    pub username: String,
    pub secret: String,
}

/// Request to sign a git object with an SSH key held by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSshSignatureRequest {
    pub key_path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSshSignatureResponse {
    pub signature: String,
}

/// Which credential helpers were set up inside the workspace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsInjected {
    #[serde(default)]
    pub docker: bool,
    #[serde(default)]
    pub git: bool,
    #[serde(default)]
    pub git_ssh: bool,
}

/// Final outcome reported by the agent through `SendResult`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    #[serde(default)]
    pub remote_user: String,
    #[serde(default)]
    pub credentials_injected: CredentialsInjected,
    /// Everything else the agent reported
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}
