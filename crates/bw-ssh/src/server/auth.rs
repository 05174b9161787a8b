//! Host keys, authorized keys and the `--token` format

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::SshError;

/// Credentials handed to `helper ssh-server --token`
///
/// The token is base64 of this JSON; each field is itself base64.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerToken {
    /// base64 of an authorized_keys file
    #[serde(default)]
    pub authorized_keys: String,

    /// base64 of a private host key (OpenSSH or PEM)
    #[serde(default)]
    pub host_key: String,
}

impl ServerToken {
    /// Decode a token string
    pub fn parse(token: &str) -> Result<Self, SshError> {
        let raw = BASE64
            .decode(token.trim())
            .map_err(|e| SshError::Token(format!("decode token: {}", e)))?;
        serde_json::from_slice(&raw).map_err(|e| SshError::Token(format!("parse token: {}", e)))
    }

    /// Encode into the command-line form
    pub fn encode(&self) -> Result<String, SshError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| SshError::Token(format!("encode token: {}", e)))?;
        Ok(BASE64.encode(json))
    }

    /// Public keys allowed to log in; empty when the token carries none
    pub fn authorized_keys(&self) -> Result<Vec<PublicKey>, SshError> {
        if self.authorized_keys.is_empty() {
            return Ok(Vec::new());
        }
        let text = decode_field(&self.authorized_keys, "authorized keys")?;
        parse_authorized_keys(&text)
    }

    /// Host key carried by the token, if any
    pub fn host_key(&self) -> Result<Option<PrivateKey>, SshError> {
        if self.host_key.is_empty() {
            return Ok(None);
        }
        let pem = decode_field(&self.host_key, "host key")?;
        Ok(Some(russh::keys::decode_secret_key(&pem, None)?))
    }
}

fn decode_field(value: &str, what: &str) -> Result<String, SshError> {
    let raw = BASE64
        .decode(value.trim())
        .map_err(|e| SshError::Token(format!("decode {}: {}", what, e)))?;
    String::from_utf8(raw).map_err(|e| SshError::Token(format!("decode {}: {}", what, e)))
}

/// Parse an authorized_keys file, skipping blank lines and comments.
///
/// Any other line that does not hold a public key fails the whole file.
pub fn parse_authorized_keys(text: &str) -> Result<Vec<PublicKey>, SshError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_authorized_key)
        .collect()
}

fn parse_authorized_key(line: &str) -> Result<PublicKey, SshError> {
    // options may precede the key type
    let fields: Vec<&str> = line.split_whitespace().collect();
    (0..fields.len())
        .find_map(|start| PublicKey::from_openssh(&fields[start..].join(" ")).ok())
        .ok_or_else(|| SshError::AuthorizedKey(line.to_string()))
}

/// Whether `key` is one of `allowed`; comments are ignored
pub(crate) fn is_authorized(allowed: &[PublicKey], key: &PublicKey) -> bool {
    allowed.iter().any(|k| k.key_data() == key.key_data())
}

/// Load a private host key from disk
pub fn load_host_key(path: &Path) -> Result<PrivateKey, SshError> {
    tracing::info!("Loading host key from {:?}", path);
    Ok(russh::keys::load_secret_key(path, None)?)
}

/// Generate a fresh Ed25519 host key for this process
pub fn generate_host_key() -> Result<PrivateKey, SshError> {
    PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| SshError::HostKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openssh_line(key: &PrivateKey, comment: &str) -> String {
        format!("{} {}", key.public_key().to_openssh().unwrap(), comment)
    }

    #[test]
    fn test_parse_authorized_keys_skips_comments_and_reads_options() {
        let key = generate_host_key().unwrap();
        let text = format!(
            "# comment\n\n{}\nno-pty,command=\"echo hi\" {}\n",
            openssh_line(&key, "dev@host"),
            openssh_line(&key, "with-options")
        );

        let keys = parse_authorized_keys(&text).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(is_authorized(&keys, key.public_key()));
    }

    #[test]
    fn test_unparsable_line_fails_the_file() {
        let key = generate_host_key().unwrap();
        let text = format!(
            "{}\nssh-ed25519 !!!not-a-key!!! alice@laptop\n",
            openssh_line(&key, "dev@host")
        );

        match parse_authorized_keys(&text) {
            Err(SshError::AuthorizedKey(line)) => assert!(line.contains("alice@laptop")),
            other => panic!("Expected a parse error, got {:?}", other.map(|k| k.len())),
        }
    }

    #[test]
    fn test_unknown_key_is_not_authorized() {
        let allowed = vec![generate_host_key().unwrap().public_key().clone()];
        let other = generate_host_key().unwrap();
        assert!(!is_authorized(&allowed, other.public_key()));
    }

    #[test]
    fn test_token_roundtrip_carries_keys() {
        let key = generate_host_key().unwrap();
        let token = ServerToken {
            authorized_keys: BASE64.encode(openssh_line(&key, "c")),
            host_key: String::new(),
        };

        let parsed = ServerToken::parse(&token.encode().unwrap()).unwrap();
        assert_eq!(parsed.authorized_keys().unwrap().len(), 1);
        assert!(parsed.host_key().unwrap().is_none());
    }

    #[test]
    fn test_token_with_bad_key_is_rejected() {
        let token = ServerToken {
            authorized_keys: BASE64.encode("ssh-ed25519 !!!not-a-key!!! alice@laptop"),
            host_key: String::new(),
        };
        assert!(matches!(
            token.authorized_keys(),
            Err(SshError::AuthorizedKey(_))
        ));
    }

    #[test]
    fn test_bad_token_is_rejected() {
        assert!(matches!(
            ServerToken::parse("%%%"),
            Err(SshError::Token(_))
        ));
        let not_json = BASE64.encode("nope");
        assert!(matches!(
            ServerToken::parse(&not_json),
            Err(SshError::Token(_))
        ));
    }
}
