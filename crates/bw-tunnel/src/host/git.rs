//! Answers to git questions from the local git installation

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use bw_protocol::message::{GitCredentials, GitSshSignatureRequest, GitSshSignatureResponse, GitUser};

use crate::error::TunnelError;

/// Run `program args`, feed it `input` and return its stdout
pub(crate) async fn run_with_input(
    program: &str,
    args: &[&str],
    input: &[u8],
) -> Result<String, TunnelError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TunnelError::remote(bw_protocol::ErrorCode::Unavailable, format!("start {}: {}", program, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(TunnelError::internal(format!(
            "{} {}: {} ({})",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim(),
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn config_value(key: &str) -> String {
    match run_with_input("git", &["config", "--global", key], b"").await {
        Ok(value) => value.trim().to_string(),
        Err(e) => {
            tracing::debug!("git config {}: {}", key, e);
            String::new()
        }
    }
}

/// Name and email from the global git config; missing values are empty
pub(crate) async fn user() -> GitUser {
    GitUser {
        name: config_value("user.name").await,
        email: config_value("user.email").await,
    }
}

/// Render a request in git's credential helper format
pub(crate) fn credential_input(request: &GitCredentials) -> String {
    let mut input = String::new();
    let fields = [
        ("protocol", &request.protocol),
        ("host", &request.host),
        ("path", &request.path),
        ("username", &request.username),
        ("password", &request.password),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            input.push_str(&format!("{}={}\n", key, value));
        }
    }
    if request.host.is_none() {
        if let Some(url) = &request.url {
            input.push_str(&format!("url={}\n", url));
        }
    }
    input.push('\n');
    input
}

/// Parse git's `key=value` credential output on top of `request`
pub(crate) fn parse_credentials(request: &GitCredentials, output: &str) -> GitCredentials {
    let mut credentials = request.clone();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = Some(value.to_string());
        match key {
            "protocol" => credentials.protocol = value,
            "host" => credentials.host = value,
            "path" => credentials.path = value,
            "username" => credentials.username = value,
            "password" => credentials.password = value,
            _ => {}
        }
    }
    credentials
}

/// Ask `git credential fill` for credentials
pub(crate) async fn fill_credentials(request: &GitCredentials) -> Result<GitCredentials, TunnelError> {
    let output = run_with_input("git", &["credential", "fill"], credential_input(request).as_bytes()).await?;
    Ok(parse_credentials(request, &output))
}

/// Sign `content` with the SSH key at `key_path` in the git namespace
pub(crate) async fn ssh_signature(
    request: &GitSshSignatureRequest,
) -> Result<GitSshSignatureResponse, TunnelError> {
    if request.key_path.is_empty() {
        return Err(TunnelError::invalid_argument("missing signing key path"));
    }
    let signature = run_with_input(
        "ssh-keygen",
        &["-Y", "sign", "-f", &request.key_path, "-n", "git"],
        request.content.as_bytes(),
    )
    .await?;
    Ok(GitSshSignatureResponse { signature })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_input_format() {
        let request = GitCredentials {
            protocol: Some("https".to_string()),
            host: Some("github.com".to_string()),
            path: Some("org/repo.git".to_string()),
            ..Default::default()
        };
        assert_eq!(
            credential_input(&request),
            "protocol=https\nhost=github.com\npath=org/repo.git\n\n"
        );
    }

    #[test]
    fn test_credential_input_falls_back_to_url() {
        let request = GitCredentials {
            url: Some("https://example.com/repo".to_string()),
            ..Default::default()
        };
        assert_eq!(credential_input(&request), "url=https://example.com/repo\n\n");
    }

    #[test]
    fn test_parse_credentials_keeps_request_fields() {
        let request = GitCredentials {
            protocol: Some("https".to_string()),
            host: Some("github.com".to_string()),
            ..Default::default()
        };
        let parsed = parse_credentials(&request, "username=jane\npassword=s3cr=t\nquit=0\n");

        assert_eq!(parsed.host.as_deref(), Some("github.com"));
        assert_eq!(parsed.username.as_deref(), Some("jane"));
        assert_eq!(parsed.password.as_deref(), Some("s3cr=t"));
    }
}
