//! Building the process a session runs

use std::path::{Path, PathBuf};

use super::ServerOptions;

/// Program, arguments, working directory and environment of a session workload
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Build the workload for `user`.
    ///
    /// A user other than the server's runs through `su [-] <user> [-c <cmd>]`;
    /// otherwise the configured shell runs as `<shell> [-l] [-c <cmd>]`.
    pub fn for_session(
        options: &ServerOptions,
        user: &str,
        command: Option<&str>,
        pty: bool,
        client_env: &[(String, String)],
    ) -> Self {
        let target_user = (user != options.current_user && !user.is_empty()).then_some(user);
        let command = command.filter(|c| !c.is_empty());

        let (program, args) = match target_user {
            Some(user) => {
                let mut args = Vec::new();
                if pty {
                    args.push("-".to_string());
                }
                args.push(user.to_string());
                if let Some(command) = command {
                    args.push("-c".to_string());
                    args.push(command.to_string());
                }
                ("su".to_string(), args)
            }
            None => {
                let (program, rest) = match options.shell.split_first() {
                    Some((program, rest)) => (program.clone(), rest.to_vec()),
                    None => ("/bin/sh".to_string(), Vec::new()),
                };
                let mut args = rest;
                if pty {
                    args.push("-l".to_string());
                }
                if let Some(command) = command {
                    args.push("-c".to_string());
                    args.push(command.to_string());
                }
                (program, args)
            }
        };

        let mut env: Vec<(String, String)> = std::env::vars().collect();
        env.extend(client_env.iter().cloned());

        Self {
            program,
            args,
            workdir: resolve_workdir(options.workdir.as_deref(), target_user),
            env,
        }
    }

    /// Set or replace an environment variable
    pub fn set_env(&mut self, key: &str, value: &str) {
        self.env.retain(|(k, _)| k != key);
        self.env.push((key.to_string(), value.to_string()));
    }

    pub(crate) fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.env_clear();
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }

    pub(crate) fn to_pty(&self) -> portable_pty::CommandBuilder {
        let mut cmd = portable_pty::CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        cmd.env_clear();
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.workdir {
            cmd.cwd(dir);
        }
        cmd
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Configured workdir if it exists, else the target user's home if it exists
fn resolve_workdir(configured: Option<&Path>, user: Option<&str>) -> Option<PathBuf> {
    if let Some(dir) = configured {
        if dir.exists() {
            return Some(dir.to_path_buf());
        }
    }
    bw_core::user::home_dir(user).filter(|home| home.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::SessionMode;

    fn options(workdir: Option<PathBuf>) -> ServerOptions {
        ServerOptions {
            shell: vec!["/bin/bash".to_string()],
            workdir,
            current_user: "dev".to_string(),
            authorized_keys: Vec::new(),
            mode: SessionMode::Local,
        }
    }

    #[test]
    fn test_same_user_runs_shell() {
        let spec = CommandSpec::for_session(&options(None), "dev", Some("ls -la"), false, &[]);
        assert_eq!(spec.program, "/bin/bash");
        assert_eq!(spec.args, vec!["-c", "ls -la"]);
    }

    #[test]
    fn test_same_user_pty_shell_is_login() {
        let spec = CommandSpec::for_session(&options(None), "dev", None, true, &[]);
        assert_eq!(spec.program, "/bin/bash");
        assert_eq!(spec.args, vec!["-l"]);
    }

    #[test]
    fn test_other_user_runs_through_su() {
        let spec = CommandSpec::for_session(&options(None), "alice", Some("id"), true, &[]);
        assert_eq!(spec.program, "su");
        assert_eq!(spec.args, vec!["-", "alice", "-c", "id"]);

        let spec = CommandSpec::for_session(&options(None), "alice", None, false, &[]);
        assert_eq!(spec.args, vec!["alice"]);
    }

    #[test]
    fn test_shell_arguments_are_kept() {
        let mut opts = options(None);
        opts.shell = vec!["/usr/bin/env".to_string(), "bash".to_string()];
        let spec = CommandSpec::for_session(&opts, "dev", Some("true"), true, &[]);
        assert_eq!(spec.program, "/usr/bin/env");
        assert_eq!(spec.args, vec!["bash", "-l", "-c", "true"]);
    }

    #[test]
    fn test_existing_workdir_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::for_session(
            &options(Some(dir.path().to_path_buf())),
            "dev",
            None,
            false,
            &[],
        );
        assert_eq!(spec.workdir.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_missing_workdir_falls_back_to_home() {
        let spec = CommandSpec::for_session(
            &options(Some(PathBuf::from("/definitely/not/here"))),
            "dev",
            None,
            false,
            &[],
        );
        assert_eq!(spec.workdir, dirs_home().filter(|h| h.exists()));
    }

    #[test]
    fn test_client_env_is_appended() {
        let env = vec![("LANG".to_string(), "C.UTF-8".to_string())];
        let mut spec = CommandSpec::for_session(&options(None), "dev", None, false, &env);
        assert!(spec.env.contains(&("LANG".to_string(), "C.UTF-8".to_string())));

        spec.set_env("TERM", "xterm");
        spec.set_env("TERM", "xterm-256color");
        let terms: Vec<_> = spec.env.iter().filter(|(k, _)| k == "TERM").collect();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].1, "xterm-256color");
    }

    fn dirs_home() -> Option<PathBuf> {
        bw_core::user::home_dir(None)
    }
}
