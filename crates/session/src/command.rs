//! Child process construction.

use crate::SessionError;
use indexmap::IndexMap;
use std::path::PathBuf;

/// Executable, argument vector and fully resolved environment of a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    program: String,
    args: Vec<String>,
    env: IndexMap<String, String>,
}

impl ProcessSpec {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        env: IndexMap<String, String>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            env,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Set one variable, replacing any previous value.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Pipe-mode command. Stdio is left for the caller to configure.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).env_clear().envs(&self.env);
        cmd
    }

    /// Pty-mode command, started in the server's working directory.
    pub fn to_pty_command(&self) -> portable_pty::CommandBuilder {
        let mut cmd = portable_pty::CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        cmd.env_clear();
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd
    }
}

/// Turns a session's command text and environment into a [`ProcessSpec`].
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    shell: String,
}

impl CommandBuilder {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Build against the server's own environment.
    pub fn build(&self, raw_command: &str, session_env: &[(String, String)]) -> ProcessSpec {
        self.build_with_host_env(raw_command, session_env, host_env())
    }

    /// Empty `raw_command` runs the shell bare; anything else runs as
    /// `shell -c raw_command` without re-splitting. Session entries are
    /// applied over `host_env` in order, so the last duplicate wins.
    pub fn build_with_host_env(
        &self,
        raw_command: &str,
        session_env: &[(String, String)],
        host_env: impl IntoIterator<Item = (String, String)>,
    ) -> ProcessSpec {
        let args = if raw_command.is_empty() {
            Vec::new()
        } else {
            vec!["-c".to_string(), raw_command.to_string()]
        };

        let mut env: IndexMap<String, String> = host_env.into_iter().collect();
        for (key, value) in session_env {
            env.insert(key.clone(), value.clone());
        }

        ProcessSpec::new(self.shell.clone(), args, env)
    }
}

/// Host environment, skipping entries that are not valid UTF-8.
fn host_env() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

/// Locate the shell on `PATH`.
pub fn resolve_shell(shell: &str) -> Result<PathBuf, SessionError> {
    which::which(shell).map_err(|source| SessionError::ShellNotFound {
        shell: shell.to_string(),
        source,
    })
}
