//! TOML config file support with environment overrides.
//!
//! Config location: `~/.config/remote/config.toml`, or the path in
//! `$REMOTE_CONFIG`. Environment variables win over file values.

use crate::constants;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Startup-fatal configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is too large ({size} bytes)", .path.display())]
    TooLarge { path: PathBuf, size: u64 },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{value} is not a valid port number")]
    InvalidPort { value: String },
    #[error("{port} is a reserved port")]
    ReservedPort { port: u16 },
    #[error("shell must not be empty")]
    EmptyShell,
}

/// Server config parsed from TOML.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// TCP port to listen on.
    pub port: u16,
    /// Shell for interactive sessions and `-c` commands.
    pub shell: String,
    /// OpenSSH authorized_keys file. Missing file disables authentication.
    pub authorized_keys: PathBuf,
    /// Host private key. Falls back to the default location, then to an
    /// ephemeral key.
    pub host_key: Option<PathBuf>,
    /// External sftp-server binary for the `sftp` subsystem.
    pub sftp_server: Option<PathBuf>,
    /// Where forwarded agent sockets are created. System temp dir when unset.
    pub agent_socket_dir: Option<PathBuf>,
    /// Grace period for draining PTY output after the child exits.
    pub pty_drain_grace_ms: u64,
    /// Disconnect clients idle for this long.
    pub idle_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: constants::server::DEFAULT_PORT,
            shell: constants::server::DEFAULT_SHELL.to_string(),
            authorized_keys: remote_paths::authorized_keys_file(),
            host_key: None,
            sftp_server: None,
            agent_socket_dir: None,
            pty_drain_grace_ms: constants::session::PTY_DRAIN_GRACE_MS,
            idle_timeout_secs: None,
        }
    }
}

impl Config {
    /// Read a config file. A missing file yields defaults unless `required`.
    pub fn from_file(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!("No config file at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        // Size guard
        if metadata.len() > constants::settings::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge {
                path: path.to_path_buf(),
                size: metadata.len(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(constants::env::PORT) {
            self.port = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort { value })?;
        }

        if let Some(shell) = lookup(constants::env::SHELL) {
            self.shell = shell;
        }

        Ok(())
    }

    /// Reject values the server cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port <= constants::server::MAX_RESERVED_PORT {
            return Err(ConfigError::ReservedPort { port: self.port });
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::EmptyShell);
        }
        Ok(())
    }

    /// Configured host key, or the default key file when it exists.
    pub fn host_key_path(&self) -> Option<PathBuf> {
        self.host_key.clone().or_else(|| {
            let default = remote_paths::host_key_file();
            default.is_file().then_some(default)
        })
    }

    pub fn pty_drain_grace(&self) -> Duration {
        Duration::from_millis(self.pty_drain_grace_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Load the config file, apply the process environment and validate.
pub fn load_config() -> Result<Config, ConfigError> {
    let explicit = std::env::var_os(constants::env::CONFIG).map(PathBuf::from);
    let required = explicit.is_some();
    let path = explicit.unwrap_or_else(remote_paths::config_file);

    let mut config = Config::from_file(&path, required)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;

    tracing::debug!(?config, "Loaded configuration");
    Ok(config)
}
