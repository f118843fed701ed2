//! Default filesystem locations for the remote server.
//!
//! Directories are resolved once and cached.

use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// System-wide fallback when no per-user config directory exists.
const SYSTEM_CONFIG_DIR: &str = "/etc/remote";

/// ~/.config/remote, or /etc/remote when the platform has no config dir.
pub fn config_dir() -> &'static PathBuf {
    CONFIG_DIR.get_or_init(|| {
        dirs::config_dir()
            .map(|dir| dir.join("remote"))
            .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_DIR))
    })
}

/// Config file path: config_dir()/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Trusted client keys, one OpenSSH public key per line.
pub fn authorized_keys_file() -> PathBuf {
    config_dir().join("authorized_keys")
}

/// Persistent host key. When absent the server generates an ephemeral one.
pub fn host_key_file() -> PathBuf {
    config_dir().join("ssh_host_ed25519_key")
}
