//! Centralized configuration constants.

/// Listener and process defaults.
pub mod server {
    /// Port used when neither the config file nor the environment sets one.
    pub const DEFAULT_PORT: u16 = 2222;
    /// Ports at or below this value are reserved and rejected at startup.
    pub const MAX_RESERVED_PORT: u16 = 1024;
    /// Shell used for interactive sessions and `-c` commands.
    pub const DEFAULT_SHELL: &str = "bash";
}

/// Environment variables read at startup.
pub mod env {
    /// Listening port override.
    pub const PORT: &str = "REMOTE_PORT";
    /// Shell override.
    pub const SHELL: &str = "REMOTE_SHELL";
    /// Alternate config file location.
    pub const CONFIG: &str = "REMOTE_CONFIG";
}

/// Per-session timing.
pub mod session {
    /// How long the PTY output task may keep draining after the child exits.
    pub const PTY_DRAIN_GRACE_MS: u64 = 1_000;
}

/// Settings file validation limits.
pub mod settings {
    /// Maximum settings file size in bytes (64 KB).
    pub const MAX_FILE_SIZE: u64 = 64 * 1024;
}
