//! Configuration system for the remote server.
//!
//! Provides compile-time constants and the TOML config file with
//! environment overrides.

pub mod constants;
pub mod file;

pub use file::{load_config, Config, ConfigError};
