//! remote - SSH command-execution server
//!
//! Main entry point for the server binary.

use anyhow::{Context, Result};
use session::{AuthorizedKeys, Dispatcher, DispatcherConfig};
use settings::Config;
use ssh::{ServerOptions, SshServer};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Check if debug mode is enabled via environment variable.
fn is_debug_mode() -> bool {
    std::env::var("REMOTE_DEBUG").is_ok()
}

/// Default log filter, before `RUST_LOG` is consulted.
fn default_filter(debug: bool) -> &'static str {
    if debug {
        "remote=trace,session=trace,ssh=trace,settings=trace,audit=info,russh=debug,info"
    } else {
        "remote=info,session=info,ssh=info,settings=info,audit=info,warn"
    }
}

/// Initialize the logging system.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(is_debug_mode())));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_line_number(true))
        .with(filter)
        .init();

    if is_debug_mode() {
        info!(
            "remote v{} starting up (DEBUG MODE ENABLED)",
            env!("CARGO_PKG_VERSION")
        );
        info!("Set RUST_LOG for custom log levels, e.g. RUST_LOG=session=trace");
    } else {
        info!("remote v{} starting up", env!("CARGO_PKG_VERSION"));
    }
}

fn dispatcher_config(config: &Config) -> DispatcherConfig {
    DispatcherConfig {
        shell: config.shell.clone(),
        pty_drain_grace: config.pty_drain_grace(),
        sftp_server: config.sftp_server.clone(),
        agent_socket_dir: config.agent_socket_dir.clone(),
    }
}

fn listen_address(config: &Config) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port))
}

async fn run(config: Config) -> Result<()> {
    let started = Instant::now();

    let shell = session::resolve_shell(&config.shell).context("Shell check failed")?;
    info!("Using shell {:?}", shell);

    let keys = AuthorizedKeys::load(&config.authorized_keys)
        .context("Failed to load authorized keys")?;
    if keys.is_disabled() {
        warn!(
            "No authorized keys at {:?}, running without authentication",
            config.authorized_keys
        );
    }

    let dispatcher = Arc::new(Dispatcher::new(dispatcher_config(&config)));
    let host_key = config.host_key_path();
    let server = SshServer::new(
        dispatcher,
        Arc::new(keys),
        ServerOptions {
            host_key: host_key.as_deref(),
            idle_timeout: config.idle_timeout(),
        },
    )?;

    info!("Server initialized in {:?}", started.elapsed());
    server.run(listen_address(&config)).await
}

#[tokio::main]
async fn main() {
    init_logging();

    let config = match settings::load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
