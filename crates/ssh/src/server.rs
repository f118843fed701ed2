use crate::handler::ConnectionHandler;
use anyhow::{Context, Result};
use russh::keys::key::KeyPair;
use russh::server::{Config, Server};
use russh::MethodSet;
use session::{AuthorizedKeys, Dispatcher};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Delay before answering a failed authentication attempt.
const AUTH_REJECTION_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Default)]
pub struct ServerOptions<'a> {
    /// Private host key. An ephemeral Ed25519 key is generated when unset.
    pub host_key: Option<&'a Path>,
    /// Disconnect clients idle for this long.
    pub idle_timeout: Option<Duration>,
}

/// Load the host key from `path`, or generate an ephemeral one.
pub fn load_host_key(path: Option<&Path>) -> Result<KeyPair> {
    match path {
        Some(path) => russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path)),
        None => {
            tracing::warn!("No host key configured, generating an ephemeral Ed25519 key");
            KeyPair::generate_ed25519().context("Failed to generate host key")
        }
    }
}

/// SSH listener that feeds every session to the dispatcher.
#[derive(Clone)]
pub struct SshServer {
    dispatcher: Arc<Dispatcher>,
    keys: Arc<AuthorizedKeys>,
    config: Arc<Config>,
}

impl SshServer {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        keys: Arc<AuthorizedKeys>,
        options: ServerOptions<'_>,
    ) -> Result<Self> {
        let host_key = load_host_key(options.host_key)?;

        let methods = if keys.is_disabled() {
            MethodSet::NONE | MethodSet::PUBLICKEY
        } else {
            MethodSet::PUBLICKEY
        };

        let config = Config {
            keys: vec![host_key],
            methods,
            inactivity_timeout: options.idle_timeout,
            auth_rejection_time: AUTH_REJECTION_DELAY,
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Config::default()
        };

        Ok(Self {
            dispatcher,
            keys,
            config: Arc::new(config),
        })
    }

    /// Serve on `addr` until the listener fails.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on {}", addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(mut self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!("SSH server listening on {}", addr);
        let config = self.config.clone();
        self.run_on_socket(config, &listener)
            .await
            .with_context(|| format!("SSH server on {} failed", addr))
    }
}

impl Server for SshServer {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> ConnectionHandler {
        tracing::debug!("New connection from {:?}", peer_addr);
        ConnectionHandler::new(self.dispatcher.clone(), self.keys.clone(), peer_addr)
    }
}
