//! Credential-agent forwarding.

use crate::SessionControl;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

/// Variable that points clients of the agent at the forwarded socket.
pub const AUTH_SOCK_VAR: &str = "SSH_AUTH_SOCK";

const SOCKET_NAME: &str = "listener.sock";

/// Local agent socket relaying every connection to the client's agent.
///
/// Dropping it stops accepting and removes the socket directory.
pub struct AgentListener {
    _dir: TempDir,
    path: PathBuf,
    task: JoinHandle<()>,
}

impl AgentListener {
    /// Bind a socket in a fresh private directory under `parent`, or under
    /// the system temp dir.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(control: Arc<dyn SessionControl>, parent: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("auth-agent");
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        let path = dir.path().join(SOCKET_NAME);
        let listener = UnixListener::bind(&path)?;
        tracing::debug!("Agent listener bound at {:?}", path);

        let task = tokio::spawn(accept_loop(listener, control));
        Ok(Self {
            _dir: dir,
            path,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AgentListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: UnixListener, control: Arc<dyn SessionControl>) {
    loop {
        let local = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::debug!("Agent listener stopped accepting: {}", e);
                break;
            }
        };
        tokio::spawn(forward(local, control.clone()));
    }
}

async fn forward(mut local: UnixStream, control: Arc<dyn SessionControl>) {
    let mut remote = match control.open_agent_channel().await {
        Ok(remote) => remote,
        Err(e) => {
            tracing::warn!("Failed to open agent channel: {:#}", e);
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((sent, received)) => {
            tracing::trace!("Agent connection closed ({} bytes out, {} in)", sent, received)
        }
        Err(e) => tracing::debug!("Agent connection ended: {}", e),
    }
}
