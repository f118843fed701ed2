use thiserror::Error;

/// Errors that end a session before or while its bridge runs.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to allocate pty: {0}")]
    PtyAllocation(String),

    #[error("pty i/o failed: {0}")]
    PtyIo(String),

    #[error("child {stream} pipe was not captured")]
    MissingPipe { stream: &'static str },

    #[error("failed to start agent forwarding: {0}")]
    AgentForwarding(#[source] std::io::Error),

    #[error("shell {shell} was not found on PATH")]
    ShellNotFound {
        shell: String,
        #[source]
        source: which::Error,
    },
}

impl SessionError {
    /// Message shown to the client on the session's error stream.
    pub fn client_message(&self) -> String {
        match self {
            Self::PtyAllocation(_) | Self::PtyIo(_) => "failed to start a terminal".to_string(),
            Self::AgentForwarding(_) => "failed to start agent forwarding".to_string(),
            other => other.to_string(),
        }
    }
}
