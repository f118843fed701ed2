//! Transport-neutral view of an inbound session.

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Duplex byte stream, as handed to subsystems.
pub trait ByteStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> ByteStream for T {}

pub type BoxedStream = Pin<Box<dyn ByteStream>>;

/// Random per-session identifier used to correlate audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u16,
    pub height: u16,
}

impl WindowSize {
    /// Clamp the transport's 32-bit dimensions into the pty's range.
    pub fn from_u32(width: u32, height: u32) -> Self {
        Self {
            width: width.min(u16::MAX as u32) as u16,
            height: height.min(u16::MAX as u32) as u16,
        }
    }
}

impl From<WindowSize> for portable_pty::PtySize {
    fn from(size: WindowSize) -> Self {
        portable_pty::PtySize {
            rows: size.height,
            cols: size.width,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// A client's pseudo-terminal request plus its live resize events.
pub struct PtyRequest {
    pub term: String,
    pub size: WindowSize,
    pub resizes: mpsc::UnboundedReceiver<WindowSize>,
}

impl fmt::Debug for PtyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyRequest")
            .field("term", &self.term)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Reporting primitives the transport provides for one session.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Deliver the exit status. Called at most once per session.
    async fn exit(&self, status: u32) -> anyhow::Result<()>;

    /// Close the session handle.
    async fn close(&self) -> anyhow::Result<()>;

    /// Open a channel back to the client's credential agent.
    async fn open_agent_channel(&self) -> anyhow::Result<BoxedStream>;
}

/// An authenticated session, owned by the dispatcher while it runs.
pub struct Session {
    pub user: String,
    pub remote_addr: Option<SocketAddr>,
    /// Empty means an interactive shell.
    pub raw_command: String,
    /// Client environment in arrival order.
    pub env: Vec<(String, String)>,
    pub pty: Option<PtyRequest>,
    pub agent_forwarding: bool,
    pub stdin: BoxedReader,
    pub stdout: BoxedWriter,
    pub stderr: BoxedWriter,
    pub control: Arc<dyn SessionControl>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("remote_addr", &self.remote_addr)
            .field("raw_command", &self.raw_command)
            .field("env", &self.env)
            .field("pty", &self.pty)
            .field("agent_forwarding", &self.agent_forwarding)
            .finish_non_exhaustive()
    }
}
