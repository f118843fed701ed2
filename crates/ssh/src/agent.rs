//! Agent forwarding over an `auth-agent@openssh.com` channel.
//!
//! A server can only open agent channels from inside a handler callback, so
//! each session gets one channel, opened when its command starts. Local agent
//! connections take turns on it, one request frame and one reply frame at a
//! time, which keeps the channel in step with the client's agent.

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};

/// Largest agent message accepted, as in OpenSSH.
const MAX_MESSAGE: usize = 256 * 1024;
/// How long to wait for the client to confirm the channel.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handler-side end of an agent channel.
pub(crate) struct AgentFeed {
    opened: Option<oneshot::Sender<()>>,
    data: mpsc::UnboundedSender<Vec<u8>>,
}

impl AgentFeed {
    pub(crate) fn confirm(&mut self) {
        if let Some(opened) = self.opened.take() {
            let _ = opened.send(());
        }
    }

    pub(crate) fn push(&self, data: &[u8]) {
        let _ = self.data.send(data.to_vec());
    }
}

/// Relay side of an agent channel, shared by the session's local connections.
pub(crate) struct AgentChannel {
    handle: Handle,
    id: ChannelId,
    replies: Mutex<Replies>,
}

/// Wrap a freshly requested agent channel.
pub(crate) fn channel(handle: Handle, id: ChannelId) -> (Arc<AgentChannel>, AgentFeed) {
    let (opened_tx, opened_rx) = oneshot::channel();
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let agent = AgentChannel {
        handle,
        id,
        replies: Mutex::new(Replies::new(Some(opened_rx), data_rx)),
    };
    let feed = AgentFeed {
        opened: Some(opened_tx),
        data: data_tx,
    };
    (Arc::new(agent), feed)
}

impl AgentChannel {
    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    /// Relay one local connection until it closes.
    pub(crate) async fn serve<S>(&self, mut local: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut replies = self.replies.lock().await;
        replies.wait_open().await?;

        while let Some(request) = read_frame(&mut local).await? {
            self.handle
                .data(self.id, CryptoVec::from_slice(&request))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "agent channel closed"))?;
            // Taken before answering so a vanished local peer can't leave a
            // stale reply behind for the next one.
            let reply = replies.next_frame().await?;
            local.write_all(&reply).await?;
        }
        Ok(())
    }
}

/// Bytes the client's agent sent back, split into frames.
struct Replies {
    opened: Option<oneshot::Receiver<()>>,
    failed: bool,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    buffered: Vec<u8>,
}

impl Replies {
    fn new(
        opened: Option<oneshot::Receiver<()>>,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            opened,
            failed: false,
            incoming,
            buffered: Vec::new(),
        }
    }

    async fn wait_open(&mut self) -> io::Result<()> {
        if let Some(opened) = self.opened.take() {
            match tokio::time::timeout(OPEN_TIMEOUT, opened).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => self.failed = true,
            }
        }
        if self.failed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "client did not open the agent channel",
            ));
        }
        Ok(())
    }

    async fn next_frame(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(len) = frame_len(&self.buffered)? {
                if self.buffered.len() >= 4 + len {
                    return Ok(self.buffered.drain(..4 + len).collect());
                }
            }
            match self.incoming.recv().await {
                Some(chunk) => self.buffered.extend_from_slice(&chunk),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "agent channel closed",
                    ))
                }
            }
        }
    }
}

/// Body length from a frame's 4-byte header, once the header is complete.
fn frame_len(buf: &[u8]) -> io::Result<Option<usize>> {
    let Some(header) = buf.get(..4) else {
        return Ok(None);
    };
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(header);
    checked_len(bytes).map(Some)
}

fn checked_len(header: [u8; 4]) -> io::Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("agent message of {len} bytes is too large"),
        ));
    }
    Ok(len)
}

/// Read one whole frame, header included. `None` on a clean close.
async fn read_frame<R: AsyncRead + Unpin>(local: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match local.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = checked_len(header)?;

    let mut frame = vec![0u8; 4 + len];
    frame[..4].copy_from_slice(&header);
    local.read_exact(&mut frame[4..]).await?;
    Ok(Some(frame))
}
