use crate::agent::AgentChannel;
use anyhow::anyhow;
use async_trait::async_trait;
use russh::server::Handle;
use russh::ChannelId;
use session::{BoxedStream, SessionControl};
use std::sync::Arc;

const AGENT_BUFFER: usize = 64 * 1024;

/// Reports a session's outcome on its SSH channel.
#[derive(Clone)]
pub struct ChannelControl {
    handle: Handle,
    channel: ChannelId,
    agent: Option<Arc<AgentChannel>>,
}

impl ChannelControl {
    pub(crate) fn new(handle: Handle, channel: ChannelId, agent: Option<Arc<AgentChannel>>) -> Self {
        Self {
            handle,
            channel,
            agent,
        }
    }
}

#[async_trait]
impl SessionControl for ChannelControl {
    async fn exit(&self, status: u32) -> anyhow::Result<()> {
        self.handle
            .exit_status_request(self.channel, status)
            .await
            .map_err(|_| anyhow!("connection closed before exit status {status} was sent"))
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Some(agent) = &self.agent {
            let _ = self.handle.close(agent.id()).await;
        }
        // Client may already have closed its side
        let _ = self.handle.eof(self.channel).await;
        self.handle
            .close(self.channel)
            .await
            .map_err(|_| anyhow!("connection closed before channel close"))
    }

    async fn open_agent_channel(&self) -> anyhow::Result<BoxedStream> {
        let agent = self
            .agent
            .clone()
            .ok_or_else(|| anyhow!("no agent channel is open for this session"))?;

        let (local, relay) = tokio::io::duplex(AGENT_BUFFER);
        tokio::spawn(async move {
            if let Err(e) = agent.serve(relay).await {
                tracing::debug!("Agent relay on {:?} ended: {}", agent.id(), e);
            }
        });
        Ok(Box::pin(local))
    }
}
