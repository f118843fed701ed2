//! Per-connection request handling.

use crate::agent::{self, AgentFeed};
use crate::control::ChannelControl;
use crate::forward;
use async_trait::async_trait;
use russh::keys::key::PublicKey;
use russh::server::{Auth, Handler, Msg, Session as SshSession};
use russh::{Channel, ChannelId, Pty};
use session::{AuthorizedKeys, Dispatcher, PtyRequest, Session, WindowSize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Requests collected on a session channel before `shell` or `exec`.
#[derive(Default)]
struct PendingChannel {
    channel: Option<Channel<Msg>>,
    env: Vec<(String, String)>,
    pty: Option<(String, WindowSize)>,
    resizes: Option<mpsc::UnboundedSender<WindowSize>>,
    agent_forwarding: bool,
}

/// What a started channel runs.
enum Start {
    Command(String),
    Subsystem(String),
}

pub struct ConnectionHandler {
    dispatcher: Arc<Dispatcher>,
    keys: Arc<AuthorizedKeys>,
    peer: Option<SocketAddr>,
    user: String,
    channels: HashMap<ChannelId, PendingChannel>,
    agents: HashMap<ChannelId, AgentFeed>,
    forwards: HashMap<(String, u32), AbortHandle>,
}

impl ConnectionHandler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        keys: Arc<AuthorizedKeys>,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            dispatcher,
            keys,
            peer,
            user: String::new(),
            channels: HashMap::new(),
            agents: HashMap::new(),
            forwards: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    /// Hand the channel to the dispatcher on its own task.
    fn start(&mut self, id: ChannelId, what: Start, ssh: &mut SshSession) -> bool {
        let Some(pending) = self.channels.get_mut(&id) else {
            return false;
        };
        // A channel runs at most one command.
        let Some(channel) = pending.channel.take() else {
            tracing::debug!("Channel {:?} already started", id);
            return false;
        };

        let pty = pending.pty.take().map(|(term, size)| {
            let (tx, rx) = mpsc::unbounded_channel();
            pending.resizes = Some(tx);
            PtyRequest {
                term,
                size,
                resizes: rx,
            }
        });

        let agent = if pending.agent_forwarding {
            match ssh.channel_open_agent() {
                Ok(agent_id) => {
                    let (agent, feed) = agent::channel(ssh.handle(), agent_id);
                    self.agents.insert(agent_id, feed);
                    Some(agent)
                }
                Err(e) => {
                    tracing::warn!("Failed to open agent channel: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let stderr = channel.make_writer_ext(Some(1));
        let (stdin, stdout) = tokio::io::split(channel.into_stream());

        let session = Session {
            user: self.user.clone(),
            remote_addr: self.peer,
            raw_command: match &what {
                Start::Command(raw) => raw.clone(),
                Start::Subsystem(_) => String::new(),
            },
            env: std::mem::take(&mut pending.env),
            pty,
            agent_forwarding: pending.agent_forwarding,
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            control: Arc::new(ChannelControl::new(ssh.handle(), id, agent)),
        };

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            match what {
                Start::Command(_) => dispatcher.dispatch(session).await,
                Start::Subsystem(name) => dispatcher.subsystem(&name, session).await,
            }
        });
        true
    }

    fn reply(ssh: &mut SshSession, id: ChannelId, ok: bool) {
        if ok {
            let _ = ssh.channel_success(id);
        } else {
            let _ = ssh.channel_failure(id);
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        for (_, task) in self.forwards.drain() {
            task.abort();
        }
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.keys.is_disabled() {
            self.user = user.to_string();
            return Ok(Auth::Accept);
        }
        Ok(Self::reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.keys.is_disabled() || self.keys.authorize(public_key, self.peer) {
            self.user = user.to_string();
            return Ok(Auth::Accept);
        }
        Ok(Self::reject())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(
            channel.id(),
            PendingChannel {
                channel: Some(channel),
                ..PendingChannel::default()
            },
        );
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        // Drops the resize sender, which ends the pty resize task.
        self.channels.remove(&channel);
        self.agents.remove(&channel);
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        // The client's agent won't answer any more requests.
        self.agents.remove(&channel);
        Ok(())
    }

    async fn channel_open_confirmation(
        &mut self,
        id: ChannelId,
        _max_packet_size: u32,
        _window_size: u32,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        if let Some(feed) = self.agents.get_mut(&id) {
            tracing::debug!("Client opened agent channel {:?}", id);
            feed.confirm();
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        if let Some(feed) = self.agents.get(&channel) {
            feed.push(data);
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let ok = match self.channels.get_mut(&channel) {
            Some(pending) => {
                pending
                    .env
                    .push((variable_name.to_string(), variable_value.to_string()));
                true
            }
            None => false,
        };
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let ok = match self.channels.get_mut(&channel) {
            Some(pending) => {
                let size = WindowSize::from_u32(col_width, row_height);
                pending.pty = Some((term.to_string(), size));
                true
            }
            None => false,
        };
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let size = WindowSize::from_u32(col_width, row_height);
        if let Some(pending) = self.channels.get_mut(&channel) {
            if let Some(resizes) = &pending.resizes {
                let _ = resizes.send(size);
            } else if let Some((_, initial)) = pending.pty.as_mut() {
                *initial = size;
            }
        }
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        match self.channels.get_mut(&channel) {
            Some(pending) => {
                pending.agent_forwarding = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let ok = self.start(channel, Start::Command(String::new()), session);
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        let ok = self.start(channel, Start::Command(command), session);
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let ok = if name == session::sftp::SUBSYSTEM_NAME {
            self.start(channel, Start::Subsystem(name.to_string()), session)
        } else {
            tracing::info!("Refusing unsupported subsystem {:?}", name);
            false
        };
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        tracing::info!(
            "Accepted forward to {}:{} from {}:{}",
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port
        );
        tokio::spawn(forward::relay_direct(
            channel,
            host_to_connect.to_string(),
            port_to_connect,
        ));
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        let Ok(requested) = u16::try_from(*port) else {
            return Ok(false);
        };
        let listener = match TcpListener::bind((forward::bind_address(address), requested)).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!("Failed to bind remote forward {}:{}: {}", address, port, e);
                return Ok(false);
            }
        };
        if *port == 0 {
            *port = u32::from(listener.local_addr()?.port());
        }
        tracing::info!("Bound remote forward {}:{}", address, port);

        let task = tokio::spawn(forward::accept_remote(
            listener,
            session.handle(),
            address.to_string(),
            *port,
        ));
        if let Some(previous) = self
            .forwards
            .insert((address.to_string(), *port), task.abort_handle())
        {
            previous.abort();
        }
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        match self.forwards.remove(&(address.to_string(), port)) {
            Some(task) => {
                task.abort();
                tracing::info!("Cancelled remote forward {}:{}", address, port);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
