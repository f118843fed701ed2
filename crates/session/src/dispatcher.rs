//! Per-session controller.

use crate::agent::{AgentListener, AUTH_SOCK_VAR};
use crate::audit::{AuditSink, Auditor, TracingAuditSink};
use crate::command::CommandBuilder;
use crate::exit_status::{ExitOutcome, FAILURE_STATUS};
use crate::sftp::{self, SftpSubsystem};
use crate::{pipe_bridge, pty_bridge, BoxedWriter, Session, SessionControl, SessionError, SessionId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

/// Server-wide settings the dispatcher runs every session with.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub shell: String,
    pub pty_drain_grace: Duration,
    pub sftp_server: Option<PathBuf>,
    /// Parent of per-session agent socket directories.
    pub agent_socket_dir: Option<PathBuf>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            pty_drain_grace: Duration::from_secs(1),
            sftp_server: None,
            agent_socket_dir: None,
        }
    }
}

/// Runs sessions. Shared read-only between all of them.
pub struct Dispatcher {
    builder: CommandBuilder,
    pty_drain_grace: Duration,
    sftp: SftpSubsystem,
    agent_socket_dir: Option<PathBuf>,
    audit_sink: Arc<dyn AuditSink>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            builder: CommandBuilder::new(config.shell),
            pty_drain_grace: config.pty_drain_grace,
            sftp: SftpSubsystem::new(config.sftp_server),
            agent_socket_dir: config.agent_socket_dir,
            audit_sink: Arc::new(TracingAuditSink),
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    /// Run a shell or exec session to completion.
    ///
    /// Reports exactly one exit status and closes the session on every path.
    pub async fn dispatch(&self, session: Session) {
        let id = SessionId::new();
        let span = tracing::info_span!(
            "session",
            session.id = %id,
            remote.address = ?session.remote_addr,
            user = %session.user,
        );
        self.run_session(id, session).instrument(span).await
    }

    async fn run_session(&self, id: SessionId, session: Session) {
        let started = Instant::now();
        tracing::info!(command = %session.raw_command, "Session started");

        let control = session.control.clone();
        let status = self.execute(id, session).await;

        finish(control.as_ref(), status).await;
        tracing::info!(duration = ?started.elapsed(), status, "Session closed");
    }

    async fn execute(&self, id: SessionId, session: Session) -> u32 {
        let Session {
            raw_command,
            env,
            pty,
            agent_forwarding,
            stdin,
            stdout,
            mut stderr,
            control,
            ..
        } = session;

        let auditor = Auditor::new(id, self.audit_sink.clone());
        let mut spec = self.builder.build(&raw_command, &env);

        // Held until the child is done with it.
        let _agent = if agent_forwarding {
            tracing::info!("Agent forwarding requested");
            match AgentListener::bind(control, self.agent_socket_dir.as_deref()) {
                Ok(listener) => {
                    spec = spec.with_env(AUTH_SOCK_VAR, listener.path().to_string_lossy());
                    Some(listener)
                }
                Err(e) => {
                    let err = SessionError::AgentForwarding(e);
                    tracing::error!("{}", err);
                    write_error(&mut stderr, &err.client_message()).await;
                    return FAILURE_STATUS;
                }
            }
        } else {
            None
        };

        let result = match pty {
            Some(request) => {
                tracing::info!(term = %request.term, "Handling pty session");
                pty_bridge::run(
                    &spec,
                    request,
                    &auditor,
                    self.pty_drain_grace,
                    stdin,
                    stdout,
                )
                .await
            }
            None => {
                tracing::info!("Handling non-pty session");
                let mut stdout = stdout;
                pipe_bridge::run(&spec, &auditor, stdin, &mut stdout, &mut stderr).await
            }
        };

        match result {
            Ok(ExitOutcome::StartFailed { error }) => {
                write_error(&mut stderr, &error).await;
                FAILURE_STATUS
            }
            Ok(outcome) => {
                tracing::debug!(?outcome, "Child finished");
                outcome.status()
            }
            Err(e) => {
                tracing::error!("Session failed: {}", e);
                write_error(&mut stderr, &e.client_message()).await;
                FAILURE_STATUS
            }
        }
    }

    /// Run a named subsystem on the session's raw stream.
    pub async fn subsystem(&self, name: &str, session: Session) {
        let id = SessionId::new();
        let span = tracing::info_span!(
            "session",
            session.id = %id,
            remote.address = ?session.remote_addr,
            user = %session.user,
            subsystem = name,
        );

        async move {
            let started = Instant::now();
            tracing::info!("Subsystem session started");

            let Session {
                stdin,
                stdout,
                mut stderr,
                control,
                ..
            } = session;

            let status = if name == sftp::SUBSYSTEM_NAME {
                match self.sftp.serve(stdin, stdout).await {
                    Ok(()) => {
                        tracing::info!("sftp client exited session");
                        0
                    }
                    Err(e) => {
                        tracing::error!("sftp server completed with error: {}", e);
                        FAILURE_STATUS
                    }
                }
            } else {
                tracing::warn!("Unsupported subsystem");
                write_error(&mut stderr, &format!("subsystem {name} is not supported")).await;
                FAILURE_STATUS
            };

            finish(control.as_ref(), status).await;
            tracing::info!(duration = ?started.elapsed(), "Subsystem session closed");
        }
        .instrument(span)
        .await
    }
}

/// Write a client-visible error line.
async fn write_error(stderr: &mut BoxedWriter, message: &str) {
    let line = format!("{message}\n");
    let result = async {
        stderr.write_all(line.as_bytes()).await?;
        stderr.flush().await
    }
    .await;
    if let Err(e) = result {
        tracing::error!("Failed to write error back to session: {}", e);
    }
}

async fn finish(control: &dyn SessionControl, status: u32) {
    if let Err(e) = control.exit(status).await {
        tracing::debug!("Failed to report exit status {}: {:#}", status, e);
    }
    if let Err(e) = control.close().await {
        tracing::debug!("Failed to close session: {:#}", e);
    }
}
