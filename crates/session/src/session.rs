//! Session execution engine.
//!
//! Takes an authenticated session from the transport, builds the child
//! command, runs it on a pseudo-terminal or over plain pipes, mirrors the
//! traffic into the audit log and reports the exit status back.

pub mod agent;
pub mod audit;
pub mod auth;
pub mod command;
pub mod descriptor;
pub mod dispatcher;
mod error;
pub mod exit_status;
pub mod pipe_bridge;
pub mod pty_bridge;
pub mod sftp;

pub use audit::{AuditLogEntry, AuditSink, Auditor, MemoryAuditSink, StreamName, TracingAuditSink};
pub use auth::{authorize, AuthorizedKeys, KeyLoadError};
pub use command::{resolve_shell, CommandBuilder, ProcessSpec};
pub use descriptor::{
    BoxedReader, BoxedStream, BoxedWriter, ByteStream, PtyRequest, Session, SessionControl,
    SessionId, WindowSize,
};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::SessionError;
pub use exit_status::{ExitOutcome, FAILURE_STATUS};
