//! Interactive sessions on a pseudo-terminal.
//!
//! The pty handles are blocking, so its reader and writer live on dedicated
//! threads and talk to the async side over channels.

use crate::audit::{Auditor, StreamName};
use crate::command::ProcessSpec;
use crate::exit_status::{self, ExitOutcome};
use crate::{BoxedReader, BoxedWriter, PtyRequest, SessionError};
use portable_pty::{native_pty_system, ChildKiller, PtyPair};
use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

const READ_CHUNK: usize = 4096;
const OUTPUT_QUEUE: usize = 32;

/// Aborts session tasks and kills the child if the bridge exits early.
struct BridgeGuard {
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
    tasks: Vec<AbortHandle>,
}

impl BridgeGuard {
    /// The child has been reaped, so there is nothing left to kill.
    fn child_exited(&mut self) {
        self.killer = None;
    }
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(mut killer) = self.killer.take() {
            // ESRCH is expected if the child already exited
            if let Err(e) = killer.kill() {
                tracing::debug!("Kill pty child: {}", e);
            }
        }
    }
}

/// Run `spec` on a new pty sized from `request`.
///
/// After the child exits, output is drained for at most `drain_grace`;
/// grandchildren may keep the pty open indefinitely.
pub async fn run(
    spec: &ProcessSpec,
    request: PtyRequest,
    auditor: &Auditor,
    drain_grace: Duration,
    stdin: BoxedReader,
    stdout: BoxedWriter,
) -> Result<ExitOutcome, SessionError> {
    let PtyRequest {
        term,
        size,
        mut resizes,
    } = request;

    let PtyPair { master, slave } = native_pty_system()
        .openpty(size.into())
        .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;

    let mut reader = master
        .try_clone_reader()
        .map_err(|e| SessionError::PtyIo(e.to_string()))?;
    let writer = master
        .take_writer()
        .map_err(|e| SessionError::PtyIo(e.to_string()))?;

    let mut cmd = spec.to_pty_command();
    if !term.is_empty() {
        cmd.env("TERM", &term);
    }

    let mut child = match slave.spawn_command(cmd) {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("Failed to start pty session {:?}: {}", spec.argv(), e);
            return Ok(match e.downcast_ref::<std::io::Error>() {
                Some(io) => ExitOutcome::start_failed(spec.program(), io),
                None => ExitOutcome::StartFailed {
                    error: format!("failed to start {}: {}", spec.program(), e),
                },
            });
        }
    };
    // Our copy of the slave would keep the reader from ever seeing EOF.
    drop(slave);

    let mut guard = BridgeGuard {
        killer: Some(child.clone_killer()),
        tasks: Vec::new(),
    };

    let resize_task = tokio::spawn(async move {
        while let Some(size) = resizes.recv().await {
            match master.resize(size.into()) {
                Ok(()) => tracing::trace!("Resized pty to {}x{}", size.width, size.height),
                Err(e) => tracing::warn!("Failed to resize pty: {}", e),
            }
        }
    });
    guard.tasks.push(resize_task.abort_handle());

    // Client input -> pty
    let (input_tx, input_rx) = std_mpsc::channel::<Vec<u8>>();
    let mut pty_in = auditor.writer(StreamName::Stdin, writer);
    thread::spawn(move || {
        while let Ok(data) = input_rx.recv() {
            if let Err(e) = pty_in.write_all(&data).and_then(|()| pty_in.flush()) {
                tracing::debug!("Writing to pty failed: {}", e);
                break;
            }
        }
    });

    let input_task = tokio::spawn(async move {
        let mut stdin = stdin;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if input_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Reading session input failed: {}", e);
                    break;
                }
            }
        }
    });
    guard.tasks.push(input_task.abort_handle());

    // Pty -> client output
    let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE);
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                // EIO once every slave handle is closed
                Err(e) => {
                    tracing::trace!("Pty read ended: {}", e);
                    break;
                }
            }
        }
    });

    let mut client_out = auditor.writer(StreamName::Stdout, stdout);
    let mut output_task = tokio::spawn(async move {
        while let Some(chunk) = output_rx.recv().await {
            if let Err(e) = client_out.write_all(&chunk).await {
                tracing::debug!("Writing pty output to session failed: {}", e);
                break;
            }
            if let Err(e) = client_out.flush().await {
                tracing::debug!("Flushing session output failed: {}", e);
                break;
            }
        }
        client_out.flush_audit();
    });
    guard.tasks.push(output_task.abort_handle());

    let waited = match tokio::task::spawn_blocking(move || child.wait()).await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
    };
    guard.child_exited();
    let outcome = exit_status::translate_pty(waited);

    match tokio::time::timeout(drain_grace, &mut output_task).await {
        Ok(_) => tracing::debug!("Pty output finished"),
        Err(_) => tracing::info!("Pty output didn't finish after {:?}", drain_grace),
    }

    Ok(outcome)
}
