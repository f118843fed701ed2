//! Non-interactive sessions over three plain pipes.

use crate::audit::{Auditor, StreamName};
use crate::command::ProcessSpec;
use crate::exit_status::{self, ExitOutcome};
use crate::{BoxedReader, BoxedWriter, SessionError};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

/// Run `spec` with its stdio wired to the session streams.
///
/// Both output copies are joined before the child is reaped. The input copy
/// runs detached and is dropped once the child has exited.
pub async fn run(
    spec: &ProcessSpec,
    auditor: &Auditor,
    stdin: BoxedReader,
    stdout: &mut BoxedWriter,
    stderr: &mut BoxedWriter,
) -> Result<ExitOutcome, SessionError> {
    let mut command = spec.to_command();
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("Couldn't start command {:?}: {}", spec.argv(), e);
            return Ok(ExitOutcome::start_failed(spec.program(), &e));
        }
    };

    let child_stdin = child
        .stdin
        .take()
        .ok_or(SessionError::MissingPipe { stream: "stdin" })?;
    let mut child_stdout = child
        .stdout
        .take()
        .ok_or(SessionError::MissingPipe { stream: "stdout" })?;
    let mut child_stderr = child
        .stderr
        .take()
        .ok_or(SessionError::MissingPipe { stream: "stderr" })?;

    let mut input = auditor.writer(StreamName::Stdin, child_stdin);
    let input_task = tokio::spawn(async move {
        let mut stdin = stdin;
        if let Err(e) = tokio::io::copy(&mut stdin, &mut input).await {
            tracing::debug!("Copying session input to child stdin failed: {}", e);
        }
        if let Err(e) = input.shutdown().await {
            tracing::trace!("Closing child stdin: {}", e);
        }
        // Dropping the pipe is what delivers EOF to the child.
        drop(input);
    });

    let mut out = auditor.writer(StreamName::Stdout, &mut *stdout);
    let mut err = auditor.writer(StreamName::Stderr, &mut *stderr);

    let copy_stdout = async {
        if let Err(e) = tokio::io::copy(&mut child_stdout, &mut out).await {
            tracing::debug!("Copying child stdout to session failed: {}", e);
        }
        out.flush_audit();
    };
    let copy_stderr = async {
        if let Err(e) = tokio::io::copy(&mut child_stderr, &mut err).await {
            tracing::debug!("Copying child stderr to session failed: {}", e);
        }
        err.flush_audit();
    };
    tokio::join!(copy_stdout, copy_stderr);
    drop(out);
    drop(err);

    let waited = child.wait().await;
    input_task.abort();

    if let Err(e) = stdout.flush().await {
        tracing::debug!("Flushing session stdout: {}", e);
    }
    if let Err(e) = stderr.flush().await {
        tracing::debug!("Flushing session stderr: {}", e);
    }

    Ok(exit_status::translate(waited))
}
