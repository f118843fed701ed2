//! Mapping of process termination to the status reported to the client.

use std::io;
use std::process::ExitStatus;

/// Status reported for anything other than a clean exit.
pub const FAILURE_STATUS: u32 = 1;

/// How a session's child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited { code: u32 },
    Signaled { signal: Option<i32> },
    /// The child never ran. `error` is safe to show to the client.
    StartFailed { error: String },
}

impl ExitOutcome {
    pub fn status(&self) -> u32 {
        match self {
            Self::Exited { code } => *code,
            Self::Signaled { .. } | Self::StartFailed { .. } => FAILURE_STATUS,
        }
    }

    pub fn start_failed(program: &str, err: &io::Error) -> Self {
        Self::StartFailed {
            error: format!("failed to start {program}: {}", describe(err)),
        }
    }

    pub fn is_start_failure(&self) -> bool {
        matches!(self, Self::StartFailed { .. })
    }
}

/// Translate the result of waiting on a pipe-mode child.
///
/// A wait error carries no exit status, so it can never prove success and
/// always maps to [`FAILURE_STATUS`].
pub fn translate(result: io::Result<ExitStatus>) -> ExitOutcome {
    match result {
        Ok(status) => from_status(status),
        Err(e) => {
            tracing::warn!("Waiting for child failed: {}", e);
            ExitOutcome::Exited {
                code: FAILURE_STATUS,
            }
        }
    }
}

/// Translate the result of waiting on a pty-mode child.
///
/// The pty layer folds signals into a non-zero code.
pub fn translate_pty(result: io::Result<portable_pty::ExitStatus>) -> ExitOutcome {
    match result {
        Ok(status) => ExitOutcome::Exited {
            code: status.exit_code(),
        },
        Err(e) => {
            tracing::warn!("Waiting for pty child failed: {}", e);
            ExitOutcome::Exited {
                code: FAILURE_STATUS,
            }
        }
    }
}

fn from_status(status: ExitStatus) -> ExitOutcome {
    if let Some(code) = status.code() {
        return ExitOutcome::Exited { code: code as u32 };
    }

    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitOutcome::Signaled { signal }
}

/// Client-facing reason, without OS error numbers.
fn describe(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "executable file not found".to_string(),
        io::ErrorKind::PermissionDenied => "permission denied".to_string(),
        _ => {
            let text = err.to_string();
            match text.find(" (os error") {
                Some(idx) => text[..idx].to_string(),
                None => text,
            }
        }
    }
}
