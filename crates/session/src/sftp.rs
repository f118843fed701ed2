//! The `sftp` subsystem, served by an external sftp-server binary.

use crate::{BoxedReader, BoxedWriter};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const SUBSYSTEM_NAME: &str = "sftp";

/// Where distributions install sftp-server.
const WELL_KNOWN_PATHS: &[&str] = &[
    "/usr/lib/openssh/sftp-server",
    "/usr/libexec/openssh/sftp-server",
    "/usr/lib/ssh/sftp-server",
    "/usr/libexec/sftp-server",
];

#[derive(Debug, Clone)]
pub struct SftpSubsystem {
    binary: Option<PathBuf>,
}

impl SftpSubsystem {
    /// Use `configured`, or the first well-known binary that exists.
    pub fn new(configured: Option<PathBuf>) -> Self {
        let binary = configured.or_else(|| {
            WELL_KNOWN_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|path| path.is_file())
        });
        Self { binary }
    }

    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    /// Relay the session to a fresh sftp-server until either side closes.
    pub async fn serve(&self, stdin: BoxedReader, stdout: BoxedWriter) -> io::Result<()> {
        let binary = self.binary.as_deref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no sftp-server binary available")
        })?;

        let mut child = Command::new(binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut child_in = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sftp-server stdin"))?;
        let mut child_out = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sftp-server stdout"))?;

        let mut stdin = stdin;
        let mut stdout = stdout;
        let requests = async move {
            let copied = tokio::io::copy(&mut stdin, &mut child_in).await;
            drop(child_in);
            copied
        };
        let responses = async move {
            let copied = tokio::io::copy(&mut child_out, &mut stdout).await;
            let _ = stdout.shutdown().await;
            copied
        };
        let (requests, responses) = tokio::join!(requests, responses);
        if let Err(e) = requests {
            tracing::debug!("Copying sftp requests ended: {}", e);
        }
        responses?;

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("sftp-server exited with {status}"),
            ))
        }
    }
}
