//! Audit logging of session traffic.
//!
//! [`AuditWriter`] and [`AuditReader`] wrap a stream and behave exactly like
//! it, while splitting whatever passes through into lines and recording each
//! one as an [`AuditLogEntry`]. Both the blocking `std::io` and the async
//! `tokio::io` traits are implemented.

use crate::SessionId;
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Longest partial line kept before it is logged anyway.
const MAX_PENDING_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamName {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogEntry {
    pub session_id: SessionId,
    pub stream: StreamName,
    pub line: String,
    pub timestamp: SystemTime,
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditLogEntry);
}

/// Emits every entry as an `info` event on the `audit` target, inside an
/// `audit` span carrying `session.id` and `stream`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditLogEntry) {
        let span = tracing::info_span!(
            "audit",
            session.id = %entry.session_id,
            stream = %entry.stream,
        );
        let _entered = span.enter();
        tracing::info!(target: "audit", "{}", entry.line);
    }
}

/// Keeps entries in memory. Used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().clone()
    }

    /// Logged lines of one stream, in order.
    pub fn lines(&self, stream: StreamName) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.stream == stream)
            .map(|entry| entry.line.clone())
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditLogEntry) {
        self.entries.lock().push(entry);
    }
}

/// Accumulates bytes and hands complete lines to the sink.
struct LineBuffer {
    session_id: SessionId,
    stream: StreamName,
    sink: Arc<dyn AuditSink>,
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        // Buffered bytes never hold a newline, so only new ones are scanned.
        let mut from = self.pending.len();
        self.pending.extend_from_slice(bytes);

        let mut start = 0;
        while let Some(offset) = self.pending[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            self.emit(&self.pending[start..end]);
            start = end + 1;
            from = start;
        }
        if start > 0 {
            self.pending.drain(..start);
        }

        if self.pending.len() > MAX_PENDING_LINE {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
    }

    fn emit(&self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        self.sink.record(AuditLogEntry {
            session_id: self.session_id,
            stream: self.stream,
            line: String::from_utf8_lossy(line).into_owned(),
            timestamp: SystemTime::now(),
        });
    }
}

impl Drop for LineBuffer {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Per-session factory for audited streams.
#[derive(Clone)]
pub struct Auditor {
    session_id: SessionId,
    sink: Arc<dyn AuditSink>,
}

impl Auditor {
    pub fn new(session_id: SessionId, sink: Arc<dyn AuditSink>) -> Self {
        Self { session_id, sink }
    }

    pub fn writer<W>(&self, stream: StreamName, inner: W) -> AuditWriter<W> {
        AuditWriter {
            inner,
            lines: self.line_buffer(stream),
        }
    }

    pub fn reader<R>(&self, stream: StreamName, inner: R) -> AuditReader<R> {
        AuditReader {
            inner,
            lines: self.line_buffer(stream),
        }
    }

    fn line_buffer(&self, stream: StreamName) -> LineBuffer {
        LineBuffer {
            session_id: self.session_id,
            stream,
            sink: self.sink.clone(),
            pending: Vec::new(),
        }
    }
}

impl fmt::Debug for Auditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auditor")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Writer that records the bytes it accepts.
///
/// Only bytes the inner writer actually took are logged. A partial last line
/// is logged by [`AuditWriter::flush_audit`], on shutdown, or on drop.
pub struct AuditWriter<W> {
    inner: W,
    lines: LineBuffer,
}

impl<W> AuditWriter<W> {
    /// Log any buffered partial line as a final entry.
    pub fn flush_audit(&mut self) {
        self.lines.flush();
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

impl<W: Write> Write for AuditWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.lines.push(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for AuditWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.lines.push(&buf[..n]);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.lines.flush();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Reader that records the bytes it yields.
pub struct AuditReader<R> {
    inner: R,
    lines: LineBuffer,
}

impl<R> AuditReader<R> {
    pub fn flush_audit(&mut self) {
        self.lines.flush();
    }
}

impl<R: Read> Read for AuditReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.lines.push(&buf[..n]);
        Ok(n)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for AuditReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            this.lines.push(&buf.filled()[before..]);
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    fn auditor() -> (Auditor, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (Auditor::new(SessionId::new(), sink.clone()), sink)
    }

    /// Accepts at most `limit` bytes per write.
    struct ShortWriter {
        limit: usize,
        data: Vec<u8>,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.limit);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn passes_bytes_unchanged_and_logs_complete_lines() {
        let (auditor, sink) = auditor();
        let mut writer = auditor.writer(StreamName::Stdout, Vec::new());

        writer.write_all(b"a\nb\nc").unwrap();
        assert_eq!(writer.get_ref().as_slice(), b"a\nb\nc");
        assert_eq!(sink.lines(StreamName::Stdout), vec!["a", "b"]);

        writer.flush_audit();
        assert_eq!(sink.lines(StreamName::Stdout), vec!["a", "b", "c"]);
    }

    #[test]
    fn strips_carriage_return_from_logged_line_only() {
        let (auditor, sink) = auditor();
        let mut writer = auditor.writer(StreamName::Stdout, Vec::new());

        writer.write_all(b"dir\r\n").unwrap();
        assert_eq!(writer.get_ref().as_slice(), b"dir\r\n");
        assert_eq!(sink.lines(StreamName::Stdout), vec!["dir"]);
    }

    #[test]
    fn joins_lines_split_across_writes() {
        let (auditor, sink) = auditor();
        let mut writer = auditor.writer(StreamName::Stderr, Vec::new());

        writer.write_all(b"hel").unwrap();
        writer.write_all(b"lo\nwor").unwrap();
        writer.write_all(b"ld\n").unwrap();
        assert_eq!(sink.lines(StreamName::Stderr), vec!["hello", "world"]);
    }

    #[test]
    fn keeps_empty_lines() {
        let (auditor, sink) = auditor();
        let mut writer = auditor.writer(StreamName::Stdout, Vec::new());

        writer.write_all(b"\n\nx\n").unwrap();
        assert_eq!(sink.lines(StreamName::Stdout), vec!["", "", "x"]);
    }

    #[test]
    fn drop_flushes_partial_line() {
        let (auditor, sink) = auditor();
        {
            let mut writer = auditor.writer(StreamName::Stdout, Vec::new());
            writer.write_all(b"no newline").unwrap();
            assert!(sink.entries().is_empty());
        }
        assert_eq!(sink.lines(StreamName::Stdout), vec!["no newline"]);
    }

    #[test]
    fn flush_without_pending_bytes_logs_nothing() {
        let (auditor, sink) = auditor();
        let mut writer = auditor.writer(StreamName::Stdout, Vec::new());
        writer.write_all(b"done\n").unwrap();
        writer.flush_audit();
        drop(writer);
        assert_eq!(sink.lines(StreamName::Stdout), vec!["done"]);
    }

    #[test]
    fn short_write_logs_only_accepted_bytes() {
        let (auditor, sink) = auditor();
        let mut writer = auditor.writer(
            StreamName::Stdout,
            ShortWriter {
                limit: 3,
                data: Vec::new(),
            },
        );

        let n = writer.write(b"ab\ncd\n").unwrap();
        assert_eq!(n, 3);
        assert_eq!(sink.lines(StreamName::Stdout), vec!["ab"]);
        assert_eq!(writer.get_ref().data, b"ab\n");
    }

    #[test]
    fn write_errors_propagate_without_logging() {
        let (auditor, sink) = auditor();
        let mut writer = auditor.writer(StreamName::Stdout, FailingWriter);

        let err = writer.write(b"lost\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn binary_content_is_logged_lossily() {
        let (auditor, sink) = auditor();
        let mut writer = auditor.writer(StreamName::Stdout, Vec::new());

        writer.write_all(&[0x66, 0xff, 0x6f, b'\n']).unwrap();
        assert_eq!(writer.get_ref().as_slice(), &[0x66, 0xff, 0x6f, b'\n']);
        assert_eq!(sink.lines(StreamName::Stdout), vec!["f\u{fffd}o"]);
    }

    #[test]
    fn splits_many_short_lines_from_one_write() {
        let (auditor, sink) = auditor();
        let mut writer = auditor.writer(StreamName::Stdout, io::sink());

        writer.write_all(b"tail").unwrap();
        writer.write_all(&b"y\n".repeat(50_000)).unwrap();
        writer.write_all(b"last").unwrap();

        let lines = sink.lines(StreamName::Stdout);
        assert_eq!(lines.len(), 50_000);
        assert_eq!(lines[0], "taily");
        assert!(lines[1..].iter().all(|line| line == "y"));
        assert_eq!(writer.lines.pending, b"last");
    }

    #[test]
    fn oversized_partial_line_is_logged() {
        let (auditor, sink) = auditor();
        let mut writer = auditor.writer(StreamName::Stdout, Vec::new());

        writer.write_all(&vec![b'x'; MAX_PENDING_LINE + 1]).unwrap();
        let lines = sink.lines(StreamName::Stdout);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_PENDING_LINE + 1);
    }

    #[test]
    fn entries_carry_session_and_stream() {
        let sink = Arc::new(MemoryAuditSink::new());
        let id = SessionId::new();
        let auditor = Auditor::new(id, sink.clone());
        let mut reader = auditor.reader(StreamName::Stdin, &b"ls\n"[..]);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ls\n");

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, id);
        assert_eq!(entries[0].stream, StreamName::Stdin);
        assert_eq!(entries[0].line, "ls");
    }

    mod async_streams {
        use super::*;
        use pretty_assertions::assert_eq;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        #[tokio::test]
        async fn writer_logs_and_flushes_on_shutdown() {
            let (auditor, sink) = auditor();
            let (client, mut server) = tokio::io::duplex(64);
            let mut writer = auditor.writer(StreamName::Stdout, client);

            writer.write_all(b"one\ntwo").await.unwrap();
            assert_eq!(sink.lines(StreamName::Stdout), vec!["one"]);

            writer.shutdown().await.unwrap();
            assert_eq!(sink.lines(StreamName::Stdout), vec!["one", "two"]);
            drop(writer);

            let mut out = String::new();
            server.read_to_string(&mut out).await.unwrap();
            assert_eq!(out, "one\ntwo");
        }

        #[tokio::test]
        async fn reader_logs_what_it_yields() {
            let (auditor, sink) = auditor();
            let (mut client, server) = tokio::io::duplex(64);
            let mut reader = auditor.reader(StreamName::Stdin, server);

            client.write_all(b"whoami\nexit").await.unwrap();
            drop(client);

            let mut out = String::new();
            reader.read_to_string(&mut out).await.unwrap();
            assert_eq!(out, "whoami\nexit");
            assert_eq!(sink.lines(StreamName::Stdin), vec!["whoami"]);

            reader.flush_audit();
            assert_eq!(sink.lines(StreamName::Stdin), vec!["whoami", "exit"]);
        }
    }

    #[traced_test]
    #[test]
    fn tracing_sink_emits_audit_events() {
        let auditor = Auditor::new(SessionId::new(), Arc::new(TracingAuditSink));
        let mut writer = auditor.writer(StreamName::Stderr, Vec::new());
        writer.write_all(b"permission denied\n").unwrap();

        assert!(logs_contain("permission denied"));
        assert!(logs_contain("session.id="));
        assert!(logs_contain("stream=stderr"));
    }
}
