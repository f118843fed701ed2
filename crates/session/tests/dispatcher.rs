use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use session::{
    BoxedStream, Dispatcher, DispatcherConfig, MemoryAuditSink, PtyRequest, Session,
    SessionControl, StreamName, WindowSize,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing_test::traced_test;

const BUFFER: usize = 64 * 1024;

/// Records what the dispatcher reports back to the transport.
#[derive(Default)]
struct Recorder {
    statuses: Mutex<Vec<u32>>,
    closed: Mutex<usize>,
}

#[async_trait]
impl SessionControl for Recorder {
    async fn exit(&self, status: u32) -> anyhow::Result<()> {
        self.statuses.lock().push(status);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        *self.closed.lock() += 1;
        Ok(())
    }

    async fn open_agent_channel(&self) -> anyhow::Result<BoxedStream> {
        let (ours, _theirs) = tokio::io::duplex(BUFFER);
        Ok(Box::pin(ours))
    }
}

/// The far end of a session's streams.
struct Client {
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
    resize: Option<mpsc::UnboundedSender<WindowSize>>,
    recorder: Arc<Recorder>,
}

impl Client {
    async fn read_output(&mut self) -> (String, String) {
        let mut out = String::new();
        self.stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        self.stderr.read_to_string(&mut err).await.unwrap();
        (out, err)
    }

    fn statuses(&self) -> Vec<u32> {
        self.recorder.statuses.lock().clone()
    }

    fn close_count(&self) -> usize {
        *self.recorder.closed.lock()
    }
}

struct SessionBuilder {
    raw_command: String,
    env: Vec<(String, String)>,
    pty: Option<(String, WindowSize)>,
    agent_forwarding: bool,
}

impl SessionBuilder {
    fn exec(raw_command: &str) -> Self {
        Self {
            raw_command: raw_command.to_string(),
            env: Vec::new(),
            pty: None,
            agent_forwarding: false,
        }
    }

    fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    fn pty(mut self, term: &str, width: u16, height: u16) -> Self {
        self.pty = Some((term.to_string(), WindowSize { width, height }));
        self
    }

    fn agent(mut self) -> Self {
        self.agent_forwarding = true;
        self
    }

    fn build(self) -> (Session, Client) {
        let (client_in, session_in) = tokio::io::duplex(BUFFER);
        let (session_out, client_out) = tokio::io::duplex(BUFFER);
        let (session_err, client_err) = tokio::io::duplex(BUFFER);
        let recorder = Arc::new(Recorder::default());

        let (pty, resize) = match self.pty {
            Some((term, size)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let request = PtyRequest {
                    term,
                    size,
                    resizes: rx,
                };
                (Some(request), Some(tx))
            }
            None => (None, None),
        };

        let session = Session {
            user: "dev".to_string(),
            remote_addr: Some("127.0.0.1:50022".parse().unwrap()),
            raw_command: self.raw_command,
            env: self.env,
            pty,
            agent_forwarding: self.agent_forwarding,
            stdin: Box::pin(session_in),
            stdout: Box::pin(session_out),
            stderr: Box::pin(session_err),
            control: recorder.clone(),
        };
        let client = Client {
            stdin: client_in,
            stdout: client_out,
            stderr: client_err,
            resize,
            recorder,
        };
        (session, client)
    }
}

fn dispatcher(shell: &str) -> Dispatcher {
    Dispatcher::new(DispatcherConfig {
        shell: shell.to_string(),
        pty_drain_grace: Duration::from_secs(1),
        ..DispatcherConfig::default()
    })
}

#[tokio::test]
async fn echo_command_without_pty() {
    let (session, mut client) = SessionBuilder::exec("echo hi").build();
    dispatcher("sh").dispatch(session).await;

    let (out, err) = client.read_output().await;
    assert_eq!(out, "hi\n");
    assert_eq!(err, "");
    assert_eq!(client.statuses(), vec![0]);
    assert_eq!(client.close_count(), 1);
}

#[tokio::test]
async fn nested_shell_command_without_pty() {
    let (session, mut client) = SessionBuilder::exec("sh -c \"echo hi\"").build();
    dispatcher("sh").dispatch(session).await;

    let (out, _) = client.read_output().await;
    assert_eq!(out, "hi\n");
    assert_eq!(client.statuses(), vec![0]);
}

#[tokio::test]
async fn unresolvable_shell_reports_start_failure() {
    let (session, mut client) = SessionBuilder::exec("echo hi").build();
    dispatcher("/nonexistent/shell").dispatch(session).await;

    let (out, err) = client.read_output().await;
    assert_eq!(out, "");
    assert!(err.contains("/nonexistent/shell"), "{err}");
    assert_eq!(client.statuses(), vec![1]);
    assert_eq!(client.close_count(), 1);
}

#[tokio::test]
async fn unknown_command_reports_shell_status() {
    let (session, mut client) = SessionBuilder::exec("badcommand-3f9c").build();
    dispatcher("sh").dispatch(session).await;

    let (out, err) = client.read_output().await;
    assert_eq!(out, "");
    assert!(!err.is_empty());
    assert_eq!(client.statuses(), vec![127]);
}

#[tokio::test]
async fn exit_code_is_reported() {
    let (session, mut client) = SessionBuilder::exec("exit 3").build();
    dispatcher("sh").dispatch(session).await;

    client.read_output().await;
    assert_eq!(client.statuses(), vec![3]);
}

#[tokio::test]
async fn client_input_reaches_child() {
    let (session, mut client) = SessionBuilder::exec("cat").build();
    client.stdin.write_all(b"ping\npong\n").await.unwrap();
    client.stdin.shutdown().await.unwrap();

    dispatcher("sh").dispatch(session).await;

    let (out, _) = client.read_output().await;
    assert_eq!(out, "ping\npong\n");
    assert_eq!(client.statuses(), vec![0]);
}

#[tokio::test]
async fn empty_command_runs_interactive_shell() {
    let (session, mut client) = SessionBuilder::exec("").build();
    client
        .stdin
        .write_all(b"echo interactive\nexit 5\n")
        .await
        .unwrap();

    dispatcher("sh").dispatch(session).await;

    let (out, _) = client.read_output().await;
    assert_eq!(out, "interactive\n");
    assert_eq!(client.statuses(), vec![5]);
}

#[tokio::test]
async fn session_environment_last_entry_wins() {
    let (session, mut client) = SessionBuilder::exec("printf %s \"$GREETING\"")
        .env("GREETING", "hello")
        .env("GREETING", "bye")
        .build();
    dispatcher("sh").dispatch(session).await;

    let (out, _) = client.read_output().await;
    assert_eq!(out, "bye");
}

#[tokio::test]
async fn traffic_is_audited_per_stream() {
    let sink = Arc::new(MemoryAuditSink::new());
    let (session, mut client) = SessionBuilder::exec("read name; echo \"hi $name\"; echo oops >&2")
        .build();
    client.stdin.write_all(b"dev\n").await.unwrap();

    dispatcher("sh")
        .with_audit_sink(sink.clone())
        .dispatch(session)
        .await;

    let (out, err) = client.read_output().await;
    assert_eq!(out, "hi dev\n");
    assert_eq!(err, "oops\n");
    assert_eq!(sink.lines(StreamName::Stdin), vec!["dev"]);
    assert_eq!(sink.lines(StreamName::Stdout), vec!["hi dev"]);
    assert_eq!(sink.lines(StreamName::Stderr), vec!["oops"]);

    let entries = sink.entries();
    assert!(entries.iter().all(|e| e.session_id == entries[0].session_id));
}

#[traced_test]
#[tokio::test]
async fn session_lifecycle_is_logged() {
    let (session, mut client) = SessionBuilder::exec("true").build();
    dispatcher("sh").dispatch(session).await;
    client.read_output().await;

    assert!(logs_contain("Session started"));
    assert!(logs_contain("Session closed"));
    assert!(logs_contain("127.0.0.1:50022"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pty_session_propagates_exit_code() {
    let (session, mut client) = SessionBuilder::exec("exit 7").pty("xterm", 80, 24).build();
    dispatcher("sh").dispatch(session).await;

    client.read_output().await;
    assert_eq!(client.statuses(), vec![7]);
    assert_eq!(client.close_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pty_session_sets_term() {
    let (session, mut client) = SessionBuilder::exec("printf '%s' \"$TERM\"")
        .pty("vt100", 80, 24)
        .build();
    dispatcher("sh").dispatch(session).await;

    let (out, _) = client.read_output().await;
    assert!(out.contains("vt100"), "{out:?}");
    assert_eq!(client.statuses(), vec![0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pty_resize_applies_before_later_output() {
    let (session, mut client) = SessionBuilder::exec("read line; stty size")
        .pty("xterm", 80, 24)
        .build();
    let resize = client.resize.take().unwrap();
    let dispatcher = dispatcher("sh");

    let drive = async {
        resize
            .send(WindowSize {
                width: 100,
                height: 40,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        client.stdin.write_all(b"go\n").await.unwrap();
    };
    tokio::join!(dispatcher.dispatch(session), drive);

    let (out, _) = client.read_output().await;
    assert!(out.contains("40 100"), "{out:?}");
    assert_eq!(client.statuses(), vec![0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pty_start_failure_is_reported() {
    let (session, mut client) = SessionBuilder::exec("echo hi").pty("xterm", 80, 24).build();
    dispatcher("/nonexistent/shell").dispatch(session).await;

    let (out, err) = client.read_output().await;
    assert_eq!(out, "");
    assert!(!err.is_empty());
    assert_eq!(client.statuses(), vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pty_drain_is_bounded_when_grandchild_holds_terminal() {
    let (session, mut client) =
        SessionBuilder::exec("sh -c 'trap \"\" HUP; sleep 10' & echo started; exit 4")
            .pty("xterm", 80, 24)
            .build();
    let dispatcher = Dispatcher::new(DispatcherConfig {
        shell: "sh".to_string(),
        pty_drain_grace: Duration::from_millis(300),
        ..DispatcherConfig::default()
    });

    let started = Instant::now();
    dispatcher.dispatch(session).await;
    let elapsed = started.elapsed();

    let (out, _) = client.read_output().await;
    assert!(out.contains("started"), "{out:?}");
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    assert_eq!(client.statuses(), vec![4]);
    assert_eq!(client.close_count(), 1);
}

#[tokio::test]
async fn agent_listener_failure_aborts_before_spawn() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("spawned");
    let (session, mut client) =
        SessionBuilder::exec(&format!("touch '{}'", marker.display()))
            .agent()
            .build();
    let dispatcher = Dispatcher::new(DispatcherConfig {
        shell: "sh".to_string(),
        agent_socket_dir: Some(scratch.path().join("missing")),
        ..DispatcherConfig::default()
    });

    dispatcher.dispatch(session).await;

    let (out, err) = client.read_output().await;
    assert_eq!(out, "");
    assert!(err.contains("agent"), "{err}");
    assert!(!marker.exists());
    assert_eq!(client.statuses(), vec![1]);
    assert_eq!(client.close_count(), 1);
}

#[tokio::test]
async fn agent_forwarding_exposes_socket() {
    let (session, mut client) = SessionBuilder::exec("test -S \"$SSH_AUTH_SOCK\" && echo ok")
        .agent()
        .build();
    dispatcher("sh").dispatch(session).await;

    let (out, _) = client.read_output().await;
    assert_eq!(out, "ok\n");
    assert_eq!(client.statuses(), vec![0]);
}

#[tokio::test]
async fn unsupported_subsystem_is_refused() {
    let (session, mut client) = SessionBuilder::exec("").build();
    dispatcher("sh").subsystem("netconf", session).await;

    let (_, err) = client.read_output().await;
    assert!(err.contains("netconf"));
    assert_eq!(client.statuses(), vec![1]);
    assert_eq!(client.close_count(), 1);
}
