//! Integration tests for the session engine.
//!
//! These drive the full engine over in-memory duplex pipes with scripted
//! server behavior, without requiring a real IMAP server.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use imap_session::{
    shared_job, Config, Error, ErrorKind, Job, JobContext, JobProgress, Message, Part, Security,
    Session, SessionEvent, SessionEvents, SharedJob, State, TlsSummary, TlsVersion, Transport,
};

// === test transport ===

/// Transport over scripted duplex connections.
///
/// Each `connect` hands out the next client half; `start_tls` pops a
/// scripted outcome (defaulting to success with a clean summary).
struct TestTransport {
    connections: VecDeque<DuplexStream>,
    tls_results: VecDeque<imap_session::Result<TlsSummary>>,
    tried_versions: Arc<Mutex<Vec<TlsVersion>>>,
}

impl TestTransport {
    fn new(connection_count: usize) -> (Self, Vec<DuplexStream>) {
        let mut clients = VecDeque::new();
        let mut servers = Vec::new();
        for _ in 0..connection_count {
            let (client, server) = duplex(64 * 1024);
            clients.push_back(client);
            servers.push(server);
        }
        (
            Self {
                connections: clients,
                tls_results: VecDeque::new(),
                tried_versions: Arc::new(Mutex::new(Vec::new())),
            },
            servers,
        )
    }

    fn refused() -> Error {
        Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
    }
}

fn clean_summary() -> TlsSummary {
    TlsSummary {
        version: Some(TlsVersion::Tls13),
        cipher: Some("TLS13_AES_128_GCM_SHA256".to_string()),
        issues: Vec::new(),
    }
}

impl Transport for TestTransport {
    type Stream = DuplexStream;

    fn connect(&mut self) -> impl Future<Output = imap_session::Result<DuplexStream>> + Send {
        async move { self.connections.pop_front().ok_or_else(Self::refused) }
    }

    fn connect_tls(
        &mut self,
        _version: TlsVersion,
    ) -> impl Future<Output = imap_session::Result<(DuplexStream, TlsSummary)>> + Send {
        async move {
            let stream = self.connections.pop_front().ok_or_else(Self::refused)?;
            Ok((stream, clean_summary()))
        }
    }

    fn start_tls(
        &mut self,
        stream: DuplexStream,
        version: TlsVersion,
    ) -> impl Future<Output = imap_session::Result<(DuplexStream, TlsSummary)>> + Send {
        async move {
            self.tried_versions.lock().unwrap().push(version);
            match self.tls_results.pop_front() {
                Some(Ok(summary)) => Ok((stream, summary)),
                Some(Err(error)) => {
                    drop(stream);
                    Err(error)
                }
                None => Ok((stream, clean_summary())),
            }
        }
    }
}

// === test jobs ===

#[derive(Default)]
struct JobLog {
    tag: String,
    started: u32,
    responses: Vec<Message>,
    lost: u32,
    errors: Vec<ErrorKind>,
}

/// A job that writes one command on start and completes on its tagged
/// response, recording everything it sees.
struct ScriptedJob {
    name: &'static str,
    command: &'static str,
    args: &'static str,
    log: Arc<Mutex<JobLog>>,
    lost_order: Arc<Mutex<Vec<&'static str>>>,
}

impl Job for ScriptedJob {
    fn start(&mut self, session: &mut JobContext<'_>) -> JobProgress {
        let tag = session.send_command(self.command, self.args);
        let mut log = self.log.lock().unwrap();
        log.tag = tag;
        log.started += 1;
        JobProgress::Pending
    }

    fn handle_response(
        &mut self,
        response: &Message,
        _session: &mut JobContext<'_>,
    ) -> JobProgress {
        let mut log = self.log.lock().unwrap();
        log.responses.push(response.clone());
        let tagged = response
            .content_str(0)
            .is_some_and(|tag| tag == log.tag.as_bytes());
        if tagged {
            JobProgress::Done
        } else {
            JobProgress::Pending
        }
    }

    fn connection_lost(&mut self) {
        self.log.lock().unwrap().lost += 1;
        self.lost_order.lock().unwrap().push(self.name);
    }

    fn socket_error(&mut self, kind: ErrorKind) {
        self.log.lock().unwrap().errors.push(kind);
    }
}

fn scripted(
    name: &'static str,
    command: &'static str,
    args: &'static str,
    lost_order: &Arc<Mutex<Vec<&'static str>>>,
) -> (SharedJob, Arc<Mutex<JobLog>>) {
    let log = Arc::new(Mutex::new(JobLog::default()));
    let job = shared_job(ScriptedJob {
        name,
        command,
        args,
        log: Arc::clone(&log),
        lost_order: Arc::clone(lost_order),
    });
    (job, log)
}

// === helpers ===

/// Routes engine tracing into the test harness output when debugging.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn plain_config() -> Config {
    Config::builder("testserver.example")
        .security(Security::None)
        .build()
}

async fn read_line(server: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = server.read(&mut byte).await.expect("server read failed");
        assert!(n != 0, "client closed while a line was expected");
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return String::from_utf8(line).expect("command line was not UTF-8");
        }
    }
}

async fn wait_for(
    events: &mut SessionEvents,
    predicate: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}

async fn wait_for_state(events: &mut SessionEvents, target: State) {
    wait_for(events, |event| {
        matches!(event, SessionEvent::StateChanged { new, .. } if *new == target)
    })
    .await;
}

/// Like [`wait_for`] but without a wall-clock bound, for paused-time tests.
async fn wait_for_unpaced(
    events: &mut SessionEvents,
    predicate: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = events.recv().await.expect("event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}

// === scenarios ===

#[tokio::test]
async fn greeting_then_login_then_select() {
    init_tracing();
    let (transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    let order = Arc::new(Mutex::new(Vec::new()));
    let (login, login_log) = scripted("login", "LOGIN", "u p", &order);
    let (select, select_log) = scripted("select", "SELECT", "\"INBOX\"", &order);
    session.enqueue(&login);
    session.enqueue(&select);

    server.write_all(b"* OK IMAP ready\r\n").await.unwrap();
    wait_for_state(&mut events, State::NotAuthenticated).await;
    assert_eq!(session.server_greeting(), "IMAP ready");

    // The login job only starts once the greeting advanced the state.
    assert_eq!(read_line(&mut server).await, "A000001 LOGIN u p");
    server.write_all(b"A000001 OK\r\n").await.unwrap();
    wait_for_state(&mut events, State::Authenticated).await;

    assert_eq!(read_line(&mut server).await, "A000002 SELECT \"INBOX\"");
    server
        .write_all(b"* 5 EXISTS\r\nA000002 OK [READ-WRITE] done\r\n")
        .await
        .unwrap();
    wait_for_state(&mut events, State::Selected).await;
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::JobQueueSizeChanged(0))
    })
    .await;

    assert_eq!(session.state(), State::Selected);
    assert_eq!(session.selected_mailbox().as_deref(), Some("INBOX"));
    assert_eq!(session.job_queue_size(), 0);

    let login_log = login_log.lock().unwrap();
    assert_eq!(login_log.started, 1);
    assert_eq!(login_log.responses.len(), 1);
    assert_eq!(login_log.tag, "A000001");

    let select_log = select_log.lock().unwrap();
    assert_eq!(select_log.responses.len(), 2);
    assert_eq!(
        select_log.responses[0].content_str(2),
        Some(b"EXISTS".as_slice())
    );
    assert_eq!(
        select_log.responses[1].response_code[0],
        Part::Str(b"READ-WRITE".to_vec())
    );
}

#[tokio::test]
async fn preauth_greeting_jumps_to_authenticated() {
    let (transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* PREAUTH welcome\r\n").await.unwrap();
    wait_for_state(&mut events, State::Authenticated).await;
    assert_eq!(session.server_greeting(), "welcome");
    assert_eq!(session.state(), State::Authenticated);
}

#[tokio::test]
async fn rejected_greeting_fails_the_connection() {
    let (transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    let order = Arc::new(Mutex::new(Vec::new()));
    let (job, log) = scripted("login", "LOGIN", "u p", &order);
    session.enqueue(&job);

    server.write_all(b"* BAD go away\r\n").await.unwrap();
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::ConnectionFailed)
    })
    .await;

    assert_eq!(session.state(), State::Disconnected);
    let log = log.lock().unwrap();
    assert_eq!(log.started, 0);
    assert_eq!(log.lost, 1);
}

#[tokio::test]
async fn literal_split_across_reads_is_delivered_whole() {
    let (transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* PREAUTH ready\r\n").await.unwrap();
    wait_for_state(&mut events, State::Authenticated).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let (fetch, fetch_log) = scripted("fetch", "FETCH", "1 (BODY[])", &order);
    session.enqueue(&fetch);

    assert_eq!(read_line(&mut server).await, "A000001 FETCH 1 (BODY[])");
    server
        .write_all(b"* 1 FETCH (BODY[] {11}\r\nHello ")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    server
        .write_all(b"world)\r\nA000001 OK\r\n")
        .await
        .unwrap();
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::JobQueueSizeChanged(0))
    })
    .await;

    let log = fetch_log.lock().unwrap();
    assert_eq!(log.responses.len(), 2);
    assert_eq!(
        log.responses[0].content[3],
        Part::List(vec![b"BODY[]".to_vec(), b"Hello world".to_vec()])
    );
    assert_eq!(log.responses[1].content_str(1), Some(b"OK".as_slice()));
}

#[tokio::test]
async fn bye_is_not_dispatched_and_close_cleans_up() {
    let (transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* PREAUTH ready\r\n").await.unwrap();
    wait_for_state(&mut events, State::Authenticated).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let (fetch, fetch_log) = scripted("fetch", "FETCH", "1 (FLAGS)", &order);
    session.enqueue(&fetch);
    assert_eq!(read_line(&mut server).await, "A000001 FETCH 1 (FLAGS)");

    server
        .write_all(b"* BYE server restarting\r\n")
        .await
        .unwrap();
    drop(server);

    wait_for_state(&mut events, State::Disconnected).await;
    let log = fetch_log.lock().unwrap();
    // The BYE was logged, not handed to the job.
    assert!(log.responses.is_empty());
    assert_eq!(log.lost, 1);
    assert_eq!(session.state(), State::Disconnected);
    assert_eq!(session.job_queue_size(), 0);
}

#[tokio::test]
async fn close_notifies_every_job_once_in_fifo_order() {
    let (transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* PREAUTH ready\r\n").await.unwrap();
    wait_for_state(&mut events, State::Authenticated).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let (a, a_log) = scripted("a", "NOOP", "", &order);
    let (b, b_log) = scripted("b", "NOOP", "", &order);
    let (c, c_log) = scripted("c", "NOOP", "", &order);
    session.enqueue(&a);
    session.enqueue(&b);
    session.enqueue(&c);

    // Job a is current, b and c are queued.
    assert_eq!(read_line(&mut server).await, "A000001 NOOP");

    session.close();
    wait_for_state(&mut events, State::Disconnected).await;

    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(a_log.lock().unwrap().lost, 1);
    assert_eq!(b_log.lock().unwrap().lost, 1);
    assert_eq!(c_log.lock().unwrap().lost, 1);
    assert_eq!(b_log.lock().unwrap().started, 0);
    assert_eq!(session.job_queue_size(), 0);
}

#[tokio::test]
async fn tls_fallback_walks_versions_then_surfaces_errors() {
    init_tracing();
    let (mut transport, mut servers) = TestTransport::new(4);
    let mut server = servers.remove(0);
    transport.tls_results = VecDeque::from([
        Err(Error::Tls(rustls::Error::HandshakeNotComplete)),
        Err(Error::Tls(rustls::Error::HandshakeNotComplete)),
        Ok(TlsSummary {
            version: Some(TlsVersion::Tls12),
            cipher: Some("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256".to_string()),
            issues: vec![imap_session::CertificateIssue::HostnameMismatch],
        }),
    ]);
    let tried = Arc::clone(&transport.tried_versions);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* OK ready\r\n").await.unwrap();
    wait_for_state(&mut events, State::NotAuthenticated).await;

    session.start_tls(TlsVersion::Any);

    let event = wait_for(&mut events, |event| {
        matches!(event, SessionEvent::SslErrors(_))
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::SslErrors(vec![imap_session::CertificateIssue::HostnameMismatch])
    );
    assert_eq!(
        *tried.lock().unwrap(),
        vec![TlsVersion::Any, TlsVersion::Tls13, TlsVersion::Tls12]
    );

    // Accepting the error set confirms the encrypted session.
    session.ssl_error_response(true);
    let event = wait_for(&mut events, |event| {
        matches!(event, SessionEvent::EncryptionNegotiationResult { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::EncryptionNegotiationResult {
            ok: true,
            version: Some(TlsVersion::Tls12),
        }
    );
    assert_ne!(session.state(), State::Disconnected);
}

#[tokio::test]
async fn rejecting_ssl_errors_reconnects_unencrypted() {
    let (mut transport, mut servers) = TestTransport::new(2);
    let mut server = servers.remove(0);
    transport.tls_results = VecDeque::from([Ok(TlsSummary {
        version: Some(TlsVersion::Tls13),
        cipher: Some("TLS13_AES_128_GCM_SHA256".to_string()),
        issues: vec![imap_session::CertificateIssue::Expired],
    })]);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* OK ready\r\n").await.unwrap();
    wait_for_state(&mut events, State::NotAuthenticated).await;

    session.start_tls(TlsVersion::Tls13);
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::SslErrors(_))
    })
    .await;

    session.ssl_error_response(false);
    let event = wait_for(&mut events, |event| {
        matches!(event, SessionEvent::EncryptionNegotiationResult { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::EncryptionNegotiationResult {
            ok: false,
            version: None,
        }
    );
    // The session is back on a plaintext connection and still usable.
    assert_ne!(session.state(), State::Disconnected);
}

#[tokio::test]
async fn ignored_certificate_issues_do_not_surface() {
    let (mut transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    transport.tls_results = VecDeque::from([Ok(TlsSummary {
        version: Some(TlsVersion::Tls13),
        cipher: Some("TLS13_AES_128_GCM_SHA256".to_string()),
        issues: vec![imap_session::CertificateIssue::Expired],
    })]);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* OK ready\r\n").await.unwrap();
    wait_for_state(&mut events, State::NotAuthenticated).await;

    session.ignore_errors(vec![imap_session::CertificateIssue::Expired]);
    session.start_tls(TlsVersion::Tls13);

    let event = wait_for(&mut events, |event| {
        matches!(event, SessionEvent::EncryptionNegotiationResult { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::EncryptionNegotiationResult {
            ok: true,
            version: Some(TlsVersion::Tls13),
        }
    );
}

#[tokio::test]
async fn select_failure_drops_back_to_authenticated() {
    let (transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* PREAUTH ready\r\n").await.unwrap();
    wait_for_state(&mut events, State::Authenticated).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let (select_inbox, _) = scripted("s1", "SELECT", "\"INBOX\"", &order);
    session.enqueue(&select_inbox);
    assert_eq!(read_line(&mut server).await, "A000001 SELECT \"INBOX\"");
    server.write_all(b"A000001 OK done\r\n").await.unwrap();
    wait_for_state(&mut events, State::Selected).await;
    assert_eq!(session.selected_mailbox().as_deref(), Some("INBOX"));

    // A failing SELECT while selected leaves no mailbox selected.
    let (select_other, _) = scripted("s2", "SELECT", "\"Other\"", &order);
    session.enqueue(&select_other);
    assert_eq!(read_line(&mut server).await, "A000002 SELECT \"Other\"");
    server.write_all(b"A000002 NO no such mailbox\r\n").await.unwrap();
    wait_for_state(&mut events, State::Authenticated).await;
    assert_eq!(session.selected_mailbox(), None);
}

#[tokio::test]
async fn reselect_updates_mailbox_and_close_clears_it() {
    let (transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* PREAUTH ready\r\n").await.unwrap();
    wait_for_state(&mut events, State::Authenticated).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let (s1, _) = scripted("s1", "SELECT", "\"INBOX\"", &order);
    session.enqueue(&s1);
    assert_eq!(read_line(&mut server).await, "A000001 SELECT \"INBOX\"");
    server.write_all(b"A000001 OK done\r\n").await.unwrap();
    wait_for_state(&mut events, State::Selected).await;

    // Re-selecting keeps the state and updates the mailbox, decoding the
    // modified-UTF-7 name.
    let (s2, _) = scripted("s2", "SELECT", "\"Entw&APw-rfe\"", &order);
    session.enqueue(&s2);
    assert_eq!(
        read_line(&mut server).await,
        "A000002 SELECT \"Entw&APw-rfe\""
    );
    server.write_all(b"A000002 OK done\r\n").await.unwrap();
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::JobQueueSizeChanged(0))
    })
    .await;
    assert_eq!(session.state(), State::Selected);
    assert_eq!(session.selected_mailbox().as_deref(), Some("Entw\u{fc}rfe"));

    let (close, _) = scripted("close", "CLOSE", "", &order);
    session.enqueue(&close);
    assert_eq!(read_line(&mut server).await, "A000003 CLOSE");
    server.write_all(b"A000003 OK closed\r\n").await.unwrap();
    wait_for_state(&mut events, State::Authenticated).await;
    assert_eq!(session.selected_mailbox(), None);
}

#[tokio::test]
async fn response_with_no_job_is_dropped_not_fatal() {
    let (transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* PREAUTH ready\r\n").await.unwrap();
    wait_for_state(&mut events, State::Authenticated).await;

    // Unsolicited response with nothing to handle it: logged and dropped.
    server.write_all(b"* 3 EXISTS\r\n").await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (noop, noop_log) = scripted("noop", "NOOP", "", &order);
    session.enqueue(&noop);
    assert_eq!(read_line(&mut server).await, "A000001 NOOP");
    server.write_all(b"A000001 OK\r\n").await.unwrap();
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::JobQueueSizeChanged(0))
    })
    .await;

    let log = noop_log.lock().unwrap();
    // Only the tagged completion reached the job, not the earlier EXISTS.
    assert_eq!(log.responses.len(), 1);
    assert_eq!(log.responses[0].content_str(0), Some(b"A000001".as_slice()));
}

#[tokio::test]
async fn dropped_job_is_cancelled() {
    let (transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* PREAUTH ready\r\n").await.unwrap();
    wait_for_state(&mut events, State::Authenticated).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let (a, a_log) = scripted("a", "NOOP", "", &order);
    session.enqueue(&a);
    assert_eq!(read_line(&mut server).await, "A000001 NOOP");

    let (b, b_log) = scripted("b", "NOOP", "", &order);
    session.enqueue(&b);
    // Dropping the queued job's handle cancels it before it ever starts.
    drop(b);

    server.write_all(b"A000001 OK\r\n").await.unwrap();
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::JobQueueSizeChanged(0))
    })
    .await;

    assert_eq!(a_log.lock().unwrap().responses.len(), 1);
    assert_eq!(b_log.lock().unwrap().started, 0);
    assert_eq!(session.job_queue_size(), 0);
}

#[tokio::test]
async fn connect_failure_emits_connection_failed() {
    // A transport with no connections refuses the initial connect.
    let (transport, _servers) = TestTransport::new(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    let order = Arc::new(Mutex::new(Vec::new()));
    let (job, log) = scripted("login", "LOGIN", "u p", &order);
    session.enqueue(&job);

    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::ConnectionFailed)
    })
    .await;
    assert_eq!(session.state(), State::Disconnected);

    let log = log.lock().unwrap();
    assert_eq!(log.lost, 1);
}

#[tokio::test]
async fn timeout_accessors_round_trip() {
    let (transport, _servers) = TestTransport::new(1);
    let (session, _events) = Session::with_transport(&plain_config(), transport);

    assert_eq!(session.timeout(), 30);
    session.set_timeout(120);
    assert_eq!(session.timeout(), 120);
    session.set_timeout(-1);
    assert_eq!(session.timeout(), -1);
}

#[tokio::test(start_paused = true)]
async fn inactivity_watchdog_aborts_the_connection() {
    let (transport, mut servers) = TestTransport::new(1);
    let mut server = servers.remove(0);
    let (session, mut events) = Session::with_transport(&plain_config(), transport);

    server.write_all(b"* PREAUTH ready\r\n").await.unwrap();
    wait_for_unpaced(&mut events, |event| {
        matches!(
            event,
            SessionEvent::StateChanged {
                new: State::Authenticated,
                ..
            }
        )
    })
    .await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let (job, log) = scripted("noop", "NOOP", "", &order);
    session.enqueue(&job);
    assert_eq!(read_line(&mut server).await, "A000001 NOOP");

    // The server never answers; the watchdog fires at the default 30s and
    // aborts the transport.
    wait_for_unpaced(&mut events, |event| {
        matches!(
            event,
            SessionEvent::StateChanged {
                new: State::Disconnected,
                ..
            }
        )
    })
    .await;

    let log = log.lock().unwrap();
    assert_eq!(log.lost, 1);
    assert!(log.errors.is_empty());
    assert_eq!(session.job_queue_size(), 0);
}
