//! The IMAP session: lifecycle, job queue, and public surface.
//!
//! A [`Session`] owns one connection to one server for its whole life. It is
//! created connected (the connection attempt starts immediately on a
//! background task), advances through its lifecycle as the server greeting
//! and tagged completions arrive, and is destroyed rather than reused after
//! a terminal disconnection.
//!
//! ```text
//! Disconnected ── untagged OK greeting ──→ NotAuthenticated
//!      │                                        │
//!      └── untagged PREAUTH ──→ Authenticated ←─┘ (LOGIN/AUTHENTICATE OK)
//!                                    │
//!                 (CLOSE OK) ←── Selected ──→ (SELECT/EXAMINE OK)
//! ```
//!
//! Work is submitted as [`Job`]s. Jobs run strictly in enqueue order; at
//! most one is current, and it receives every parsed response until it
//! reports completion. Everything the session owns is touched from a single
//! task; the facade's methods post requests into that task and never block.

mod inner;
mod job;
mod logger;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::connection::{CertificateIssue, Config, Security, TcpTransport, TlsVersion, Transport};
use inner::SessionInner;

pub use job::{shared_job, Job, JobContext, JobProgress, SharedJob};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// No usable connection; the initial state and the terminal one.
    #[default]
    Disconnected,
    /// Greeting received, credentials not yet accepted.
    NotAuthenticated,
    /// Login accepted (or the server sent PREAUTH).
    Authenticated,
    /// A mailbox is selected.
    Selected,
}

/// Events emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The lifecycle state changed.
    StateChanged {
        /// The state entered.
        new: State,
        /// The state left.
        old: State,
    },
    /// The number of queued plus running jobs changed.
    JobQueueSizeChanged(usize),
    /// The connection could not be established, or the server rejected us
    /// before a greeting was accepted.
    ConnectionFailed,
    /// TLS negotiation completed with unresolved certificate errors; respond
    /// with [`Session::ssl_error_response`].
    SslErrors(Vec<CertificateIssue>),
    /// Outcome of client encryption negotiation.
    EncryptionNegotiationResult {
        /// Whether the session is now encrypted.
        ok: bool,
        /// The negotiated version on success.
        version: Option<TlsVersion>,
    },
}

/// Receiver for a session's events.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

pub(crate) enum Request {
    Enqueue(SharedJob),
    Close,
    SetTimeout(Option<Duration>),
    StartTls(TlsVersion),
    SslErrorResponse(bool),
    IgnoreErrors(Vec<CertificateIssue>),
}

pub(crate) struct Shared {
    pub state: State,
    pub greeting: Vec<u8>,
    pub current_mailbox: String,
    pub queue_size: usize,
    pub timeout_secs: i64,
}

/// Handle to a running IMAP session.
///
/// Dropping the handle closes the transport; queued jobs then receive
/// `connection_lost` exactly once.
pub struct Session {
    host: String,
    port: u16,
    requests: mpsc::UnboundedSender<Request>,
    shared: Arc<Mutex<Shared>>,
}

impl Session {
    /// Creates a session and starts connecting to the configured server.
    ///
    /// Must be called within a tokio runtime. The connection proceeds in the
    /// background; watch the returned event stream for `StateChanged` or
    /// `ConnectionFailed`.
    #[must_use]
    pub fn connect(config: Config) -> (Self, SessionEvents) {
        let transport = TcpTransport::new(config.clone());
        Self::with_transport(&config, transport)
    }

    /// Creates a session over an arbitrary transport.
    ///
    /// This is how tests drive the engine over in-memory pipes; production
    /// code normally goes through [`Session::connect`].
    #[must_use]
    pub fn with_transport<T: Transport>(config: &Config, transport: T) -> (Self, SessionEvents) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared {
            state: State::Disconnected,
            greeting: Vec::new(),
            current_mailbox: String::new(),
            queue_size: 0,
            timeout_secs: i64::try_from(inner::DEFAULT_TIMEOUT.as_secs()).unwrap_or(i64::MAX),
        }));

        let engine = SessionInner::new(
            config.host.clone(),
            config.port,
            transport,
            config.security == Security::Implicit,
            config.tls_version,
            event_tx,
            Arc::clone(&shared),
        );
        tokio::spawn(engine.run(request_rx));

        (
            Self {
                host: config.host.clone(),
                port: config.port,
                requests: request_tx,
                shared,
            },
            event_rx,
        )
    }

    /// The host this session was created for.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port this session was created for.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        self.shared().state
    }

    /// The text of the server greeting, once received.
    #[must_use]
    pub fn server_greeting(&self) -> String {
        String::from_utf8_lossy(&self.shared().greeting).into_owned()
    }

    /// The selected mailbox; `Some` exactly while the state is `Selected`.
    #[must_use]
    pub fn selected_mailbox(&self) -> Option<String> {
        let mailbox = self.shared().current_mailbox.clone();
        if mailbox.is_empty() {
            None
        } else {
            Some(mailbox)
        }
    }

    /// Number of queued jobs, counting the running one.
    #[must_use]
    pub fn job_queue_size(&self) -> usize {
        self.shared().queue_size
    }

    /// The inactivity timeout in seconds; negative means disabled.
    #[must_use]
    pub fn timeout(&self) -> i64 {
        self.shared().timeout_secs
    }

    /// Sets the inactivity timeout in seconds. Negative disables the
    /// watchdog; on expiry the transport is aborted without flushing.
    pub fn set_timeout(&self, seconds: i64) {
        self.shared().timeout_secs = seconds;
        let interval = u64::try_from(seconds).ok().map(Duration::from_secs);
        self.post(Request::SetTimeout(interval));
    }

    /// Submits a job. It runs when everything ahead of it has completed.
    ///
    /// If the session has already gone through its terminal disconnection,
    /// the job receives `connection_lost` immediately instead.
    pub fn enqueue(&self, job: &SharedJob) {
        if let Err(rejected) = self.requests.send(Request::Enqueue(Arc::clone(job))) {
            if let Request::Enqueue(job) = rejected.0 {
                job::lock_job(&job).connection_lost();
            }
        }
    }

    /// Closes the transport. Nothing is drained; every pending job receives
    /// `connection_lost`.
    pub fn close(&self) {
        self.post(Request::Close);
    }

    /// Requests client encryption negotiation (STARTTLS) on the established
    /// connection. [`TlsVersion::Any`] arms version fallback.
    pub fn start_tls(&self, version: TlsVersion) {
        self.post(Request::StartTls(version));
    }

    /// Answers a [`SessionEvent::SslErrors`] event. Accepting confirms the
    /// encrypted session; rejecting tears it down and reconnects without
    /// encryption.
    pub fn ssl_error_response(&self, accept: bool) {
        self.post(Request::SslErrorResponse(accept));
    }

    /// Marks certificate issues as acceptable for this session.
    pub fn ignore_errors(&self, issues: Vec<CertificateIssue>) {
        self.post(Request::IgnoreErrors(issues));
    }

    fn post(&self, request: Request) {
        // A closed channel means the engine already went through its
        // disconnect cleanup; requests after that are no-ops by design.
        let _ = self.requests.send(request);
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state())
            .field("job_queue_size", &self.job_queue_size())
            .finish_non_exhaustive()
    }
}
