//! The session engine's event loop.
//!
//! All mutable session state lives on one task: receive buffer, parser,
//! job queue, lifecycle state, tracked tags, watchdog and TLS negotiation
//! state. The facade talks to it over a request channel, so every public
//! entry point hops into this context before touching anything. The loop
//! yields at four points only: waiting for bytes, waiting for a request,
//! waiting for the watchdog, and waiting for a TLS handshake.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::job::{lock_job, JobContext, JobProgress, JobQueue};
use super::logger::SessionLogger;
use super::{Request, SessionEvent, Shared, State};
use crate::connection::{CertificateIssue, TlsSummary, TlsVersion, Transport};
use crate::error::ErrorKind;
use crate::message::Message;
use crate::parser::StreamParser;

/// Default inactivity timeout.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 8192;

const TRIED_TLS13: u8 = 0b01;
const TRIED_TLS12: u8 = 0b10;

/// Outbound side of the session: tag generation, tracked tags, the write
/// queue and the wire logger. Split out so job callbacks can borrow it
/// through [`JobContext`] while the job itself is borrowed from the queue.
pub(crate) struct WireState {
    tag_count: u64,
    pub(crate) auth_tag: Vec<u8>,
    pub(crate) select_tag: Vec<u8>,
    pub(crate) close_tag: Vec<u8>,
    pub(crate) upcoming_mailbox: String,
    pub(crate) outbound: VecDeque<Vec<u8>>,
    pub(crate) logger: Option<SessionLogger>,
    pub(crate) log_enabled: bool,
    pub(crate) tls_request: Option<TlsVersion>,
}

impl WireState {
    fn new() -> Self {
        Self {
            tag_count: 0,
            auth_tag: Vec::new(),
            select_tag: Vec::new(),
            close_tag: Vec::new(),
            upcoming_mailbox: String::new(),
            outbound: VecDeque::new(),
            logger: SessionLogger::from_env(),
            log_enabled: false,
            tls_request: None,
        }
    }

    /// Tags and enqueues one command line, arming tag tracking for the
    /// commands that drive state transitions.
    pub(crate) fn send_command(&mut self, command: &[u8], args: &[u8]) -> Vec<u8> {
        self.tag_count += 1;
        let tag = format!("A{:06}", self.tag_count).into_bytes();

        let mut payload = tag.clone();
        payload.push(b' ');
        payload.extend_from_slice(command);
        if !args.is_empty() {
            payload.push(b' ');
            payload.extend_from_slice(args);
        }
        self.send_data(&payload);

        if command == b"LOGIN" || command == b"AUTHENTICATE" {
            self.auth_tag.clone_from(&tag);
        } else if command == b"SELECT" || command == b"EXAMINE" {
            self.select_tag.clone_from(&tag);
            self.upcoming_mailbox = crate::mailbox::upcoming_mailbox(args);
        } else if command == b"CLOSE" {
            self.close_tag.clone_from(&tag);
        }
        tag
    }

    pub(crate) fn send_data(&mut self, data: &[u8]) {
        if self.log_enabled {
            if let Some(logger) = self.logger.as_mut() {
                logger.data_sent(data);
            }
        }
        let mut line = data.to_vec();
        line.extend_from_slice(b"\r\n");
        self.outbound.push_back(line);
    }
}

/// Encryption negotiation state, including the version-fallback walk.
struct TlsState {
    any_attempted: bool,
    attempted: u8,
    fallback_armed: bool,
    encrypted: bool,
    pending_summary: Option<TlsSummary>,
}

impl TlsState {
    fn new() -> Self {
        Self {
            any_attempted: false,
            attempted: 0,
            fallback_armed: false,
            encrypted: false,
            pending_summary: None,
        }
    }

    /// Resolves the version for the next handshake attempt.
    ///
    /// `Any` walks the preference list, re-arming fallback only while
    /// untried versions remain; picking the last one disarms it, so the next
    /// failure surfaces instead of retrying.
    fn pick(&mut self, requested: TlsVersion) -> TlsVersion {
        match requested {
            TlsVersion::Any => {
                self.fallback_armed = true;
                if !self.any_attempted {
                    self.any_attempted = true;
                    TlsVersion::Any
                } else if self.attempted & TRIED_TLS13 == 0 {
                    self.attempted |= TRIED_TLS13;
                    TlsVersion::Tls13
                } else {
                    self.attempted |= TRIED_TLS12;
                    self.fallback_armed = false;
                    TlsVersion::Tls12
                }
            }
            version => version,
        }
    }
}

enum Turn {
    Request(Option<Request>),
    Read(std::io::Result<usize>),
    TimedOut,
}

pub(crate) struct SessionInner<T: Transport> {
    host: String,
    port: u16,
    transport: T,
    stream: Option<T::Stream>,
    parser: StreamParser,
    wire: WireState,
    queue: JobQueue,
    state: State,
    greeting: Vec<u8>,
    is_socket_connected: bool,
    implicit_tls: bool,
    tls_version: TlsVersion,
    shutdown: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
    shared: Arc<Mutex<Shared>>,
    timer_interval: Option<Duration>,
    deadline: Option<Instant>,
    ignored: Vec<CertificateIssue>,
    tls: TlsState,
    pending_start_tls: Option<TlsVersion>,
}

impl<T: Transport> SessionInner<T> {
    pub(crate) fn new(
        host: String,
        port: u16,
        transport: T,
        implicit_tls: bool,
        tls_version: TlsVersion,
        events: mpsc::UnboundedSender<SessionEvent>,
        shared: Arc<Mutex<Shared>>,
    ) -> Self {
        Self {
            host,
            port,
            transport,
            stream: None,
            parser: StreamParser::new(),
            wire: WireState::new(),
            queue: JobQueue::new(),
            state: State::Disconnected,
            greeting: Vec::new(),
            is_socket_connected: false,
            implicit_tls,
            tls_version,
            shutdown: false,
            events,
            shared,
            timer_interval: Some(DEFAULT_TIMEOUT),
            deadline: None,
            ignored: Vec::new(),
            tls: TlsState::new(),
            pending_start_tls: None,
        }
    }

    pub(crate) async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        self.reconnect().await;

        let mut read_buf = vec![0u8; READ_CHUNK];
        while !self.shutdown {
            self.flush_outbound().await;
            if self.shutdown {
                break;
            }
            if let Some(version) = self.pending_start_tls.take() {
                self.start_ssl(version).await;
                continue;
            }

            let turn = {
                let stream = self.stream.as_mut();
                let deadline = self.deadline;
                tokio::select! {
                    request = requests.recv() => Turn::Request(request),
                    result = read_some(stream, &mut read_buf) => Turn::Read(result),
                    () = expire(deadline) => Turn::TimedOut,
                }
            };
            match turn {
                Turn::Request(None) => self.close_socket().await,
                Turn::Request(Some(request)) => self.handle_request(request).await,
                Turn::Read(Ok(0)) => self.socket_disconnected().await,
                Turn::Read(Ok(n)) => {
                    let bytes = read_buf[..n].to_vec();
                    self.data_received(&bytes).await;
                }
                Turn::Read(Err(error)) => {
                    let kind = ErrorKind::from_io(&error);
                    tracing::debug!(%error, "read failed");
                    self.socket_error(kind).await;
                }
                Turn::TimedOut => self.on_socket_timeout().await,
            }
        }

        // Terminal: anything that raced in while we were shutting down can
        // never run, but its owner is still owed the failure notification.
        requests.close();
        while let Ok(request) = requests.try_recv() {
            if let Request::Enqueue(job) = request {
                lock_job(&job).connection_lost();
            }
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Enqueue(job) => {
                self.queue.enqueue(&job);
                self.publish_queue_size();
                self.start_next();
            }
            Request::Close => self.close_socket().await,
            Request::SetTimeout(interval) => self.set_socket_timeout(interval),
            Request::StartTls(version) => self.pending_start_tls = Some(version),
            Request::SslErrorResponse(accept) => self.ssl_error_response(accept).await,
            Request::IgnoreErrors(issues) => self.ignored.extend(issues),
        }
    }

    // === inbound path ===

    async fn data_received(&mut self, bytes: &[u8]) {
        self.restart_timer();
        self.parser.append(bytes);
        loop {
            match self.parser.read_message() {
                Ok(Some(response)) => {
                    self.response_received(response).await;
                    if self.shutdown || self.stream.is_none() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(%error, "inconsistent response stream, aborting connection");
                    self.abort_socket().await;
                    break;
                }
            }
        }
    }

    async fn response_received(&mut self, response: Message) {
        if self.wire.log_enabled {
            if let Some(logger) = self.wire.logger.as_mut() {
                logger.data_received(&response.render());
            }
        }

        let tag = response.content_str(0).unwrap_or_default().to_vec();
        let code = response.content_str(1).unwrap_or_default().to_vec();

        // BYE may arrive as part of a LOGOUT sequence or before the server
        // closes the connection after an error. Either way the server closes
        // the socket next, so there is nothing to do here.
        if code == b"BYE" {
            tracing::debug!(
                text = %String::from_utf8_lossy(&response.render_content_from(2)),
                "received BYE"
            );
            return;
        }

        match self.state {
            State::Disconnected => {
                self.stop_timer();
                if code == b"OK" {
                    self.store_greeting(&response);
                    self.set_state(State::NotAuthenticated);
                } else if code == b"PREAUTH" {
                    self.store_greeting(&response);
                    self.set_state(State::Authenticated);
                } else {
                    // We have been rejected.
                    self.close_socket().await;
                    return;
                }
                self.start_next();
                return;
            }
            State::NotAuthenticated => {
                if code == b"OK" && !self.wire.auth_tag.is_empty() && tag == self.wire.auth_tag {
                    self.set_state(State::Authenticated);
                }
            }
            State::Authenticated => {
                if code == b"OK" && !self.wire.select_tag.is_empty() && tag == self.wire.select_tag
                {
                    self.set_state(State::Selected);
                    self.set_mailbox(self.wire.upcoming_mailbox.clone());
                }
            }
            State::Selected => {
                let closed =
                    code == b"OK" && !self.wire.close_tag.is_empty() && tag == self.wire.close_tag;
                let select_failed = code != b"OK"
                    && !self.wire.select_tag.is_empty()
                    && tag == self.wire.select_tag;
                if closed || select_failed {
                    self.set_state(State::Authenticated);
                    self.set_mailbox(String::new());
                } else if code == b"OK"
                    && !self.wire.select_tag.is_empty()
                    && tag == self.wire.select_tag
                {
                    // Re-selecting refreshes the mailbox without leaving
                    // the selected state.
                    self.set_mailbox(self.wire.upcoming_mailbox.clone());
                }
            }
        }

        if !self.wire.auth_tag.is_empty() && tag == self.wire.auth_tag {
            self.wire.auth_tag.clear();
        }
        if !self.wire.select_tag.is_empty() && tag == self.wire.select_tag {
            self.wire.select_tag.clear();
        }
        if !self.wire.close_tag.is_empty() && tag == self.wire.close_tag {
            self.wire.close_tag.clear();
        }

        if let Some(job) = self.queue.current() {
            self.restart_timer();
            let progress = {
                let mut guard = lock_job(&job);
                let mut context = JobContext {
                    wire: &mut self.wire,
                };
                guard.handle_response(&response, &mut context)
            };
            self.apply_side_requests();
            if progress == JobProgress::Done {
                self.job_done();
            }
        } else {
            tracing::warn!(
                response = %String::from_utf8_lossy(&response.render()),
                "response received with no job to handle it"
            );
        }
    }

    fn store_greeting(&mut self, response: &Message) {
        self.greeting = response.render_content_from(2);
        if let Ok(mut shared) = self.shared.lock() {
            shared.greeting.clone_from(&self.greeting);
        }
    }

    // === job scheduling ===

    fn start_next(&mut self) {
        loop {
            if !self.is_socket_connected
                || self.state == State::Disconnected
                || self.queue.has_current()
            {
                return;
            }
            let Some(job) = self.queue.take_next() else {
                return;
            };
            self.restart_timer();
            let progress = {
                let mut guard = lock_job(&job);
                let mut context = JobContext {
                    wire: &mut self.wire,
                };
                guard.start(&mut context)
            };
            self.apply_side_requests();
            if progress == JobProgress::Done {
                self.stop_timer();
                self.queue.finish_current();
                self.publish_queue_size();
            } else {
                return;
            }
        }
    }

    fn job_done(&mut self) {
        self.stop_timer();
        self.queue.finish_current();
        self.publish_queue_size();
        self.start_next();
    }

    fn apply_side_requests(&mut self) {
        if let Some(version) = self.wire.tls_request.take() {
            self.pending_start_tls = Some(version);
        }
    }

    fn publish_queue_size(&mut self) {
        let size = self.queue.size();
        if let Ok(mut shared) = self.shared.lock() {
            shared.queue_size = size;
        }
        let _ = self.events.send(SessionEvent::JobQueueSizeChanged(size));
    }

    // === state ===

    fn set_state(&mut self, new: State) {
        if new == self.state {
            return;
        }
        let old = self.state;
        self.state = new;
        self.wire.log_enabled = matches!(new, State::Authenticated | State::Selected)
            && self.wire.logger.is_some();
        if let Ok(mut shared) = self.shared.lock() {
            shared.state = new;
        }
        let _ = self.events.send(SessionEvent::StateChanged { new, old });
    }

    fn set_mailbox(&mut self, mailbox: String) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.current_mailbox = mailbox;
        }
    }

    // === connection lifecycle ===

    async fn reconnect(&mut self) {
        // Only connect when neither connected nor connecting. Connects run
        // inline on this task, so a present stream is the only guard needed.
        if self.stream.is_some() {
            return;
        }
        tracing::debug!(host = %self.host, port = self.port, "connecting");

        let result = if self.implicit_tls || self.tls.encrypted {
            match self.transport.connect_tls(self.tls_version).await {
                Ok((stream, summary)) => {
                    self.stream = Some(stream);
                    self.on_socket_connected();
                    self.ssl_connected(summary);
                    Ok(())
                }
                Err(error) => Err(error),
            }
        } else {
            match self.transport.connect().await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.on_socket_connected();
                    Ok(())
                }
                Err(error) => Err(error),
            }
        };

        if let Err(error) = result {
            tracing::warn!(%error, "connection failed");
            self.tls.fallback_armed = false;
            let kind = ErrorKind::from(&error);
            self.socket_error(kind).await;
        }
    }

    fn on_socket_connected(&mut self) {
        tracing::debug!("socket connected");
        self.is_socket_connected = true;
        self.restart_timer();
    }

    async fn socket_error(&mut self, kind: ErrorKind) {
        tracing::debug!(?kind, "socket error");
        self.stop_timer();

        let job = self.queue.current().or_else(|| self.queue.take_next());
        if let Some(job) = job {
            lock_job(&job).socket_error(kind);
        }

        if self.is_socket_connected {
            self.close_socket().await;
        } else {
            self.socket_disconnected().await;
        }
    }

    async fn close_socket(&mut self) {
        self.tls.fallback_armed = false;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.socket_disconnected().await;
    }

    /// Immediate teardown with no flush, as the watchdog and the parser use.
    async fn abort_socket(&mut self) {
        self.stream = None;
        self.socket_disconnected().await;
    }

    async fn socket_disconnected(&mut self) {
        if self.tls.fallback_armed {
            // A handshake attempt failed with untried versions remaining:
            // retry with the next one instead of tearing the session down.
            self.stream = None;
            self.is_socket_connected = false;
            Box::pin(self.reconnect()).await;
            if self.stream.is_some() {
                self.pending_start_tls = Some(TlsVersion::Any);
            }
            return;
        }

        tracing::debug!("socket disconnected");
        self.stop_timer();
        if self.wire.log_enabled {
            if let Some(logger) = self.wire.logger.as_mut() {
                logger.disconnection_occurred();
            }
        }

        if self.state == State::Disconnected {
            let _ = self.events.send(SessionEvent::ConnectionFailed);
        } else {
            self.set_state(State::Disconnected);
        }

        self.is_socket_connected = false;
        self.stream = None;
        self.clear_job_queue();
        self.shutdown = true;
    }

    fn clear_job_queue(&mut self) {
        for job in self.queue.drain() {
            lock_job(&job).connection_lost();
        }
        self.publish_queue_size();
    }

    // === outbound path ===

    async fn flush_outbound(&mut self) {
        if self.wire.outbound.is_empty() || self.stream.is_none() {
            return;
        }
        while let Some(data) = self.wire.outbound.pop_front() {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            if let Err(error) = stream.write_all(&data).await {
                let kind = ErrorKind::from_io(&error);
                tracing::debug!(%error, "write failed");
                self.socket_error(kind).await;
                return;
            }
        }
        if let Some(stream) = self.stream.as_mut() {
            if let Err(error) = stream.flush().await {
                let kind = ErrorKind::from_io(&error);
                self.socket_error(kind).await;
                return;
            }
        }
        self.restart_timer();
    }

    // === inactivity watchdog ===

    fn set_socket_timeout(&mut self, interval: Option<Duration>) {
        let was_active = self.deadline.is_some();
        if was_active {
            self.stop_timer();
        }
        self.timer_interval = interval;
        if was_active {
            self.start_timer();
        }
    }

    fn start_timer(&mut self) {
        if let Some(interval) = self.timer_interval {
            self.deadline = Some(Instant::now() + interval);
        }
    }

    fn stop_timer(&mut self) {
        self.deadline = None;
    }

    fn restart_timer(&mut self) {
        self.stop_timer();
        self.start_timer();
    }

    async fn on_socket_timeout(&mut self) {
        tracing::debug!("inactivity timeout, aborting connection");
        self.deadline = None;
        self.abort_socket().await;
    }

    // === TLS negotiation ===

    async fn start_ssl(&mut self, requested: TlsVersion) {
        let chosen = self.tls.pick(requested);
        let Some(stream) = self.stream.take() else {
            tracing::warn!("cannot negotiate encryption, the socket is not connected");
            return;
        };
        tracing::debug!(?chosen, "starting client encryption");

        match self.transport.start_tls(stream, chosen).await {
            Ok((stream, summary)) => {
                self.stream = Some(stream);
                self.restart_timer();
                self.ssl_connected(summary);
            }
            Err(error) => {
                tracing::debug!(%error, "TLS handshake failed");
                if self.tls.fallback_armed {
                    self.socket_disconnected().await;
                } else {
                    self.is_socket_connected = false;
                    self.socket_error(ErrorKind::TlsHandshake).await;
                }
            }
        }
    }

    fn ssl_connected(&mut self, summary: TlsSummary) {
        let unresolved: Vec<CertificateIssue> = summary
            .issues
            .iter()
            .filter(|issue| !self.ignored.contains(issue))
            .cloned()
            .collect();

        if unresolved.is_empty() && summary.version.is_some() && summary.cipher.is_some() {
            tracing::debug!(version = ?summary.version, "TLS negotiation done");
            self.tls.fallback_armed = false;
            self.tls.encrypted = true;
            let _ = self.events.send(SessionEvent::EncryptionNegotiationResult {
                ok: true,
                version: summary.version,
            });
        } else {
            tracing::debug!(
                issues = unresolved.len(),
                "TLS handshake completed with unresolved errors"
            );
            self.tls.pending_summary = Some(summary);
            let _ = self.events.send(SessionEvent::SslErrors(unresolved));
        }
    }

    async fn ssl_error_response(&mut self, accept: bool) {
        let Some(summary) = self.tls.pending_summary.take() else {
            return;
        };
        if accept {
            self.tls.encrypted = true;
            self.tls.fallback_armed = false;
            let _ = self.events.send(SessionEvent::EncryptionNegotiationResult {
                ok: true,
                version: summary.version,
            });
        } else {
            // Reconnect in unencrypted mode so new commands can be issued.
            self.tls.encrypted = false;
            self.tls.fallback_armed = false;
            self.implicit_tls = false;
            if let Some(mut stream) = self.stream.take() {
                let _ = stream.shutdown().await;
            }
            self.is_socket_connected = false;
            self.reconnect().await;
            let _ = self.events.send(SessionEvent::EncryptionNegotiationResult {
                ok: false,
                version: None,
            });
        }
    }
}

async fn read_some<S: AsyncRead + Unpin>(
    stream: Option<&mut S>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match stream {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
