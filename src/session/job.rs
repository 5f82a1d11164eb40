//! Jobs: the units of work a session executes.
//!
//! A job is an externally owned command implementation (LOGIN, SELECT,
//! FETCH, ...) that the session sees only through a narrow capability set:
//! it is started when it reaches the head of the queue, receives every
//! response while it is current, and signals completion through its return
//! value. Dropping the last external handle to a job is implicit
//! cancellation; the session only keeps weak references and never touches a
//! job that no longer exists.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::inner::WireState;
use crate::connection::TlsVersion;
use crate::error::ErrorKind;
use crate::message::Message;

/// Whether a job wants to keep receiving responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobProgress {
    /// The job is still waiting for responses.
    Pending,
    /// The job is finished; the next queued job may start.
    Done,
}

/// A unit of work executed over the session's connection.
///
/// While a job is current it owns the wire: every parsed response is handed
/// to it until it reports [`JobProgress::Done`]. The failure callbacks are
/// terminal; a job receives `connection_lost` exactly once, possibly after a
/// `socket_error` describing what broke.
pub trait Job: Send {
    /// Called when the job becomes current; typically writes one command.
    fn start(&mut self, session: &mut JobContext<'_>) -> JobProgress;

    /// Called with every response received while this job is current.
    fn handle_response(&mut self, response: &Message, session: &mut JobContext<'_>)
        -> JobProgress;

    /// The connection is gone; the job will receive nothing further.
    fn connection_lost(&mut self);

    /// A transport error broke the connection carrying this job.
    fn socket_error(&mut self, kind: ErrorKind) {
        let _ = kind;
    }
}

/// An externally owned, shareable job handle.
pub type SharedJob = Arc<Mutex<dyn Job>>;

/// Wraps a job value into a [`SharedJob`].
pub fn shared_job<J: Job + 'static>(job: J) -> SharedJob {
    Arc::new(Mutex::new(job))
}

pub(crate) fn lock_job(job: &SharedJob) -> MutexGuard<'_, dyn Job + 'static> {
    match job.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The session surface a job may touch from its callbacks.
pub struct JobContext<'a> {
    pub(crate) wire: &'a mut WireState,
}

impl JobContext<'_> {
    /// Tags and enqueues a command line, returning the tag.
    ///
    /// The composed line is `<tag> SP <command> [SP <args>] CRLF`. LOGIN,
    /// AUTHENTICATE, SELECT, EXAMINE and CLOSE commands additionally arm the
    /// session's state-transition tracking.
    pub fn send_command(&mut self, command: &str, args: &str) -> String {
        let tag = self.wire.send_command(command.as_bytes(), args.as_bytes());
        String::from_utf8_lossy(&tag).into_owned()
    }

    /// Enqueues a raw line (without CRLF) for writing, untagged.
    ///
    /// Used for continuation data such as literal payloads.
    pub fn send_data(&mut self, data: &[u8]) {
        self.wire.send_data(data);
    }

    /// Requests client-side encryption negotiation (STARTTLS).
    ///
    /// `TlsVersion::Any` arms version fallback.
    pub fn start_tls(&mut self, version: TlsVersion) {
        self.wire.tls_request = Some(version);
    }
}

/// FIFO of pending jobs plus the single current slot.
///
/// Entries are weak; a job dropped externally disappears from the queue the
/// next time it is looked at.
#[derive(Default)]
pub(crate) struct JobQueue {
    queue: VecDeque<Weak<Mutex<dyn Job>>>,
    current: Option<Weak<Mutex<dyn Job>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, job: &SharedJob) {
        self.queue.push_back(Arc::downgrade(job));
    }

    /// Queue length plus one if a job is current, after pruning dead entries.
    pub fn size(&mut self) -> usize {
        self.queue.retain(|weak| weak.strong_count() > 0);
        if self
            .current
            .as_ref()
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            self.current = None;
        }
        self.queue.len() + usize::from(self.current.is_some())
    }

    /// Returns the current job, clearing the slot if it was dropped.
    pub fn current(&mut self) -> Option<SharedJob> {
        let weak = self.current.as_ref()?;
        match weak.upgrade() {
            Some(job) => Some(job),
            None => {
                self.current = None;
                None
            }
        }
    }

    pub fn has_current(&mut self) -> bool {
        self.current().is_some()
    }

    /// Dequeues the next live job and makes it current.
    pub fn take_next(&mut self) -> Option<SharedJob> {
        while let Some(weak) = self.queue.pop_front() {
            if let Some(job) = weak.upgrade() {
                self.current = Some(weak);
                return Some(job);
            }
        }
        None
    }

    pub fn finish_current(&mut self) {
        self.current = None;
    }

    /// Removes every live job, current first then FIFO order.
    ///
    /// Used by the disconnect cleanup so each job can be notified exactly
    /// once.
    pub fn drain(&mut self) -> Vec<SharedJob> {
        let mut jobs = Vec::new();
        if let Some(job) = self.current.take().and_then(|weak| weak.upgrade()) {
            jobs.push(job);
        }
        for weak in self.queue.drain(..) {
            if let Some(job) = weak.upgrade() {
                jobs.push(job);
            }
        }
        jobs
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    struct NoopJob;

    impl Job for NoopJob {
        fn start(&mut self, _session: &mut JobContext<'_>) -> JobProgress {
            JobProgress::Done
        }

        fn handle_response(
            &mut self,
            _response: &Message,
            _session: &mut JobContext<'_>,
        ) -> JobProgress {
            JobProgress::Done
        }

        fn connection_lost(&mut self) {}
    }

    #[test]
    fn test_size_counts_current_and_queued() {
        let mut queue = JobQueue::new();
        let a = shared_job(NoopJob);
        let b = shared_job(NoopJob);

        queue.enqueue(&a);
        queue.enqueue(&b);
        assert_eq!(queue.size(), 2);

        let started = queue.take_next().unwrap();
        assert!(Arc::ptr_eq(&started, &a));
        assert_eq!(queue.size(), 2);

        queue.finish_current();
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_dropped_job_is_silently_removed() {
        let mut queue = JobQueue::new();
        let a = shared_job(NoopJob);
        queue.enqueue(&a);
        assert_eq!(queue.size(), 1);

        drop(a);
        assert_eq!(queue.size(), 0);
        assert!(queue.take_next().is_none());
    }

    #[test]
    fn test_dropped_current_clears_slot() {
        let mut queue = JobQueue::new();
        let a = shared_job(NoopJob);
        queue.enqueue(&a);
        let started = queue.take_next().unwrap();
        drop(started);
        drop(a);

        assert!(!queue.has_current());
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_drain_orders_current_first() {
        let mut queue = JobQueue::new();
        let a = shared_job(NoopJob);
        let b = shared_job(NoopJob);
        let c = shared_job(NoopJob);
        queue.enqueue(&a);
        queue.enqueue(&b);
        queue.enqueue(&c);
        let _ = queue.take_next();

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert!(Arc::ptr_eq(&drained[0], &a));
        assert!(Arc::ptr_eq(&drained[1], &b));
        assert!(Arc::ptr_eq(&drained[2], &c));
        assert_eq!(queue.size(), 0);
    }
}
