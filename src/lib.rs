//! # imap-session
//!
//! An event-driven IMAP client **session engine**: the component that owns a
//! TCP/TLS connection to one IMAP server, serializes a queue of submitted
//! command jobs onto it, parses the server's line- and literal-oriented
//! responses incrementally, correlates tagged completions with the commands
//! that caused them, and exposes a clean lifecycle
//! (`Disconnected` → `NotAuthenticated` → `Authenticated` → `Selected`).
//!
//! The engine deliberately knows nothing about individual commands: LOGIN,
//! SELECT, FETCH and friends are [`Job`] implementations owned by the
//! caller. The session starts them in order, routes responses to the one
//! that is current, and advances its own state on the tagged completions of
//! the commands it tracks.
//!
//! ## Quick start
//!
//! ```ignore
//! use imap_session::{Config, Security, Session, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::builder("imap.example.com")
//!         .security(Security::Implicit)
//!         .build();
//!     let (session, mut events) = Session::connect(config);
//!
//!     session.enqueue(&login_job);     // your Job implementation
//!     session.enqueue(&select_job);
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::StateChanged { new, old } => {
//!                 println!("{old:?} -> {new:?}");
//!             }
//!             SessionEvent::ConnectionFailed => break,
//!             _ => {}
//!         }
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`buffer`]: receive buffer with cursor save/restore
//! - [`message`]: parsed response model
//! - [`parser`]: incremental two-phase response parser
//! - [`connection`]: configuration, streams, TLS, the transport abstraction
//! - [`session`]: the engine itself and its public facade
//!
//! ## Wire logging
//!
//! When the `KIMAP2_LOGFILE` environment variable names a path, a
//! line-oriented transcript of the conversation is appended there once the
//! session is authenticated. The pre-authentication exchange (credentials
//! included) is never written.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod buffer;
pub mod connection;
mod error;
mod mailbox;
pub mod message;
pub mod parser;
pub mod session;

pub use buffer::ByteBuffer;
pub use connection::{
    CertificateIssue, Config, ConfigBuilder, Security, SessionStream, TcpTransport, TlsSummary,
    TlsVersion, Transport,
};
pub use error::{Error, ErrorKind, Result};
pub use message::{Message, Part};
pub use parser::StreamParser;
pub use session::{
    shared_job, Job, JobContext, JobProgress, Session, SessionEvent, SessionEvents, SharedJob,
    State,
};
