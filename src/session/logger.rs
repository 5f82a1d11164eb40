//! Wire transcript logging.
//!
//! When the `KIMAP2_LOGFILE` environment variable names a path, every
//! outbound command and inbound response is appended to that file once the
//! session is past authentication. The pre-authentication exchange is never
//! written, which keeps LOGIN credentials out of the transcript.

use std::fs::{File, OpenOptions};
use std::io::Write;

/// Environment variable naming the transcript file.
const LOGFILE_ENV: &str = "KIMAP2_LOGFILE";

/// Line-oriented transcript writer.
#[derive(Debug)]
pub(crate) struct SessionLogger {
    file: File,
}

impl SessionLogger {
    /// Opens the transcript file named by the environment, if set.
    pub fn from_env() -> Option<Self> {
        let path = std::env::var_os(LOGFILE_ENV)?;
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(Self { file }),
            Err(error) => {
                tracing::warn!(?path, %error, "could not open session log file");
                None
            }
        }
    }

    pub fn data_sent(&mut self, data: &[u8]) {
        self.write_direction(b"C: ", data);
    }

    pub fn data_received(&mut self, data: &[u8]) {
        self.write_direction(b"S: ", data);
    }

    pub fn disconnection_occurred(&mut self) {
        let _ = self.file.write_all(b"X: disconnected\n");
    }

    fn write_direction(&mut self, prefix: &[u8], data: &[u8]) {
        // Transcript writes are best effort; a full disk must not take the
        // session down.
        let _ = self.file.write_all(prefix);
        let _ = self.file.write_all(data);
        let _ = self.file.write_all(b"\n");
    }
}
