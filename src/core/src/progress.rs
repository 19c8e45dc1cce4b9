//! Progress sink for byte-level transfer reporting and leveled logging.

use std::fmt;

use crate::oci::ContentDigest;

/// Log severity for progress messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        write!(f, "{s}")
    }
}

/// Sink for transfer progress events.
///
/// Implementations must be cheap and non-blocking; the pull engine calls
/// [`Progress::blob_bytes`] from every download task.
pub trait Progress: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    /// A blob transfer has started (or resumed at `offset` bytes).
    fn begin_blob(&self, digest: &ContentDigest, size: u64, offset: u64) {
        let _ = (digest, size, offset);
    }

    /// `n` additional bytes of the blob have been transferred.
    fn blob_bytes(&self, digest: &ContentDigest, n: u64) {
        let _ = (digest, n);
    }

    /// The blob transfer has finished (successfully or not).
    fn finish_blob(&self, digest: &ContentDigest) {
        let _ = digest;
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }
}

/// Progress sink that forwards log lines to `tracing` and drops byte events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => tracing::error!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Trace => tracing::trace!("{message}"),
        }
    }

    fn begin_blob(&self, digest: &ContentDigest, size: u64, offset: u64) {
        if offset > 0 {
            tracing::debug!(%digest, size, offset, "resuming blob transfer");
        } else {
            tracing::debug!(%digest, size, "starting blob transfer");
        }
    }

    fn finish_blob(&self, digest: &ContentDigest) {
        tracing::debug!(%digest, "blob transfer finished");
    }
}

/// Progress sink that discards everything. Useful in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn log(&self, _level: LogLevel, _message: &str) {}
}
