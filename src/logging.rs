//! Logging initialization
//!
//! Log records go to stderr so that commands writing payload data to stdout
//! (the support archive) stay machine-readable. The level is taken from the
//! `LOG_LEVEL` environment variable (`trace|debug|info|warn|error`,
//! default `info`).
//!
//! The support-archive command additionally tees every record into an
//! in-memory buffer which is drained into `support-archive.log` by the final
//! collector, so per-collector failures end up inside the bundle itself.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log level
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Build the level filter from `LOG_LEVEL`, falling back to `info`
fn env_filter() -> EnvFilter {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize process-wide logging to stderr
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}

/// Shared in-memory sink for log records collected during support-archive runs
#[derive(Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the buffered records, leaving the buffer empty.
    ///
    /// Called exactly once by the terminal support-archive collector.
    pub fn drain(&self) -> Vec<u8> {
        let mut guard = self.inner.lock().expect("log buffer poisoned");
        std::mem::take(&mut *guard)
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.inner.lock().expect("log buffer poisoned").len()
    }

    /// Whether the buffer holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writer handed to `tracing_subscriber`; duplicates records to stderr and
/// the shared buffer
pub struct TeeWriter {
    buffer: LogBuffer,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        let mut guard = self
            .buffer
            .inner
            .lock()
            .map_err(|_| io::Error::other("log buffer poisoned"))?;
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for LogBuffer {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            buffer: self.clone(),
        }
    }
}

/// Initialize logging for the support-archive command.
///
/// Returns the buffer the final collector drains into `support-archive.log`.
pub fn init_with_buffer() -> LogBuffer {
    let buffer = LogBuffer::new();

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_ansi(false).with_writer(buffer.clone()))
        .init();

    buffer
}
