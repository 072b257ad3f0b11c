//! Output sink abstraction shared by every consumer of process output

use std::fmt;
use std::io::{self, Write};
use std::sync::Mutex;

/// Which process stream a chunk of output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Stdout => write!(f, "STDOUT"),
            StreamType::Stderr => write!(f, "STDERR"),
        }
    }
}

/// A destination for raw process output.
///
/// Methods take `&self` so a sink can be shared between the stream pumps
/// and whoever inspects it; implementations carry their own locking.
pub trait OutputSink: Send + Sync {
    /// Short label used when reporting failures of this sink
    fn name(&self) -> &str;

    fn write(&self, buf: &[u8]) -> io::Result<()>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Called once when the stream feeding this sink has ended
    fn close(&self) -> io::Result<()> {
        self.flush()
    }
}

/// Adapts any [`std::io::Write`] into an [`OutputSink`]
pub struct WriteSink<W> {
    name: String,
    inner: Mutex<W>,
}

impl<W: Write + Send> WriteSink<W> {
    pub fn new(name: impl Into<String>, inner: W) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(inner),
        }
    }

    /// Consume the adapter and return the wrapped writer
    pub fn into_inner(self) -> W {
        match self.inner.into_inner() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run a closure against the wrapped writer
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl<W: Write + Send> OutputSink for WriteSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        self.with_inner(|w| w.write_all(buf))
    }

    fn flush(&self) -> io::Result<()> {
        self.with_inner(|w| w.flush())
    }
}
