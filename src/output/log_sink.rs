//! Forwards process output lines to `tracing`

use super::lines::LineSplitter;
use super::sink::{OutputSink, StreamType};
use encoding_rs::Encoding;
use std::io;
use std::sync::{Arc, Mutex};
use tracing::Level;

/// Decides the log level of one line of process output.
///
/// Returning `None` suppresses the line. Implementations must not panic;
/// they are called on the stream pump for every line.
pub trait LogDispatcher: Send + Sync {
    fn dispatch(&self, stream: StreamType, line: &str) -> Option<Level>;
}

/// Fixed level per stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelDispatcher {
    pub stdout: Option<Level>,
    pub stderr: Option<Level>,
}

impl Default for LevelDispatcher {
    fn default() -> Self {
        Self {
            stdout: Some(Level::INFO),
            stderr: Some(Level::ERROR),
        }
    }
}

impl LogDispatcher for LevelDispatcher {
    fn dispatch(&self, stream: StreamType, _line: &str) -> Option<Level> {
        match stream {
            StreamType::Stdout => self.stdout,
            StreamType::Stderr => self.stderr,
        }
    }
}

/// Sink logging every complete line of one stream, prefixed with the pid
pub struct TracingLogSink {
    name: String,
    stream: StreamType,
    pid: String,
    dispatcher: Arc<dyn LogDispatcher>,
    splitter: Mutex<LineSplitter>,
}

impl TracingLogSink {
    pub fn new(
        stream: StreamType,
        pid: impl Into<String>,
        dispatcher: Arc<dyn LogDispatcher>,
        encoding: &'static Encoding,
    ) -> Self {
        Self {
            name: format!("log-{}", stream.to_string().to_lowercase()),
            stream,
            pid: pid.into(),
            dispatcher,
            splitter: Mutex::new(LineSplitter::new(encoding)),
        }
    }

    fn emit(&self, line: String) {
        let Some(level) = self.dispatcher.dispatch(self.stream, &line) else {
            return;
        };
        let pid = self.pid.as_str();
        match level {
            Level::TRACE => tracing::trace!("{}: {}", pid, line),
            Level::DEBUG => tracing::debug!("{}: {}", pid, line),
            Level::INFO => tracing::info!("{}: {}", pid, line),
            Level::WARN => tracing::warn!("{}: {}", pid, line),
            Level::ERROR => tracing::error!("{}: {}", pid, line),
        }
    }

    fn splitter(&self) -> std::sync::MutexGuard<'_, LineSplitter> {
        match self.splitter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OutputSink for TracingLogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut lines = Vec::new();
        self.splitter().push(buf, |line| lines.push(line));
        for line in lines {
            self.emit(line);
        }
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        let mut lines = Vec::new();
        self.splitter().finish(|line| lines.push(line));
        for line in lines {
            self.emit(line);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDispatcher {
        seen: AtomicUsize,
    }

    impl LogDispatcher for CountingDispatcher {
        fn dispatch(&self, _stream: StreamType, line: &str) -> Option<Level> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if line.starts_with("noise") {
                None
            } else {
                Some(Level::DEBUG)
            }
        }
    }

    #[test]
    fn test_default_levels() {
        let dispatcher = LevelDispatcher::default();
        assert_eq!(dispatcher.dispatch(StreamType::Stdout, "x"), Some(Level::INFO));
        assert_eq!(dispatcher.dispatch(StreamType::Stderr, "x"), Some(Level::ERROR));
    }

    #[test]
    fn test_dispatcher_consulted_per_line() {
        let dispatcher = Arc::new(CountingDispatcher {
            seen: AtomicUsize::new(0),
        });
        let sink = TracingLogSink::new(
            StreamType::Stdout,
            "4242",
            Arc::clone(&dispatcher) as Arc<dyn LogDispatcher>,
            encoding_rs::UTF_8,
        );

        sink.write(b"first\nnoise line\nsec").unwrap();
        assert_eq!(dispatcher.seen.load(Ordering::SeqCst), 2);

        sink.write(b"ond\n").unwrap();
        sink.close().unwrap();
        assert_eq!(dispatcher.seen.load(Ordering::SeqCst), 3);
        assert_eq!(sink.name(), "log-stdout");
    }
}
