//! Fan-out of process output to several sinks

use super::sink::OutputSink;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identifies a registered sink so it can be removed later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// One failed delegation inside a fan-out call
#[derive(Debug, thiserror::Error)]
#[error("{label}: {source}")]
pub struct SinkFailure {
    pub label: String,
    pub source: io::Error,
}

/// Every failure of a single fan-out call.
///
/// There is deliberately no single `source()`: all causes are equal and
/// are exposed through [`MultiSinkError::causes`].
#[derive(Debug)]
pub struct MultiSinkError {
    failures: Vec<SinkFailure>,
}

impl MultiSinkError {
    pub fn causes(&self) -> &[SinkFailure] {
        &self.failures
    }

    /// Recover the aggregate from an `io::Error` produced by [`MultiSink`]
    pub fn from_io(err: &io::Error) -> Option<&MultiSinkError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<MultiSinkError>())
    }
}

impl fmt::Display for MultiSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sink delegation(s) failed:", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            write!(f, " {}. {}", i, failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiSinkError {}

impl From<MultiSinkError> for io::Error {
    fn from(err: MultiSinkError) -> Self {
        io::Error::other(err)
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Write,
    Flush,
    Close,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Write => "write",
            Op::Flush => "flush",
            Op::Close => "close",
        }
    }
}

/// Forwards every call to each registered sink in registration order.
///
/// A failing sink never stops delivery to the remaining ones; failures are
/// collected and reported together once all sinks were attempted.
pub struct MultiSink {
    name: String,
    sinks: Mutex<Vec<(SinkId, Arc<dyn OutputSink>)>>,
    next_id: AtomicU64,
}

impl MultiSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sinks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add(&self, sink: Arc<dyn OutputSink>) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, sink));
        id
    }

    /// Remove a sink; calls already in flight still reach it
    pub fn remove(&self, id: SinkId) -> Option<Arc<dyn OutputSink>> {
        let mut sinks = self.lock();
        let index = sinks.iter().position(|(sink_id, _)| *sink_id == id)?;
        Some(sinks.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn forward_write(&self, buf: &[u8]) -> Result<(), MultiSinkError> {
        self.forward(Op::Write, |sink| sink.write(buf))
    }

    pub fn forward_flush(&self) -> Result<(), MultiSinkError> {
        self.forward(Op::Flush, |sink| sink.flush())
    }

    pub fn forward_close(&self) -> Result<(), MultiSinkError> {
        self.forward(Op::Close, |sink| sink.close())
    }

    fn forward(
        &self,
        op: Op,
        call: impl Fn(&dyn OutputSink) -> io::Result<()>,
    ) -> Result<(), MultiSinkError> {
        // Snapshot so sinks run without holding the registration lock
        let sinks: Vec<Arc<dyn OutputSink>> =
            self.lock().iter().map(|(_, sink)| Arc::clone(sink)).collect();

        let mut failures = Vec::new();
        for sink in sinks {
            if let Err(source) = call(sink.as_ref()) {
                tracing::warn!(
                    "{}: {} to sink '{}' failed: {}",
                    self.name,
                    op.as_str(),
                    sink.name(),
                    source
                );
                failures.push(SinkFailure {
                    label: format!(
                        "{} {} delegation to '{}' failed",
                        self.name,
                        op.as_str(),
                        sink.name()
                    ),
                    source,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MultiSinkError { failures })
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SinkId, Arc<dyn OutputSink>)>> {
        match self.sinks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OutputSink for MultiSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        self.forward_write(buf).map_err(Into::into)
    }

    fn flush(&self) -> io::Result<()> {
        self.forward_flush().map_err(Into::into)
    }

    fn close(&self) -> io::Result<()> {
        self.forward_close().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::sink::WriteSink;

    struct FailingSink;

    impl OutputSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn write(&self, _buf: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink is broken"))
        }

        fn flush(&self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink is broken"))
        }
    }

    fn collected(sink: &WriteSink<Vec<u8>>) -> Vec<u8> {
        sink.with_inner(|buf| buf.clone())
    }

    #[test]
    fn test_failing_sink_does_not_block_others() {
        let multi = MultiSink::new("stdout");
        let ok = Arc::new(WriteSink::new("ok", Vec::new()));
        let ok2 = Arc::new(WriteSink::new("ok2", Vec::new()));
        multi.add(ok.clone());
        multi.add(Arc::new(FailingSink));
        multi.add(ok2.clone());

        let err = multi.forward_write(b"payload").unwrap_err();

        assert_eq!(collected(&ok), b"payload");
        assert_eq!(collected(&ok2), b"payload");
        assert_eq!(err.causes().len(), 1);
        assert!(err.causes()[0].label.contains("write"));
        assert!(err.causes()[0].label.contains("failing"));
        assert_eq!(err.causes()[0].source.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_every_failure_is_reported() {
        let multi = MultiSink::new("stderr");
        multi.add(Arc::new(FailingSink));
        multi.add(Arc::new(FailingSink));

        let err = multi.forward_flush().unwrap_err();
        assert_eq!(err.causes().len(), 2);
        assert!(std::error::Error::source(&err).is_none());
        assert!(err.to_string().starts_with("2 sink delegation(s) failed"));
    }

    #[test]
    fn test_no_failure_no_error() {
        let multi = MultiSink::new("stdout");
        multi.add(Arc::new(WriteSink::new("ok", Vec::new())));
        assert!(multi.forward_write(b"x").is_ok());
        assert!(multi.forward_flush().is_ok());
        assert!(multi.forward_close().is_ok());
    }

    #[test]
    fn test_remove_keeps_order_of_survivors() {
        let multi = MultiSink::new("stdout");
        let order = Arc::new(WriteSink::new("order", Vec::new()));

        struct Tagged(&'static [u8], Arc<WriteSink<Vec<u8>>>);
        impl OutputSink for Tagged {
            fn name(&self) -> &str {
                "tagged"
            }
            fn write(&self, _buf: &[u8]) -> io::Result<()> {
                self.1.write(self.0)
            }
        }

        multi.add(Arc::new(Tagged(b"a", order.clone())));
        let b = multi.add(Arc::new(Tagged(b"b", order.clone())));
        multi.add(Arc::new(Tagged(b"c", order.clone())));

        multi.forward_write(b"").unwrap();
        assert!(multi.remove(b).is_some());
        assert!(multi.remove(b).is_none());
        multi.forward_write(b"").unwrap();

        assert_eq!(collected(&order), b"abcac");
        assert_eq!(multi.len(), 2);
    }

    #[test]
    fn test_aggregate_survives_io_error_conversion() {
        let multi = MultiSink::new("stdout");
        multi.add(Arc::new(FailingSink));

        let err = OutputSink::write(&multi, b"x").unwrap_err();
        let aggregate = MultiSinkError::from_io(&err).expect("aggregate error");
        assert_eq!(aggregate.causes().len(), 1);
    }
}
