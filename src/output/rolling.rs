//! Bounded buffer of the most recent console lines

use super::lines::LineSplitter;
use super::sink::OutputSink;
use encoding_rs::Encoding;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

/// Fixed-capacity FIFO of recent lines; the oldest line is dropped silently
/// once the buffer is full.
#[derive(Debug)]
pub struct RollingBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Retained lines joined by `\n`, oldest first
    pub fn snapshot(&self) -> String {
        let lines = self.lock();
        let mut out = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines.iter() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Sink that splits one process stream into lines and appends them to a
/// shared [`RollingBuffer`].
pub struct RollingLogSink {
    name: String,
    splitter: Mutex<LineSplitter>,
    buffer: Arc<RollingBuffer>,
}

impl RollingLogSink {
    pub fn new(
        name: impl Into<String>,
        buffer: Arc<RollingBuffer>,
        encoding: &'static Encoding,
    ) -> Self {
        Self {
            name: name.into(),
            splitter: Mutex::new(LineSplitter::new(encoding)),
            buffer,
        }
    }

    fn splitter(&self) -> std::sync::MutexGuard<'_, LineSplitter> {
        match self.splitter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OutputSink for RollingLogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        self.splitter().push(buf, |line| self.buffer.push(line));
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.splitter().finish(|line| self.buffer.push(line));
        Ok(())
    }
}
