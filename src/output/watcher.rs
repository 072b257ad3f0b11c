//! Streaming literal matcher over live process output
//!
//! Bytes are decoded incrementally with a stateful decoder (malformed input
//! is replaced, never rejected), line endings are normalized to `\n` on
//! both the target and the stream, and the target is located with a
//! Knuth-Morris-Pratt automaton so input is never re-scanned. A `\r\n`
//! pair split across two writes is handled by carrying a pending-CR flag.

use super::sink::OutputSink;
use crate::process::error::ProcessError;
use encoding_rs::{CoderResult, Decoder, Encoding};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

const DECODE_WINDOW: usize = 4096;

/// Decides what to look for after a match. Receives the literal that just
/// matched; `None` ends the watch.
pub type NextLiteral = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// Sink that reports when a literal appears in the output.
///
/// Built with [`LiteralWatcher::once`] it fires exactly once and ignores
/// everything afterwards. Built with [`LiteralWatcher::chained`] a
/// callback picks the next literal after every match.
pub struct LiteralWatcher {
    state: Mutex<MatchState>,
    done: AtomicBool,
    matches: AtomicUsize,
    notify: Notify,
}

struct MatchState {
    decoder: Decoder,
    text: String,
    literal: String,
    kmp: Kmp,
    pending_cr: bool,
    next: Option<NextLiteral>,
    finished: bool,
    closed: bool,
    matched_now: usize,
}

impl LiteralWatcher {
    /// Watch for a single occurrence of `literal`
    pub fn once(literal: &str, encoding: &'static Encoding) -> Result<Self, ProcessError> {
        Self::build(literal, None, encoding)
    }

    /// Watch for `literal`, then for whatever `next` returns after each match
    pub fn chained(
        literal: &str,
        next: NextLiteral,
        encoding: &'static Encoding,
    ) -> Result<Self, ProcessError> {
        Self::build(literal, Some(next), encoding)
    }

    fn build(
        literal: &str,
        next: Option<NextLiteral>,
        encoding: &'static Encoding,
    ) -> Result<Self, ProcessError> {
        if literal.is_empty() {
            return Err(ProcessError::Config(
                "literal to watch for must not be empty".to_string(),
            ));
        }
        let literal = normalize_newlines(literal);
        Ok(Self {
            state: Mutex::new(MatchState {
                decoder: encoding.new_decoder_without_bom_handling(),
                text: String::with_capacity(DECODE_WINDOW),
                kmp: Kmp::new(&literal),
                literal,
                pending_cr: false,
                next,
                finished: false,
                closed: false,
                matched_now: 0,
            }),
            done: AtomicBool::new(false),
            matches: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    /// True once the watch has ended (one-shot match, or the chain returned `None`)
    pub fn has_seen(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Total number of matches so far
    pub fn match_count(&self) -> usize {
        self.matches.load(Ordering::Acquire)
    }

    /// The literal currently being searched for (normalized)
    pub fn literal(&self) -> String {
        self.lock().literal.clone()
    }

    /// Resolve once the watch has ended
    pub async fn seen(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_seen() {
                return;
            }
            notified.await;
        }
    }

    /// Feed `len` bytes of `buf` starting at `offset`
    pub fn write_range(&self, buf: &[u8], offset: usize, len: usize) -> io::Result<()> {
        let end = offset.checked_add(len).filter(|end| *end <= buf.len());
        let Some(end) = end else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {}+{} out of bounds for buffer of {} bytes",
                    offset,
                    len,
                    buf.len()
                ),
            ));
        };
        self.feed(&buf[offset..end], false);
        Ok(())
    }

    fn feed(&self, bytes: &[u8], last: bool) {
        if self.has_seen() {
            return;
        }
        let (matched, finished) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            for window in bytes.chunks(DECODE_WINDOW) {
                if state.finished {
                    break;
                }
                state.decode_and_scan(window, false);
            }
            if last {
                if !state.finished {
                    state.decode_and_scan(&[], true);
                }
                if state.pending_cr && !state.finished {
                    state.pending_cr = false;
                    state.accept('\n');
                }
                state.closed = true;
            }
            (std::mem::take(&mut state.matched_now), state.finished)
        };

        if matched > 0 {
            self.matches.fetch_add(matched, Ordering::AcqRel);
        }
        if finished {
            self.done.store(true, Ordering::Release);
        }
        if matched > 0 || finished {
            self.notify.notify_waiters();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MatchState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OutputSink for LiteralWatcher {
    fn name(&self) -> &str {
        "literal-watcher"
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        self.feed(buf, false);
        Ok(())
    }

    /// Flushes the decoder and resolves a trailing lone `\r` as a newline
    fn close(&self) -> io::Result<()> {
        self.feed(&[], true);
        Ok(())
    }
}

impl MatchState {
    fn decode_and_scan(&mut self, mut src: &[u8], last: bool) {
        let mut text = std::mem::take(&mut self.text);
        text.clear();
        loop {
            let needed = self
                .decoder
                .max_utf8_buffer_length(src.len())
                .unwrap_or(DECODE_WINDOW * 4);
            text.reserve(needed);
            let (result, read, _replaced) = self.decoder.decode_to_string(src, &mut text, last);
            src = &src[read..];
            if let CoderResult::InputEmpty = result {
                break;
            }
        }
        self.scan(&text);
        self.text = text;
    }

    fn scan(&mut self, text: &str) {
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if self.finished {
                return;
            }
            if self.pending_cr {
                self.pending_cr = false;
                self.accept('\n');
                if c == '\n' || self.finished {
                    continue;
                }
            }
            if c == '\r' {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                    self.accept('\n');
                } else {
                    self.pending_cr = true;
                }
                continue;
            }
            self.accept(c);
        }
    }

    fn accept(&mut self, c: char) {
        if self.finished || !self.kmp.accept(c) {
            return;
        }
        self.matched_now += 1;
        tracing::debug!("literal {:?} seen in process output", self.literal);

        let Some(next) = self.next.as_mut() else {
            self.finished = true;
            return;
        };
        match next(&self.literal).map(|lit| normalize_newlines(&lit)) {
            None => self.finished = true,
            Some(lit) if lit.is_empty() => {
                tracing::warn!("empty follow-up literal, ending watch");
                self.finished = true;
            }
            Some(lit) if lit == self.literal => self.kmp.reset(),
            Some(lit) => {
                self.kmp = Kmp::new(&lit);
                self.literal = lit;
            }
        }
    }
}

fn normalize_newlines(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Knuth-Morris-Pratt automaton fed one character at a time
struct Kmp {
    pattern: Vec<char>,
    lps: Vec<usize>,
    cursor: usize,
}

impl Kmp {
    fn new(pattern: &str) -> Self {
        let pattern: Vec<char> = pattern.chars().collect();
        let lps = build_lps(&pattern);
        Self {
            pattern,
            lps,
            cursor: 0,
        }
    }

    /// Returns true when the character completes a match
    fn accept(&mut self, c: char) -> bool {
        while self.cursor > 0 && c != self.pattern[self.cursor] {
            self.cursor = self.lps[self.cursor - 1];
        }
        if c == self.pattern[self.cursor] {
            self.cursor += 1;
            if self.cursor == self.pattern.len() {
                self.cursor = self.lps[self.cursor - 1];
                return true;
            }
        }
        false
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Longest proper prefix that is also a suffix, per pattern position
fn build_lps(pattern: &[char]) -> Vec<usize> {
    let mut lps = vec![0; pattern.len()];
    let mut len = 0;
    for i in 1..pattern.len() {
        while len > 0 && pattern[i] != pattern[len] {
            len = lps[len - 1];
        }
        if pattern[i] == pattern[len] {
            len += 1;
        }
        lps[i] = len;
    }
    lps
}
