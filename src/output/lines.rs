//! Splits a raw byte stream into decoded text lines

use encoding_rs::Encoding;

/// Accumulates bytes and yields complete lines.
///
/// `\n`, `\r\n` and a lone `\r` all terminate a line. The terminator is
/// not part of the yielded line. Bytes are decoded with the configured
/// encoding once a line is complete, so multi-byte sequences split across
/// writes are reassembled before decoding.
pub struct LineSplitter {
    encoding: &'static Encoding,
    buffer: Vec<u8>,
    skip_lf: bool,
}

impl LineSplitter {
    pub fn new(encoding: &'static Encoding) -> Self {
        Self {
            encoding,
            buffer: Vec::with_capacity(256),
            skip_lf: false,
        }
    }

    /// Feed a chunk, invoking `on_line` for every line it completes
    pub fn push(&mut self, chunk: &[u8], mut on_line: impl FnMut(String)) {
        for &byte in chunk {
            match byte {
                b'\n' if self.skip_lf => {
                    self.skip_lf = false;
                }
                b'\n' | b'\r' => {
                    self.skip_lf = byte == b'\r';
                    on_line(self.take_line());
                }
                _ => {
                    self.skip_lf = false;
                    self.buffer.push(byte);
                }
            }
        }
    }

    /// Emit whatever is left after the stream ended
    pub fn finish(&mut self, mut on_line: impl FnMut(String)) {
        self.skip_lf = false;
        if !self.buffer.is_empty() {
            on_line(self.take_line());
        }
    }

    fn take_line(&mut self) -> String {
        let (text, _) = self.encoding.decode_without_bom_handling(&self.buffer);
        let line = text.into_owned();
        self.buffer.clear();
        line
    }
}
