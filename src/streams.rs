//! What happens to bytes once they leave a pipe: capture, forwarding to a
//! caller callback, trimming, and splitting into lines.

use tracing::trace;

use crate::logging::OUTPUT_TARGET;
use crate::pipe::PipeRole;

/// Receiver of incrementally read bytes. Returning `false` stops the
/// whole execution.
pub trait StreamSink {
    fn accept(&mut self, data: &[u8]) -> bool;
}

impl<F> StreamSink for F
where
    F: FnMut(&[u8]) -> bool,
{
    fn accept(&mut self, data: &[u8]) -> bool {
        self(data)
    }
}

/// Default sink for stdout/stderr.
///
/// Without a callback the bytes are kept for the result. With one they are
/// handed to it and not retained.
pub struct OutputCollector<'a> {
    role: PipeRole,
    captured: Vec<u8>,
    forward: Option<&'a mut dyn FnMut(&[u8]) -> bool>,
}

impl<'a> OutputCollector<'a> {
    pub fn new(role: PipeRole, forward: Option<&'a mut dyn FnMut(&[u8]) -> bool>) -> Self {
        Self {
            role,
            captured: Vec::new(),
            forward,
        }
    }

    pub fn finish(self, trim: bool) -> Vec<u8> {
        let mut captured = self.captured;
        if trim {
            trim_trailing_whitespace(&mut captured);
        }
        captured
    }
}

impl StreamSink for OutputCollector<'_> {
    fn accept(&mut self, data: &[u8]) -> bool {
        trace!(
            target: OUTPUT_TARGET,
            stream = %self.role,
            bytes = data.len(),
            "{}",
            String::from_utf8_lossy(data)
        );
        match self.forward.as_mut() {
            Some(callback) => (*callback)(data),
            None => {
                self.captured.extend_from_slice(data);
                true
            }
        }
    }
}

pub fn trim_trailing_whitespace(buf: &mut Vec<u8>) {
    while buf.last().is_some_and(u8::is_ascii_whitespace) {
        buf.pop();
    }
}

/// Reassembles chunks into lines for a `FnMut(&str) -> bool` callback.
///
/// `\n` and `\r\n` terminators are removed; invalid UTF-8 is replaced.
pub struct LineSplitter<F> {
    pending: Vec<u8>,
    callback: F,
}

impl<F> LineSplitter<F>
where
    F: FnMut(&str) -> bool,
{
    pub fn new(callback: F) -> Self {
        Self {
            pending: Vec::new(),
            callback,
        }
    }

    /// Deliver whatever trailing partial line is left.
    pub fn finish(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        let line = std::mem::take(&mut self.pending);
        self.emit(&line)
    }

    fn emit(&mut self, line: &[u8]) -> bool {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        (self.callback)(&String::from_utf8_lossy(line))
    }
}

impl<F> StreamSink for LineSplitter<F>
where
    F: FnMut(&str) -> bool,
{
    fn accept(&mut self, data: &[u8]) -> bool {
        self.pending.extend_from_slice(data);
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = self.pending[start..end].to_vec();
            start = end + 1;
            if !self.emit(&line) {
                self.pending.drain(..start);
                return false;
            }
        }
        self.pending.drain(..start);
        true
    }
}
