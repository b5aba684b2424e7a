//! Incremental parsing of the streaming chat channel.
//!
//! Network chunks arrive on arbitrary boundaries, both between lines and in
//! the middle of multi-byte UTF-8 sequences. [`Utf8Decoder`] turns bytes into
//! text without splitting characters, [`extract_lines`] / [`LineBuffer`] turn
//! text into complete lines, and [`frame::decode_frame`] turns a line into a
//! JSON frame (or nothing).

pub mod client;
pub mod frame;
pub mod relay;

pub use frame::{ChatEvent, decode_frame};

/// Line terminator of the wire protocol.
const LINE_TERMINATOR: char = '\n';

/// Split `current_tail + new_chunk` into complete lines plus the new tail.
///
/// Every segment except the last was followed by a terminator and is returned
/// in order. The last segment (possibly empty) is not known to be terminated
/// yet and comes back as the tail, to be passed in on the next call.
pub fn extract_lines(current_tail: &str, new_chunk: &str) -> (Vec<String>, String) {
    let mut combined = String::with_capacity(current_tail.len() + new_chunk.len());
    combined.push_str(current_tail);
    combined.push_str(new_chunk);

    let mut segments: Vec<String> = combined
        .split(LINE_TERMINATOR)
        .map(ToString::to_string)
        .collect();
    let tail = segments.pop().unwrap_or_default();
    (segments, tail)
}

/// Per-connection line buffer.
///
/// Holds the unterminated tail between feeds. Create one per stream; call
/// [`LineBuffer::finish`] when the stream ends so nothing leaks into the next.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line, leaving any partial line
    /// buffered.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        let (lines, tail) = extract_lines(&self.pending, chunk);
        self.pending = tail;
        lines
    }

    /// The unterminated tail currently held.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// End of stream: drop the unterminated tail and return it, if any.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.pending);
        (!tail.is_empty()).then_some(tail)
    }
}

/// Streaming UTF-8 decoder.
///
/// Incomplete sequences at the end of a chunk are held until the next chunk
/// completes them. Invalid bytes decode as U+FFFD.
#[derive(Debug, Default, Clone)]
pub struct Utf8Decoder {
    partial: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.partial.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.partial) {
                Ok(text) => {
                    out.push_str(text);
                    self.partial.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.partial[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.partial.drain(..valid + len);
                        }
                        None => {
                            // Sequence cut off by the chunk boundary.
                            self.partial.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is still held. A dangling partial sequence decodes as
    /// U+FFFD.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        out
    }
}
