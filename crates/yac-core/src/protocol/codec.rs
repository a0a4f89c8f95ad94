//! Line codecs.
//!
//! A codec turns one line of text into one item. Decoding never fails the
//! stream: anything that does not parse comes back as a [`DecodeFailure`] with
//! the raw text so the transport can decide what to do with it.

use super::Frame;
use serde_json::Value;
use thiserror::Error;

/// A line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("undecodable line ({reason}): {raw}")]
pub struct DecodeFailure {
    pub raw: String,
    pub reason: String,
}

impl DecodeFailure {
    pub fn new(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("payload is not a valid {kind} payload: {source}")]
    Payload {
        kind: String,
        source: serde_json::Error,
    },
}

/// Decodes single lines into items.
pub trait LineCodec: Send + Sync + 'static {
    type Item: Send + 'static;

    fn decode(&self, line: &str) -> Result<Self::Item, DecodeFailure>;
}

/// Codec for protocol [`Frame`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl LineCodec for FrameCodec {
    type Item = Frame;

    fn decode(&self, line: &str) -> Result<Frame, DecodeFailure> {
        decode(line)
    }
}

/// Codec for arbitrary JSON objects, used for JSON-RPC tool servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl LineCodec for JsonCodec {
    type Item = Value;

    fn decode(&self, line: &str) -> Result<Value, DecodeFailure> {
        let trimmed = line.trim_end_matches('\r');
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.is_object() => Ok(value),
            Ok(_) => Err(DecodeFailure::new(trimmed, "not a JSON object")),
            Err(e) => Err(DecodeFailure::new(trimmed, e.to_string())),
        }
    }
}

/// Encode a frame as a single line, without the trailing newline.
///
/// serde_json escapes control characters inside strings, so the output never
/// contains a raw line break.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode one line into a frame.
pub fn decode(line: &str) -> Result<Frame, DecodeFailure> {
    let trimmed = line.trim_end_matches('\r');
    if !trimmed.trim_start().starts_with('{') {
        return Err(DecodeFailure::new(trimmed, "not a JSON object"));
    }
    serde_json::from_str(trimmed).map_err(|e| DecodeFailure::new(trimmed, e.to_string()))
}

/// Accumulates raw bytes and yields complete lines.
///
/// Reads from a pipe can split a line anywhere, including inside a multi-byte
/// character, so bytes are buffered until a `\n` arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed, without terminators.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..end]);
            lines.push(line.trim_end_matches('\r').to_string());
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Take whatever is left once the stream has ended.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(
            String::from_utf8_lossy(&rest)
                .trim_end_matches('\r')
                .to_string(),
        )
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
