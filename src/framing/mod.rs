//! Byte stream → protocol frames.
//!
//! A [`FrameReassembler`] owns the accumulation buffer for one open stream.
//! Chunks may carry zero, one or many frames and a frame may span many
//! chunks (including a chunk that splits the boundary marker itself); the
//! emitted frame sequence depends only on the bytes, never on how they were
//! chunked.

mod concatenated;
mod event_stream;

pub use concatenated::ObjectSplit;

use concatenated::ObjectSplitter;
use event_stream::EventStreamSplitter;

/// The terminal payload of delimited-event streams.
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Data {
        /// SSE `event:` field, when the backend sends one.
        event: Option<String>,
        payload: String,
    },
    /// `[DONE]`; recognized, never parsed.
    Terminal,
}

impl RawFrame {
    pub fn data(payload: impl Into<String>) -> Self {
        RawFrame::Data {
            event: None,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Blocks separated by a blank line, payload lines prefixed `data: `.
    EventStream,
    /// Back-to-back JSON objects with no outer array or delimiter.
    Concatenated(ObjectSplit),
}

#[derive(Debug)]
enum Splitter {
    EventStream(EventStreamSplitter),
    Concatenated(ObjectSplitter),
}

#[derive(Debug)]
pub struct FrameReassembler {
    buf: Vec<u8>,
    splitter: Splitter,
}

impl FrameReassembler {
    pub fn new(framing: Framing) -> Self {
        let splitter = match framing {
            Framing::EventStream => Splitter::EventStream(EventStreamSplitter::default()),
            Framing::Concatenated(strategy) => Splitter::Concatenated(ObjectSplitter::new(strategy)),
        };
        Self {
            buf: Vec::new(),
            splitter,
        }
    }

    /// Append a chunk and return every frame it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            let next = match &mut self.splitter {
                Splitter::EventStream(s) => s.next_block(&mut self.buf),
                Splitter::Concatenated(s) => s.next_object(&mut self.buf),
            };
            let Some(bytes) = next else { break };
            if let Some(frame) = self.to_frame(&bytes) {
                out.push(frame);
            }
        }
        out
    }

    /// End of stream: whatever is left is treated as one final frame.
    pub fn finish(&mut self) -> Vec<RawFrame> {
        let rest = std::mem::take(&mut self.buf);
        match &mut self.splitter {
            Splitter::EventStream(s) => s.reset(),
            Splitter::Concatenated(s) => s.reset(),
        }
        if rest.iter().all(u8::is_ascii_whitespace) {
            return Vec::new();
        }
        self.to_frame(&rest).into_iter().collect()
    }

    /// Bytes received but not yet emitted as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn to_frame(&self, bytes: &[u8]) -> Option<RawFrame> {
        let text = match std::str::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, len = bytes.len(), "skipping frame that is not valid UTF-8");
                return None;
            }
        };
        match &self.splitter {
            Splitter::EventStream(_) => event_stream::parse_block(text),
            Splitter::Concatenated(_) => {
                let payload = text.trim();
                (!payload.is_empty()).then(|| RawFrame::data(payload))
            }
        }
    }
}
