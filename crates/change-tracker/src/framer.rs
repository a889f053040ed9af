//! Incremental JSON framing for change-feed bodies
//!
//! Two disciplines, picked by feed mode:
//! - `DocumentFramer`: whole body is one `{"results": [...], "last_seq": ...}`
//!   object, only parsed once the body is complete
//! - `StreamFramer`: continuous feed, each top-level value is emitted as soon
//!   as its closing bracket arrives, whatever the chunk boundaries

use changes_core::prelude::*;
use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

/// Output of one framing step
#[derive(Debug)]
pub enum Frame {
    /// A structurally complete top-level value
    Value(Value),
    /// Blank line, or whitespace-only chunk, from the server
    Heartbeat,
    /// A segment that could not be parsed; the stream continues after it
    Malformed(TrackerError),
}

/// Parsed whole-document body
#[derive(Debug, Deserialize)]
pub struct DocumentBody {
    pub results: Vec<Value>,
    #[serde(default)]
    pub last_seq: Option<Sequence>,
}

/// Framer for the current attempt
#[derive(Debug)]
pub enum Framer {
    Document(DocumentFramer),
    Stream(StreamFramer),
}

impl Framer {
    /// Pick the discipline for a feed mode
    pub fn for_mode(mode: FeedMode) -> Self {
        if mode.is_whole_document() {
            Self::Document(DocumentFramer::new())
        } else {
            Self::Stream(StreamFramer::new())
        }
    }

    /// Feed a chunk; returns whatever became complete
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        match self {
            Self::Document(framer) => framer.push(chunk).into_iter().collect(),
            Self::Stream(framer) => framer.push(chunk),
        }
    }

    /// Signal end of body
    ///
    /// Whole-document mode parses the body here. Streaming mode drops any
    /// incomplete trailing value and returns `None`.
    pub fn finish(&mut self) -> Result<Option<DocumentBody>> {
        match self {
            Self::Document(framer) => framer.finish().map(Some),
            Self::Stream(framer) => {
                let dropped = framer.buffered_len();
                if dropped > 0 {
                    trace!(bytes = dropped, "Discarding incomplete trailing value");
                }
                framer.clear();
                Ok(None)
            }
        }
    }

    /// Bytes held back waiting for more input
    pub fn buffered_len(&self) -> usize {
        match self {
            Self::Document(framer) => framer.buffer.len(),
            Self::Stream(framer) => framer.buffered_len(),
        }
    }
}

// ============================================================================
// Whole-document framing
// ============================================================================

/// Accumulates the full body of a one-shot or long-poll response
#[derive(Debug, Default)]
pub struct DocumentFramer {
    buffer: Vec<u8>,
}

impl DocumentFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a chunk. Reports a heartbeat while only whitespace has arrived.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Frame> {
        let before_body = self.buffer.iter().all(u8::is_ascii_whitespace);
        self.buffer.extend_from_slice(chunk);
        if before_body && !chunk.is_empty() && chunk.iter().all(u8::is_ascii_whitespace) {
            return Some(Frame::Heartbeat);
        }
        None
    }

    /// Parse the complete body
    pub fn finish(&mut self) -> Result<DocumentBody> {
        let buffer = std::mem::take(&mut self.buffer);
        if buffer.iter().all(u8::is_ascii_whitespace) {
            return Err(TrackerError::framing("empty response body"));
        }
        serde_json::from_slice::<DocumentBody>(&buffer).map_err(|e| {
            TrackerError::framing_with_source(
                format!("malformed changes body ({} bytes)", buffer.len()),
                e,
            )
        })
    }
}

// ============================================================================
// Streaming framing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Between values, skipping whitespace
    Between,
    /// Inside an object or array that started at `start`
    Value {
        start: usize,
        depth: usize,
        in_string: bool,
        escaped: bool,
    },
    /// Inside a segment that cannot be a value; skipped up to the newline
    Garbage { start: usize },
}

/// Splits a continuous feed into top-level values
///
/// Scanning resumes where the previous chunk left off, so each byte is
/// inspected once no matter how the stream is fragmented.
#[derive(Debug)]
pub struct StreamFramer {
    buffer: Vec<u8>,
    pos: usize,
    state: ScanState,
    line_has_content: bool,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            pos: 0,
            state: ScanState::Between,
            line_has_content: false,
        }
    }

    /// Feed a chunk; returns completed frames in stream order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while self.pos < self.buffer.len() {
            let byte = self.buffer[self.pos];
            match self.state {
                ScanState::Between => match byte {
                    b'\n' => {
                        if !self.line_has_content {
                            frames.push(Frame::Heartbeat);
                        }
                        self.line_has_content = false;
                    }
                    b' ' | b'\t' | b'\r' => {}
                    b'{' | b'[' => {
                        self.state = ScanState::Value {
                            start: self.pos,
                            depth: 1,
                            in_string: false,
                            escaped: false,
                        };
                        self.line_has_content = true;
                    }
                    _ => {
                        self.state = ScanState::Garbage { start: self.pos };
                        self.line_has_content = true;
                    }
                },
                ScanState::Value {
                    start,
                    depth,
                    in_string,
                    escaped,
                } => {
                    if in_string {
                        if byte == b'\n' {
                            // Raw newlines are never legal inside a JSON string
                            frames.push(Frame::Malformed(self.malformed(start, self.pos)));
                            self.state = ScanState::Between;
                            self.line_has_content = false;
                        } else {
                            let (in_string, escaped) = match (escaped, byte) {
                                (true, _) => (true, false),
                                (false, b'\\') => (true, true),
                                (false, b'"') => (false, false),
                                _ => (true, false),
                            };
                            self.state = ScanState::Value {
                                start,
                                depth,
                                in_string,
                                escaped,
                            };
                        }
                    } else {
                        match byte {
                            b'"' => {
                                self.state = ScanState::Value {
                                    start,
                                    depth,
                                    in_string: true,
                                    escaped: false,
                                };
                            }
                            b'{' | b'[' => {
                                self.state = ScanState::Value {
                                    start,
                                    depth: depth + 1,
                                    in_string: false,
                                    escaped: false,
                                };
                            }
                            b'}' | b']' if depth == 1 => {
                                frames.push(self.complete(start, self.pos + 1));
                                self.state = ScanState::Between;
                            }
                            b'}' | b']' => {
                                self.state = ScanState::Value {
                                    start,
                                    depth: depth - 1,
                                    in_string: false,
                                    escaped: false,
                                };
                            }
                            _ => {}
                        }
                    }
                }
                ScanState::Garbage { start } => {
                    if byte == b'\n' {
                        frames.push(Frame::Malformed(self.malformed(start, self.pos)));
                        self.state = ScanState::Between;
                        self.line_has_content = false;
                    }
                }
            }
            self.pos += 1;
        }

        self.compact();
        frames
    }

    /// Bytes of an incomplete value still buffered
    pub fn buffered_len(&self) -> usize {
        match self.state {
            ScanState::Between => 0,
            ScanState::Value { start, .. } | ScanState::Garbage { start } => {
                self.buffer.len() - start
            }
        }
    }

    /// Drop everything, including a partial value
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pos = 0;
        self.state = ScanState::Between;
        self.line_has_content = false;
    }

    fn complete(&self, start: usize, end: usize) -> Frame {
        match serde_json::from_slice::<Value>(&self.buffer[start..end]) {
            Ok(value) => Frame::Value(value),
            Err(e) => Frame::Malformed(TrackerError::framing_with_source(
                format!("malformed feed line: {}", self.excerpt(start, end)),
                e,
            )),
        }
    }

    fn malformed(&self, start: usize, end: usize) -> TrackerError {
        TrackerError::framing(format!(
            "malformed feed line: {}",
            self.excerpt(start, end)
        ))
    }

    fn excerpt(&self, start: usize, end: usize) -> String {
        const MAX: usize = 120;
        let end = end.min(start + MAX);
        String::from_utf8_lossy(&self.buffer[start..end])
            .trim_end()
            .to_string()
    }

    /// Drop bytes that no pending value refers to
    fn compact(&mut self) {
        let keep_from = match self.state {
            ScanState::Between => self.pos,
            ScanState::Value { start, .. } | ScanState::Garbage { start } => start,
        };
        if keep_from == 0 {
            return;
        }
        self.buffer.drain(..keep_from);
        self.pos -= keep_from;
        self.state = match self.state {
            ScanState::Between => ScanState::Between,
            ScanState::Value {
                start,
                depth,
                in_string,
                escaped,
            } => ScanState::Value {
                start: start - keep_from,
                depth,
                in_string,
                escaped,
            },
            ScanState::Garbage { start } => ScanState::Garbage {
                start: start - keep_from,
            },
        };
    }
}
