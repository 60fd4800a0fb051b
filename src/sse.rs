//! Server-Sent Events decoding shared by the streaming adapters.
//!
//! The wire contract every backend speaks:
//!
//! ```text
//! data: {"delta": "..."}
//!
//! data: [DONE]
//! ```
//!
//! Lines are CRLF- or LF-terminated. Anything not starting with `data: ` is
//! ignored; an empty payload or the literal `[DONE]` terminates the stream.

use bytes::BytesMut;
use futures::stream::{Stream, StreamExt};

use crate::error::Error;

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";

/// Extract the payload of an SSE data line.
///
/// # Example
/// ```
/// use ensemble::sse::parse_data_line;
///
/// assert_eq!(parse_data_line("data: {\"k\": 1}"), Some("{\"k\": 1}"));
/// assert_eq!(parse_data_line(": keep-alive"), None);
/// assert_eq!(parse_data_line("event: ping"), None);
/// ```
pub fn parse_data_line(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_PREFIX).map(|s| s.trim())
}

/// Whether a payload is the end-of-stream sentinel.
///
/// # Example
/// ```
/// use ensemble::sse::is_done_marker;
///
/// assert!(is_done_marker("[DONE]"));
/// assert!(!is_done_marker("{\"delta\": \"hi\"}"));
/// ```
pub fn is_done_marker(payload: &str) -> bool {
    payload == DONE_MARKER
}

/// A decoded SSE occurrence.
#[derive(Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload.
    Data(String),
    /// The `[DONE]` sentinel or an empty data payload.
    Done,
}

/// Incremental decoder over an SSE byte feed. Feed raw chunks with
/// [`push`](SseDecoder::push), then drain complete events with
/// [`next_event`](SseDecoder::next_event).
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// The next complete event, or `None` until more bytes arrive.
    pub fn next_event(&mut self) -> Option<SseEvent> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw = self.buffer.split_to(pos + 1);
            if let Some(event) = Self::decode_line(&raw) {
                return Some(event);
            }
        }
        None
    }

    /// Decode whatever unterminated line remains after the feed ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = self.buffer.split_to(self.buffer.len());
        Self::decode_line(&raw)
    }

    fn decode_line(raw: &[u8]) -> Option<SseEvent> {
        let line = std::str::from_utf8(raw).ok()?.trim_end_matches(['\n', '\r']);
        let payload = parse_data_line(line.trim())?;
        if payload.is_empty() || is_done_marker(payload) {
            Some(SseEvent::Done)
        } else {
            Some(SseEvent::Data(payload.to_string()))
        }
    }
}

/// Extension turning a `reqwest::Response` into a stream of SSE payloads.
pub trait SseResponseExt {
    /// Stream of decoded `data:` payloads. Ends at `[DONE]`, an empty data
    /// payload, or the end of the byte feed.
    fn sse(self) -> impl Stream<Item = Result<String, Error>> + Send;
}

impl SseResponseExt for reqwest::Response {
    fn sse(self) -> impl Stream<Item = Result<String, Error>> + Send {
        let mut bytes = Box::pin(self.bytes_stream());

        async_stream::try_stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                decoder.push(&chunk);
                while let Some(event) = decoder.next_event() {
                    match event {
                        SseEvent::Done => return,
                        SseEvent::Data(payload) => yield payload,
                    }
                }
            }
            if let Some(SseEvent::Data(payload)) = decoder.finish() {
                yield payload;
            }
        }
    }
}
