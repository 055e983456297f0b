//! Incremental Server-Sent Events parsing over a reqwest byte stream.

use bytes::Bytes;
use futures_util::StreamExt;

use crate::error::AnthropicError;

/// One parsed SSE event.
///
/// SSE format:
/// event: <type>
/// data: <line1>
/// data: <line2>
/// id: <id>
/// <blank line>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Extract the next complete event from `buffer`, draining the consumed
/// bytes. Returns `None` while the event at the head is still incomplete.
/// Comment lines (`:`-prefixed) and events with no data are skipped by the
/// caller looping on this function.
pub fn parse_sse_event(buffer: &mut Vec<u8>) -> Option<SseEvent> {
    // Event boundary is a blank line; LF and CRLF streams both occur, so
    // take whichever boundary comes first.
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    let (pos, sep_len) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };

    let event_bytes: Vec<u8> = buffer.drain(..pos + sep_len).collect();
    let event_text = String::from_utf8_lossy(&event_bytes);

    let mut event = None;
    let mut data_lines = Vec::new();
    let mut id = None;

    for line in event_text.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            id = Some(value.trim().to_string());
        }
        // Comment lines starting with ':' are ignored.
    }

    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
        id,
    })
}

/// Pull-based SSE reader over an HTTP response body.
pub struct SseEventStream {
    inner: futures_util::stream::BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    done: bool,
}

impl SseEventStream {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            inner: response.bytes_stream().boxed(),
            buffer: Vec::new(),
            done: false,
        }
    }

    /// Next event with a non-empty data field, or `None` at end of stream.
    pub async fn next_event(&mut self) -> Result<Option<SseEvent>, AnthropicError> {
        loop {
            while let Some(event) = parse_sse_event(&mut self.buffer) {
                if !event.data.is_empty() {
                    return Ok(Some(event));
                }
            }
            if self.done {
                return Ok(None);
            }
            match self.inner.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.done = true,
            }
        }
    }
}
