//! Typed view of the Messages API streaming events.

use serde::Deserialize;
use serde_json::Value;

use crate::error::AnthropicError;
use crate::sse::SseEventStream;
use crate::types::Usage;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStartBody,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiErrorBody,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageStartBody {
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockStart {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl StreamEvent {
    /// Parse one SSE data payload. Unknown event types are skipped rather
    /// than failed so new upstream events never break the relay.
    pub fn parse(data: &str) -> Result<Option<StreamEvent>, AnthropicError> {
        let value: Value =
            serde_json::from_str(data).map_err(|e| AnthropicError::Parse(e.to_string()))?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "message_start" | "content_block_start" | "content_block_delta"
            | "content_block_stop" | "message_delta" | "message_stop" | "ping" | "error" => {
                serde_json::from_value(value)
                    .map(Some)
                    .map_err(|e| AnthropicError::Parse(e.to_string()))
            }
            _ => Ok(None),
        }
    }
}

/// Streaming response handle: pulls SSE events and yields typed ones.
pub struct MessageStream {
    events: SseEventStream,
}

impl MessageStream {
    pub(crate) fn new(events: SseEventStream) -> Self {
        Self { events }
    }

    /// Next typed event, or `None` once the upstream closes the stream.
    /// Dropping the handle aborts the underlying request.
    pub async fn next(&mut self) -> Result<Option<StreamEvent>, AnthropicError> {
        loop {
            let Some(event) = self.events.next_event().await? else {
                return Ok(None);
            };
            match StreamEvent::parse(&event.data)? {
                Some(typed) => return Ok(Some(typed)),
                None => continue,
            }
        }
    }
}
