//! OpenAI-compatible wire types and the SSE chunk envelope.
//!
//! Request and response structures mirror the OpenAI chat-completion
//! shapes; content is simplified to a string (multimodal arrays are out of
//! scope for CLI workers).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::Priority;

/// Canonical model families the gateway understands. Raw model ids are
/// mapped onto a family by substring, so `claude-code/opus`,
/// `claude-3-opus` and plain `opus` all resolve the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Opus,
    Sonnet,
    Haiku,
}

impl ModelFamily {
    pub fn all() -> [ModelFamily; 3] {
        [ModelFamily::Opus, ModelFamily::Sonnet, ModelFamily::Haiku]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Opus => "opus",
            ModelFamily::Sonnet => "sonnet",
            ModelFamily::Haiku => "haiku",
        }
    }

    /// Model id advertised on `/v1/models`.
    pub fn public_id(&self) -> String {
        format!("claude-code/{}", self.as_str())
    }

    /// Concrete model id used on the direct Anthropic path.
    pub fn api_model_id(&self) -> &'static str {
        match self {
            ModelFamily::Opus => "claude-opus-4-1",
            ModelFamily::Sonnet => "claude-sonnet-4-5",
            ModelFamily::Haiku => "claude-3-5-haiku-latest",
        }
    }

    pub fn resolve(raw: Option<&str>) -> ModelFamily {
        let Some(raw) = raw else {
            return ModelFamily::Sonnet;
        };
        let lower = raw.to_lowercase();
        if lower.contains("opus") {
            ModelFamily::Opus
        } else if lower.contains("haiku") {
            ModelFamily::Haiku
        } else {
            ModelFamily::Sonnet
        }
    }

    /// Opus requests are high priority, sonnet normal, haiku low.
    pub fn priority(&self) -> Priority {
        match self {
            ModelFamily::Opus => Priority::High,
            ModelFamily::Sonnet => Priority::Normal,
            ModelFamily::Haiku => Priority::Low,
        }
    }
}

// --- Request structures (mirroring OpenAI) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ChatRequest {
    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    // Simplified: OpenAI allows an array for multimodal content.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON string arguments.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub type_: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    String(String),
    Object(ToolChoiceObject),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceObject {
    #[serde(rename = "type")]
    pub type_: String,
    pub function: ToolChoiceFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

// --- Response structures ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl CompletionUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

// --- Streaming chunk envelope ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Terminal SSE payload every stream ends with.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Builds the chunk envelope for one request: stable id, model name and
/// created timestamp across every chunk of the stream.
#[derive(Debug, Clone)]
pub struct ChunkFactory {
    id: String,
    model: String,
    created: i64,
}

impl ChunkFactory {
    pub fn new(request_id: &str, model: &str) -> Self {
        Self {
            id: request_id.to_string(),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatChunk {
        ChatChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    pub fn content(&self, text: impl Into<String>) -> ChatChunk {
        self.chunk(
            Delta {
                content: Some(text.into()),
                ..Delta::default()
            },
            None,
        )
    }

    pub fn tool_call_start(&self, index: u32, id: &str, name: &str) -> ChatChunk {
        self.chunk(
            Delta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id: Some(id.to_string()),
                    type_: Some("function".to_string()),
                    function: FunctionDelta {
                        name: Some(name.to_string()),
                        arguments: None,
                    },
                }]),
                ..Delta::default()
            },
            None,
        )
    }

    pub fn tool_call_arguments(&self, index: u32, arguments: &str) -> ChatChunk {
        self.chunk(
            Delta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id: None,
                    type_: None,
                    function: FunctionDelta {
                        name: None,
                        arguments: Some(arguments.to_string()),
                    },
                }]),
                ..Delta::default()
            },
            None,
        )
    }

    pub fn finish(&self, reason: &str) -> ChatChunk {
        self.chunk(Delta::default(), Some(reason.to_string()))
    }
}

/// Non-streaming error envelope: `{"error":{"message","type"}}`.
pub fn error_body(message: &str, error_type: &str) -> Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": error_type,
        }
    })
}

/// One-shot completion response for the sync paths.
pub fn build_response(
    request_id: &str,
    model: &str,
    message: ChatMessage,
    finish_reason: &str,
    usage: CompletionUsage,
) -> ChatResponse {
    ChatResponse {
        id: request_id.to_string(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason: Some(finish_reason.to_string()),
        }],
        usage: Some(usage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_aliases_resolve_by_substring() {
        assert_eq!(
            ModelFamily::resolve(Some("claude-code/opus")),
            ModelFamily::Opus
        );
        assert_eq!(
            ModelFamily::resolve(Some("claude-3-5-haiku-20241022")),
            ModelFamily::Haiku
        );
        assert_eq!(ModelFamily::resolve(Some("gpt-4o")), ModelFamily::Sonnet);
        assert_eq!(ModelFamily::resolve(None), ModelFamily::Sonnet);
    }

    #[test]
    fn priority_follows_model_family() {
        assert_eq!(ModelFamily::Opus.priority(), Priority::High);
        assert_eq!(ModelFamily::Sonnet.priority(), Priority::Normal);
        assert_eq!(ModelFamily::Haiku.priority(), Priority::Low);
    }

    #[test]
    fn content_chunk_serializes_to_openai_envelope() {
        let factory = ChunkFactory::new("chatcmpl-1", "claude-code/sonnet");
        let value = serde_json::to_value(factory.content("hi")).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"]["content"], "hi");
        assert_eq!(value["choices"][0]["finish_reason"], Value::Null);
        assert!(value["choices"][0]["delta"].get("tool_calls").is_none());
    }

    #[test]
    fn finish_chunk_carries_reason_and_empty_delta() {
        let factory = ChunkFactory::new("chatcmpl-1", "m");
        let value = serde_json::to_value(factory.finish("stop")).unwrap();
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["choices"][0]["delta"], serde_json::json!({}));
    }

    #[test]
    fn tool_call_chunks_follow_the_delta_shape() {
        let factory = ChunkFactory::new("chatcmpl-1", "m");
        let start = serde_json::to_value(factory.tool_call_start(0, "call_1", "lookup")).unwrap();
        assert_eq!(start["choices"][0]["delta"]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            start["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
            "lookup"
        );
        let args = serde_json::to_value(factory.tool_call_arguments(0, "{\"q\":")).unwrap();
        assert_eq!(
            args["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            "{\"q\":"
        );
        assert!(args["choices"][0]["delta"]["tool_calls"][0]
            .get("id")
            .is_none());
    }

    #[test]
    fn tool_choice_accepts_both_wire_shapes() {
        let auto: ToolChoice = serde_json::from_str("\"auto\"").unwrap();
        assert!(matches!(auto, ToolChoice::String(s) if s == "auto"));
        let named: ToolChoice = serde_json::from_str(
            r#"{"type":"function","function":{"name":"lookup"}}"#,
        )
        .unwrap();
        assert!(matches!(named, ToolChoice::Object(o) if o.function.name == "lookup"));
    }
}
