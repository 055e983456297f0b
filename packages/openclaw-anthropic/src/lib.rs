//! openclaw-anthropic: native Anthropic Messages API client
//!
//! Speaks the Messages API directly: typed request/response shapes, a
//! round-robin credential pool mixing subscription (OAuth bearer) and
//! metered (API key) credentials, and an incremental SSE consumer that
//! maps the native event stream into a typed enum.

mod client;
mod error;
pub mod sse;
mod stream;
mod types;

pub use client::{AnthropicClient, Credential, CredentialKind, CredentialPool};
pub use error::AnthropicError;
pub use stream::{ContentBlockStart, ContentDelta, MessageStream, StreamEvent};
pub use types::{
    ContentBlock, Message, MessagesRequest, MessagesResponse, Role, ToolChoice, ToolDefinition,
    Usage,
};
