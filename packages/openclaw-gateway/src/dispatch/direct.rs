//! Tool-capable direct path: translate OpenAI chat requests into native
//! Anthropic Messages calls and relay the response, streaming or not.
//!
//! CLI workers cannot execute tools, so any request carrying tool
//! definitions bypasses them entirely when a credential pool is
//! configured.

use std::collections::HashMap;
use std::sync::Arc;

use atomic_counter::AtomicCounter;
use serde_json::json;
use tracing::{debug, warn};

use openclaw_anthropic::{
    ContentBlock, ContentBlockStart, ContentDelta, Message, MessagesRequest, Role as ApiRole,
    StreamEvent, ToolChoice as ApiToolChoice, ToolDefinition,
};

use crate::dispatch::{Dispatcher, RequestCtx};
use crate::error::GatewayError;
use crate::openai::{
    build_response, ChatMessage, ChatRequest, ChatResponse, ChunkFactory, CompletionUsage,
    FunctionCall, Role, ToolCall, ToolChoice,
};
use crate::queue::Lease;

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Map OpenAI messages/tools onto the native Messages shape: system prompt
/// as a separate field, tool results as user-role blocks, consecutive
/// same-role messages merged for the API's strict alternation.
pub fn translate_request(request: &ChatRequest, model_id: &str, stream: bool) -> MessagesRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();

    let mut push_blocks = |role: ApiRole, blocks: Vec<ContentBlock>| {
        if blocks.is_empty() {
            return;
        }
        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => messages.push(Message {
                role,
                content: blocks,
            }),
        }
    };

    for message in &request.messages {
        match message.role {
            Role::System => {
                if let Some(content) = &message.content {
                    system_parts.push(content.clone());
                }
            }
            Role::User => {
                if let Some(content) = &message.content {
                    push_blocks(
                        ApiRole::User,
                        vec![ContentBlock::Text {
                            text: content.clone(),
                        }],
                    );
                }
            }
            Role::Assistant => {
                let mut blocks = Vec::new();
                if let Some(content) = &message.content {
                    if !content.is_empty() {
                        blocks.push(ContentBlock::Text {
                            text: content.clone(),
                        });
                    }
                }
                for call in message.tool_calls.iter().flatten() {
                    let input = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({ "raw": call.function.arguments }));
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input,
                    });
                }
                push_blocks(ApiRole::Assistant, blocks);
            }
            // Tool results ride in user-role messages on the native API.
            Role::Tool => {
                push_blocks(
                    ApiRole::User,
                    vec![ContentBlock::ToolResult {
                        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                        content: message.content.clone().unwrap_or_default(),
                    }],
                );
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({ "type": "object" })),
            })
            .collect()
    });

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::String(value) => match value.as_str() {
            "none" => ApiToolChoice::None,
            "required" => ApiToolChoice::Any,
            _ => ApiToolChoice::Auto,
        },
        ToolChoice::Object(object) => ApiToolChoice::Tool {
            name: object.function.name.clone(),
        },
    });

    MessagesRequest {
        model: model_id.to_string(),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        },
        messages,
        tools,
        tool_choice,
        temperature: request.temperature,
        top_p: request.top_p,
        stream,
    }
}

fn map_stop_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("tool_use") => "tool_calls",
        Some("max_tokens") => "length",
        // end_turn and anything unrecognized both finish as "stop".
        _ => "stop",
    }
}

/// Stream the native response, mapping events onto OpenAI chunks. The
/// queue slot is released and the stream terminated by the caller-provided
/// lease and sender.
pub async fn run_direct_stream(
    dispatcher: Arc<Dispatcher>,
    ctx: RequestCtx,
    request: ChatRequest,
    sender: super::stream::SseSender,
    lease: Lease,
) {
    dispatcher.counters.direct_requests.inc();
    let _ = sender.comment("proxy-accepted").await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let keepalive = super::stream::spawn_keepalive(sender.clone(), cancel.clone());

    let display_model = request
        .model
        .clone()
        .unwrap_or_else(|| ctx.model.public_id());
    let chunks = ChunkFactory::new(&ctx.id, &display_model);

    let result = relay_direct_stream(&dispatcher, &ctx, &request, &chunks, &sender).await;
    let mut finish_sent = false;
    match result {
        Ok(DirectOutcome {
            tokens_in,
            tokens_out,
            finish_sent: sent,
        }) => {
            finish_sent = sent;
            dispatcher.counters.completed.inc();
            dispatcher
                .tokens
                .record(&ctx.id, ctx.model, tokens_in, tokens_out);
            dispatcher.events.emit(
                "request_completed",
                json!({
                    "requestId": ctx.id,
                    "source": ctx.source,
                    "model": ctx.model.as_str(),
                    "path": "direct",
                    "tokensIn": tokens_in,
                    "tokensOut": tokens_out,
                }),
            );
        }
        Err(e) => {
            dispatcher.counters.failed.inc();
            warn!(request_id = %ctx.id, error = %e, "direct stream failed");
            dispatcher.events.emit(
                "request_failed",
                json!({ "requestId": ctx.id, "path": "direct", "error": e.to_string() }),
            );
            let _ = sender
                .send_chunk(&chunks.content(format!("\n[gateway error: {e}]")))
                .await;
        }
    }

    if !finish_sent {
        let _ = sender.send_chunk(&chunks.finish("stop")).await;
    }
    let _ = sender.done().await;
    cancel.cancel();
    let _ = keepalive.await;
    lease.release();
}

struct DirectOutcome {
    tokens_in: u64,
    tokens_out: u64,
    finish_sent: bool,
}

async fn relay_direct_stream(
    dispatcher: &Arc<Dispatcher>,
    ctx: &RequestCtx,
    request: &ChatRequest,
    chunks: &ChunkFactory,
    sender: &super::stream::SseSender,
) -> Result<DirectOutcome, GatewayError> {
    let client = dispatcher
        .direct
        .as_ref()
        .ok_or_else(|| GatewayError::Config("direct API not configured".to_string()))?;
    let native = translate_request(request, ctx.model.api_model_id(), true);
    let mut stream = client.messages_stream(&native).await?;

    let mut tokens_in: u64 = 0;
    let mut tokens_out: u64 = 0;
    let mut finish_sent = false;
    // Anthropic content-block index -> OpenAI tool_calls index.
    let mut tool_indices: HashMap<usize, u32> = HashMap::new();
    let mut next_tool_index: u32 = 0;

    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            // Client hung up: dropping the stream aborts the upstream call.
            _ = sender.closed() => {
                dispatcher.counters.errors.client_disconnect.inc();
                debug!(request_id = %ctx.id, "client disconnected mid direct stream");
                return Ok(DirectOutcome { tokens_in, tokens_out, finish_sent });
            }
        };
        let Some(event) = event? else {
            break;
        };
        match event {
            StreamEvent::MessageStart { message } => {
                tokens_in = message.usage.total_input();
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if let ContentBlockStart::ToolUse { id, name, .. } = content_block {
                    let tool_index = next_tool_index;
                    next_tool_index += 1;
                    tool_indices.insert(index, tool_index);
                    let _ = sender
                        .send_content(&chunks.tool_call_start(tool_index, &id, &name))
                        .await;
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta { text } => {
                    let _ = sender.send_content(&chunks.content(text)).await;
                }
                ContentDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool_index) = tool_indices.get(&index) {
                        let _ = sender
                            .send_content(&chunks.tool_call_arguments(*tool_index, &partial_json))
                            .await;
                    }
                }
                ContentDelta::ThinkingDelta { .. } | ContentDelta::SignatureDelta { .. } => {}
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    tokens_out = tokens_out.max(usage.output_tokens);
                }
                if let Some(stop_reason) = delta.stop_reason.as_deref() {
                    let reason = map_stop_reason(Some(stop_reason));
                    if sender.send_chunk(&chunks.finish(reason)).await {
                        finish_sent = true;
                    }
                }
            }
            StreamEvent::MessageStop => break,
            StreamEvent::Ping | StreamEvent::ContentBlockStop { .. } => {}
            StreamEvent::Error { error } => {
                return Err(GatewayError::Worker(format!(
                    "upstream stream error: {}",
                    error.message
                )));
            }
        }
    }
    Ok(DirectOutcome {
        tokens_in,
        tokens_out,
        finish_sent,
    })
}

/// Non-streaming direct call: one Messages request, translated back into a
/// one-shot chat completion.
pub async fn run_direct_sync(
    dispatcher: &Arc<Dispatcher>,
    ctx: &RequestCtx,
    request: &ChatRequest,
) -> Result<ChatResponse, GatewayError> {
    dispatcher.counters.direct_requests.inc();
    let client = dispatcher
        .direct
        .as_ref()
        .ok_or_else(|| GatewayError::Config("direct API not configured".to_string()))?;
    let native = translate_request(request, ctx.model.api_model_id(), false);
    let response = client.messages(&native).await?;

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    for block in &response.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                type_: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::ToolResult { .. } => {}
        }
    }

    let tokens_in = response.usage.total_input();
    let tokens_out = response.usage.output_tokens;
    dispatcher.counters.completed.inc();
    dispatcher
        .tokens
        .record(&ctx.id, ctx.model, tokens_in, tokens_out);

    let display_model = request
        .model
        .clone()
        .unwrap_or_else(|| ctx.model.public_id());
    let message = ChatMessage {
        role: Role::Assistant,
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
        name: None,
    };
    Ok(build_response(
        &ctx.id,
        &display_model,
        message,
        map_stop_reason(response.stop_reason.as_deref()),
        CompletionUsage::new(tokens_in, tokens_out),
    ))
}
