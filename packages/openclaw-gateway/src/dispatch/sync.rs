//! Non-streaming CLI path: run the worker to completion, parse its result
//! JSON, and retry transient failures with jittered exponential backoff.

use std::sync::Arc;

use atomic_counter::AtomicCounter;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::dispatch::{estimate_tokens, Dispatcher, RequestCtx};
use crate::error::{is_rate_limited_text, is_retryable_exit, is_safety_refusal, is_transient_text, GatewayError};
use crate::openai::{
    build_response, ChatMessage, ChatRequest, ChatResponse, CompletionUsage, Role,
};
use crate::registry::{RegistryEntry, WorkerMode};
use crate::warm::WarmKey;
use crate::worker;

const MAX_BACKOFF: Duration = Duration::from_secs(30);
const BACKOFF_JITTER: f64 = 0.3;

struct SyncOutput {
    text: String,
    tokens_in: u64,
    tokens_out: u64,
}

struct SyncFailure {
    summary: String,
    retryable: bool,
}

/// `min(base * 2^n, max) * (1 + rand * jitter)`.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(MAX_BACKOFF.as_millis() as u64);
    let jittered = capped as f64 * (1.0 + fastrand::f64() * BACKOFF_JITTER);
    Duration::from_millis(jittered as u64)
}

/// Run the request on a CLI worker in sync mode, retrying transient
/// failures up to `max_retries` times.
pub async fn run_sync(
    dispatcher: &Arc<Dispatcher>,
    ctx: &RequestCtx,
    request: &ChatRequest,
) -> Result<ChatResponse, GatewayError> {
    dispatcher.counters.sync_requests.inc();
    let parts = crate::dispatch::extract_prompt(request, dispatcher.cfg.max_prompt_chars);
    let payload = worker::build_payload(parts.system.as_deref(), &parts.prompt);
    let display_model = request
        .model
        .clone()
        .unwrap_or_else(|| ctx.model.public_id());

    let mut last_error: Option<String> = None;
    for attempt in 0..=dispatcher.cfg.max_retries {
        if attempt > 0 {
            let delay = backoff_delay(dispatcher.cfg.retry_base_ms, attempt - 1);
            debug!(
                request_id = %ctx.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "sync retry backoff"
            );
            tokio::time::sleep(delay).await;
        }

        let Some(worker_name) = dispatcher.router.select(Some(&ctx.session_key), &[]) else {
            last_error = Some("no healthy workers available".to_string());
            continue;
        };

        let result = sync_attempt(dispatcher, ctx, &payload, &worker_name).await;
        dispatcher.router.release(&worker_name);

        match result {
            Ok(output) => {
                if is_safety_refusal(&output.text) {
                    dispatcher.counters.errors.safety_refusal.inc();
                    dispatcher.events.emit(
                        "safety_refusal",
                        json!({ "requestId": ctx.id, "worker": worker_name }),
                    );
                }
                dispatcher.counters.completed.inc();
                dispatcher
                    .tokens
                    .record(&ctx.id, ctx.model, output.tokens_in, output.tokens_out);
                dispatcher.events.emit(
                    "request_completed",
                    json!({
                        "requestId": ctx.id,
                        "source": ctx.source,
                        "model": ctx.model.as_str(),
                        "tokensIn": output.tokens_in,
                        "tokensOut": output.tokens_out,
                    }),
                );
                return Ok(build_response(
                    &ctx.id,
                    &display_model,
                    ChatMessage::text(Role::Assistant, output.text),
                    "stop",
                    CompletionUsage::new(output.tokens_in, output.tokens_out),
                ));
            }
            Err(failure) => {
                if is_rate_limited_text(&failure.summary) {
                    dispatcher.router.mark_limited(&worker_name);
                    dispatcher.counters.errors.worker_rate_limited.inc();
                    dispatcher
                        .events
                        .emit("worker_limited", json!({ "worker": worker_name.clone() }));
                }
                warn!(
                    request_id = %ctx.id,
                    worker = %worker_name,
                    attempt,
                    error = %failure.summary,
                    "sync attempt failed"
                );
                last_error = Some(failure.summary.clone());
                if !failure.retryable {
                    break;
                }
            }
        }
    }

    dispatcher.counters.failed.inc();
    dispatcher.events.emit(
        "request_failed",
        json!({
            "requestId": ctx.id,
            "source": ctx.source,
            "error": last_error.clone(),
        }),
    );
    Err(GatewayError::Worker(
        last_error.unwrap_or_else(|| "sync request failed".to_string()),
    ))
}

async fn sync_attempt(
    dispatcher: &Arc<Dispatcher>,
    ctx: &RequestCtx,
    payload: &str,
    worker_name: &str,
) -> Result<SyncOutput, SyncFailure> {
    let warm_key = WarmKey::new(ctx.model, false, worker_name);
    let mut child = match dispatcher.warm.acquire(&warm_key).await {
        Some(child) => child,
        None => dispatcher
            .launcher
            .spawn(worker_name, ctx.model, WorkerMode::Sync)
            .map_err(|e| SyncFailure {
                summary: format!("spawn failed: {e}"),
                retryable: true,
            })?,
    };

    if let Err(e) = worker::write_payload(&mut child, payload).await {
        let _ = child.start_kill();
        return Err(SyncFailure {
            summary: format!("payload write failed: {e}"),
            retryable: true,
        });
    }

    let pid = child.id().unwrap_or(0);
    dispatcher.registry.register(RegistryEntry::new(
        pid,
        &ctx.id,
        ctx.model,
        WorkerMode::Sync,
        &ctx.source,
        worker_name,
    ));

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let timeout = Duration::from_millis(dispatcher.cfg.sync_timeout_ms);
    let started = Instant::now();

    let collect = async {
        if let Some(mut stdout) = child.stdout.take() {
            let _ = stdout.read_to_end(&mut stdout_buf).await;
        }
        if let Some(stderr) = child.stderr.take() {
            let _ = stderr.take(16 * 1024).read_to_end(&mut stderr_buf).await;
        }
        child.wait().await
    };
    let status = match tokio::time::timeout(timeout, collect).await {
        Ok(status) => status,
        Err(_) => {
            worker::terminate(pid);
            dispatcher.registry.unregister(pid);
            return Err(SyncFailure {
                summary: format!("sync timeout after {} ms", timeout.as_millis()),
                retryable: true,
            });
        }
    };
    dispatcher.registry.unregister(pid);
    debug!(
        pid,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "sync worker finished"
    );

    let stdout_text = String::from_utf8_lossy(&stdout_buf).into_owned();
    let stderr_text = String::from_utf8_lossy(&stderr_buf).into_owned();
    let exit_code = status.ok().and_then(|s| s.code());

    if !matches!(exit_code, Some(0)) {
        let summary = if stderr_text.trim().is_empty() {
            match exit_code {
                Some(code) => format!("worker exited with code {code}"),
                None => "worker terminated by signal".to_string(),
            }
        } else {
            let mut s = stderr_text.trim().to_string();
            s.truncate(300);
            s
        };
        let retryable = match exit_code {
            Some(code) => is_retryable_exit(code) || is_transient_text(&summary),
            None => false,
        };
        return Err(SyncFailure { summary, retryable });
    }

    Ok(parse_sync_output(&stdout_text, payload.len()))
}

/// The worker emits one JSON result object in sync mode; fall back to raw
/// stdout when parsing fails.
fn parse_sync_output(stdout: &str, payload_len: usize) -> SyncOutput {
    let parsed: Option<Value> = serde_json::from_str(stdout.trim()).ok().or_else(|| {
        stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str(line.trim()).ok())
    });

    let mut text = stdout.trim().to_string();
    let mut tokens_in = 0;
    let mut tokens_out = 0;
    let mut reported = false;

    if let Some(value) = parsed {
        if let Some(result) = value.get("result").and_then(Value::as_str) {
            text = result.to_string();
        } else if let Some(blocks) = value.pointer("/message/content").and_then(Value::as_array) {
            text = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("");
        }
        if let Some(usage) = value.get("usage") {
            let get = |field: &str| usage.get(field).and_then(Value::as_u64).unwrap_or(0);
            tokens_in = get("input_tokens")
                + get("cache_creation_input_tokens")
                + get("cache_read_input_tokens");
            tokens_out = get("output_tokens");
            reported = tokens_in > 0 || tokens_out > 0;
        }
    }
    if !reported {
        tokens_in = estimate_tokens(payload_len);
        tokens_out = estimate_tokens(text.len());
    }
    SyncOutput {
        text,
        tokens_in,
        tokens_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let d0 = backoff_delay(1000, 0);
        assert!(d0 >= Duration::from_millis(1000));
        assert!(d0 <= Duration::from_millis(1300));

        let d3 = backoff_delay(1000, 3);
        assert!(d3 >= Duration::from_millis(8000));
        assert!(d3 <= Duration::from_millis(10_400));

        // Far past the cap: bounded by MAX_BACKOFF plus jitter.
        let d20 = backoff_delay(1000, 12);
        assert!(d20 >= MAX_BACKOFF);
        assert!(d20 <= Duration::from_millis(39_000));
    }

    #[test]
    fn parses_result_object_with_usage() {
        let out = parse_sync_output(
            r#"{"type":"result","result":"the answer","usage":{"input_tokens":12,"output_tokens":4,"cache_read_input_tokens":8}}"#,
            400,
        );
        assert_eq!(out.text, "the answer");
        assert_eq!(out.tokens_in, 20);
        assert_eq!(out.tokens_out, 4);
    }

    #[test]
    fn parses_assistant_message_blocks() {
        let out = parse_sync_output(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello "},{"type":"text","text":"world"}]}}"#,
            100,
        );
        assert_eq!(out.text, "hello world");
        // No usage reported: estimates apply.
        assert_eq!(out.tokens_in, estimate_tokens(100));
        assert_eq!(out.tokens_out, estimate_tokens(11));
    }

    #[test]
    fn falls_back_to_raw_stdout() {
        let out = parse_sync_output("plain text answer", 40);
        assert_eq!(out.text, "plain text answer");
        assert_eq!(out.tokens_in, estimate_tokens(40));
    }

    #[test]
    fn picks_last_json_line_from_noisy_output() {
        let stdout = "warming up\n{\"type\":\"result\",\"result\":\"ok\"}\n";
        let out = parse_sync_output(stdout, 10);
        assert_eq!(out.text, "ok");
    }
}
