//! Streaming state machine for the CLI-worker path.
//!
//! One request runs as a sequence of attempts. An attempt spawns (or warm-
//! acquires) a worker, feeds it the payload, and relays its line-delimited
//! JSON events as OpenAI chunks while heartbeat, execution and keepalive
//! timers run. Quick failures retry on untried workers; once any content
//! byte has reached the client no retry ever happens, so the client sees
//! exactly one response. Exhaustion without content falls back to the
//! configured HTTP API. Every stream ends with a terminating chunk and
//! `data: [DONE]`, even on fatal errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atomic_counter::AtomicCounter;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use openclaw_anthropic::sse::SseEventStream;

use crate::dispatch::{estimate_tokens, Dispatcher, RequestCtx};
use crate::error::{is_context_overflow, is_rate_limited_text, is_safety_refusal};
use crate::openai::{ChatChunk, ChatRequest, ChunkFactory, DONE_SENTINEL};
use crate::queue::Lease;
use crate::registry::{RegistryEntry, WorkerMode};
use crate::warm::WarmKey;
use crate::worker;

/// Warn-only first-byte watchdog.
const FIRST_BYTE_WARN: Duration = Duration::from_secs(8);

/// A worker exiting non-zero inside this window with no content sent is
/// safe to retry on another worker.
const QUICK_FAIL_WINDOW: Duration = Duration::from_secs(5);

const KEEPALIVE_BEFORE_OUTPUT: Duration = Duration::from_secs(5);
const KEEPALIVE_AFTER_OUTPUT: Duration = Duration::from_secs(30);

/// One frame on its way to the SSE response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutFrame {
    /// `: <text>` comment line (preamble, keepalives).
    Comment(String),
    /// `data: <payload>` line.
    Data(String),
}

/// Channel-backed writer shared by the engine and the keepalive task.
/// Tracks whether any real content has been sent — the retry and fallback
/// decisions hinge on that bit.
#[derive(Clone)]
pub struct SseSender {
    tx: mpsc::Sender<OutFrame>,
    sent_content: Arc<AtomicBool>,
}

impl SseSender {
    pub fn new(tx: mpsc::Sender<OutFrame>) -> Self {
        Self {
            tx,
            sent_content: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn comment(&self, text: &str) -> bool {
        self.tx
            .send(OutFrame::Comment(text.to_string()))
            .await
            .is_ok()
    }

    /// Send a chunk without marking content (finish chunks, error trailers).
    pub async fn send_chunk(&self, chunk: &ChatChunk) -> bool {
        let Ok(payload) = serde_json::to_string(chunk) else {
            return false;
        };
        self.tx.send(OutFrame::Data(payload)).await.is_ok()
    }

    /// Send a content-bearing chunk; after this no retry may happen.
    pub async fn send_content(&self, chunk: &ChatChunk) -> bool {
        let ok = self.send_chunk(chunk).await;
        if ok {
            self.sent_content.store(true, Ordering::Release);
        }
        ok
    }

    pub async fn done(&self) -> bool {
        self.tx
            .send(OutFrame::Data(DONE_SENTINEL.to_string()))
            .await
            .is_ok()
    }

    pub fn has_content(&self) -> bool {
        self.sent_content.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// SSE liveness: a comment every 5 s until real output starts flowing,
/// relaxing to every 30 s after.
pub(crate) fn spawn_keepalive(
    sender: SseSender,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = if sender.has_content() {
                KEEPALIVE_AFTER_OUTPUT
            } else {
                KEEPALIVE_BEFORE_OUTPUT
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if !sender.comment("keepalive").await {
                        break;
                    }
                }
            }
        }
    })
}

enum AttemptOutcome {
    Completed { tokens_in: u64, tokens_out: u64 },
    QuickFail { summary: String },
    FailedNoContent { summary: String },
    FailedWithContent { summary: String },
    ClientGone,
}

#[derive(Debug, Clone, Copy)]
enum TimeoutKind {
    Heartbeat,
    Execution,
}

/// Drive one streaming request to completion: attempts, retries, fallback,
/// terminating chunk, lease release.
pub async fn run_stream(
    dispatcher: Arc<Dispatcher>,
    ctx: RequestCtx,
    request: ChatRequest,
    sender: SseSender,
    lease: Lease,
) {
    dispatcher.counters.stream_requests.inc();
    // Establish the stream before any worker output so reverse proxies do
    // not time out during the spawn window.
    let _ = sender.comment("proxy-accepted").await;

    let cancel = CancellationToken::new();
    let keepalive = spawn_keepalive(sender.clone(), cancel.clone());

    let parts = crate::dispatch::extract_prompt(&request, dispatcher.cfg.max_prompt_chars);
    let payload = worker::build_payload(parts.system.as_deref(), &parts.prompt);
    let display_model = request
        .model
        .clone()
        .unwrap_or_else(|| ctx.model.public_id());
    let chunks = ChunkFactory::new(&ctx.id, &display_model);

    let pool_size = dispatcher.router.pool_size().max(1);
    let mut tried: Vec<String> = Vec::new();
    let mut outcome: Option<AttemptOutcome> = None;

    while tried.len() < pool_size {
        let Some(worker_name) = dispatcher
            .router
            .select(Some(&ctx.session_key), &tried)
        else {
            break;
        };
        if tried.contains(&worker_name) {
            // Only already-tried workers remain.
            dispatcher.router.release(&worker_name);
            break;
        }
        tried.push(worker_name.clone());

        let attempt = run_attempt(&dispatcher, &ctx, &payload, &worker_name, &chunks, &sender).await;
        dispatcher.router.release(&worker_name);

        match attempt {
            AttemptOutcome::QuickFail { summary } if tried.len() < pool_size => {
                dispatcher.counters.errors.stream_retry.inc();
                dispatcher.events.emit(
                    "stream_retry",
                    json!({
                        "requestId": ctx.id,
                        "worker": worker_name,
                        "attempt": tried.len(),
                        "error": summary,
                    }),
                );
                continue;
            }
            other => {
                outcome = Some(other);
                break;
            }
        }
    }

    let outcome = outcome.unwrap_or(AttemptOutcome::FailedNoContent {
        summary: "no healthy workers available".to_string(),
    });

    match outcome {
        AttemptOutcome::Completed {
            tokens_in,
            tokens_out,
        } => {
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
                    "tokensIn": tokens_in,
                    "tokensOut": tokens_out,
                    "durationMs": ctx.received_at.elapsed().as_millis() as u64,
                }),
            );
        }
        AttemptOutcome::ClientGone => {
            dispatcher.counters.errors.client_disconnect.inc();
            dispatcher
                .events
                .emit("client_disconnect", json!({ "requestId": ctx.id }));
            cancel.cancel();
            let _ = keepalive.await;
            lease.release();
            return;
        }
        AttemptOutcome::QuickFail { summary } | AttemptOutcome::FailedNoContent { summary } => {
            if !sender.has_content() && dispatcher.cfg.fallback_api.is_some() {
                match run_fallback(&dispatcher, &ctx, &request, &chunks, &sender).await {
                    Ok((tokens_in, tokens_out)) => {
                        dispatcher.counters.completed.inc();
                        dispatcher
                            .tokens
                            .record(&ctx.id, ctx.model, tokens_in, tokens_out);
                    }
                    Err(fallback_error) => {
                        dispatcher.counters.failed.inc();
                        emit_failure(&dispatcher, &ctx, &fallback_error.to_string());
                        let _ = sender
                            .send_chunk(&chunks.content(format!(
                                "\n[gateway error: {summary}; fallback failed: {fallback_error}]"
                            )))
                            .await;
                    }
                }
            } else {
                dispatcher.counters.failed.inc();
                emit_failure(&dispatcher, &ctx, &summary);
                let _ = sender
                    .send_chunk(&chunks.content(format!("\n[gateway error: {summary}]")))
                    .await;
            }
        }
        AttemptOutcome::FailedWithContent { summary } => {
            dispatcher.counters.failed.inc();
            emit_failure(&dispatcher, &ctx, &summary);
            let _ = sender
                .send_chunk(&chunks.content(format!("\n[stream interrupted: {summary}]")))
                .await;
        }
    }

    // Clients never hang: terminating delta plus the DONE sentinel, always.
    let _ = sender.send_chunk(&chunks.finish("stop")).await;
    let _ = sender.done().await;
    cancel.cancel();
    let _ = keepalive.await;
    lease.release();
}

fn emit_failure(dispatcher: &Dispatcher, ctx: &RequestCtx, error: &str) {
    dispatcher.events.emit(
        "request_failed",
        json!({
            "requestId": ctx.id,
            "source": ctx.source,
            "model": ctx.model.as_str(),
            "error": error,
        }),
    );
}

/// One worker attempt: spawn, feed, relay until exit or a timer fires.
async fn run_attempt(
    dispatcher: &Arc<Dispatcher>,
    ctx: &RequestCtx,
    payload: &str,
    worker_name: &str,
    chunks: &ChunkFactory,
    sender: &SseSender,
) -> AttemptOutcome {
    let attempt_start = Instant::now();

    let warm_key = WarmKey::new(ctx.model, true, worker_name);
    let mut child = match dispatcher.warm.acquire(&warm_key).await {
        Some(child) => child,
        None => match dispatcher
            .launcher
            .spawn(worker_name, ctx.model, WorkerMode::Stream)
        {
            Ok(child) => child,
            Err(e) => {
                return AttemptOutcome::QuickFail {
                    summary: format!("spawn failed: {e}"),
                }
            }
        },
    };

    if let Err(e) = worker::write_payload(&mut child, payload).await {
        let _ = child.start_kill();
        return AttemptOutcome::QuickFail {
            summary: format!("payload write failed: {e}"),
        };
    }

    let pid = child.id().unwrap_or(0);
    dispatcher.registry.register(RegistryEntry::new(
        pid,
        &ctx.id,
        ctx.model,
        WorkerMode::Stream,
        &ctx.source,
        worker_name,
    ));

    let Some(stdout) = child.stdout.take() else {
        let _ = child.start_kill();
        dispatcher.registry.unregister(pid);
        return AttemptOutcome::QuickFail {
            summary: "worker stdout not captured".to_string(),
        };
    };
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::with_capacity(1024);
            let _ = stderr.take(16 * 1024).read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    let mut lines = BufReader::new(stdout).lines();
    let heartbeat = dispatcher.cfg.heartbeat_for(ctx.model);
    let exec_deadline = attempt_start + Duration::from_millis(dispatcher.cfg.stream_timeout_ms);
    let mut hb_deadline = Instant::now() + heartbeat;
    let mut first_byte_warn = Some(Instant::now() + FIRST_BYTE_WARN);

    let mut relay = RelayState {
        text_out: String::new(),
        delta_content_sent: false,
        usage_in: 0,
        usage_out: 0,
        usage_reported: false,
    };
    let mut timeout_kind: Option<TimeoutKind> = None;
    let mut client_gone = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        hb_deadline = Instant::now() + heartbeat;
                        first_byte_warn = None;
                        match serde_json::from_str::<Value>(trimmed) {
                            Ok(value) => {
                                relay_worker_event(
                                    dispatcher, pid, &value, chunks, sender, &mut relay,
                                )
                                .await;
                            }
                            Err(_) => {
                                // Non-JSON noise still counts as liveness.
                                dispatcher.registry.touch(pid, 0, 0);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(pid, error = %e, "worker stdout read failed");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(hb_deadline) => {
                timeout_kind = Some(TimeoutKind::Heartbeat);
                break;
            }
            _ = tokio::time::sleep_until(exec_deadline) => {
                timeout_kind = Some(TimeoutKind::Execution);
                break;
            }
            _ = sender.closed() => {
                client_gone = true;
                break;
            }
            _ = sleep_until_opt(first_byte_warn), if first_byte_warn.is_some() => {
                warn!(worker = worker_name, pid, "no output from worker after first-byte window");
                first_byte_warn = None;
            }
        }
    }

    if client_gone {
        worker::terminate(pid);
        let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        dispatcher.registry.unregister(pid);
        return AttemptOutcome::ClientGone;
    }
    if timeout_kind.is_some() {
        worker::terminate(pid);
    }

    let status = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
    dispatcher.registry.unregister(pid);
    let stderr_text = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    let exit_code = match status {
        Ok(Ok(status)) => status.code(),
        _ => None,
    };

    let failed = !matches!(exit_code, Some(0));
    if failed
        && (is_rate_limited_text(&stderr_text) || is_rate_limited_text(&relay.text_out))
    {
        dispatcher.router.mark_limited(worker_name);
        dispatcher.counters.errors.worker_rate_limited.inc();
        dispatcher.events.emit(
            "worker_limited",
            json!({ "worker": worker_name, "requestId": ctx.id }),
        );
    }

    if let Some(kind) = timeout_kind {
        let summary = match kind {
            TimeoutKind::Heartbeat => {
                dispatcher.counters.errors.heartbeat_timeout.inc();
                format!("heartbeat silence after {} s", heartbeat.as_secs())
            }
            TimeoutKind::Execution => {
                dispatcher.counters.errors.execution_timeout.inc();
                "execution time limit exceeded".to_string()
            }
        };
        dispatcher.events.emit(
            "worker_timeout",
            json!({ "worker": worker_name, "pid": pid, "requestId": ctx.id, "error": summary.clone() }),
        );
        return if sender.has_content() {
            AttemptOutcome::FailedWithContent { summary }
        } else {
            AttemptOutcome::FailedNoContent { summary }
        };
    }

    if !failed {
        // Zero exit with empty output is a clean (if useless) completion.
        if is_safety_refusal(&relay.text_out) {
            dispatcher.counters.errors.safety_refusal.inc();
            dispatcher.events.emit(
                "safety_refusal",
                json!({ "requestId": ctx.id, "worker": worker_name }),
            );
        }
        let (tokens_in, tokens_out) = if relay.usage_reported {
            (relay.usage_in, relay.usage_out)
        } else {
            // The worker never reported usage: estimate from characters.
            (
                estimate_tokens(payload.len()),
                estimate_tokens(relay.text_out.len()),
            )
        };
        return AttemptOutcome::Completed {
            tokens_in,
            tokens_out,
        };
    }

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
    debug!(worker = worker_name, pid, ?exit_code, "worker attempt failed");

    if sender.has_content() {
        AttemptOutcome::FailedWithContent { summary }
    } else if attempt_start.elapsed() < QUICK_FAIL_WINDOW {
        AttemptOutcome::QuickFail { summary }
    } else {
        AttemptOutcome::FailedNoContent { summary }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct RelayState {
    text_out: String,
    delta_content_sent: bool,
    usage_in: u64,
    usage_out: u64,
    usage_reported: bool,
}

/// Interpret one line-JSON event from the worker and forward content.
async fn relay_worker_event(
    dispatcher: &Dispatcher,
    pid: u32,
    value: &Value,
    chunks: &ChunkFactory,
    sender: &SseSender,
    relay: &mut RelayState,
) {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
    match kind {
        "stream_event" => {
            if let Some(event) = value.get("event") {
                if let Some(text) = event.pointer("/delta/text").and_then(Value::as_str) {
                    relay.delta_content_sent = true;
                    forward_text(dispatcher, pid, text, chunks, sender, relay).await;
                }
                if let Some(usage) = event.get("usage") {
                    apply_usage(dispatcher, pid, usage, relay);
                }
            }
        }
        "assistant" => {
            // Forward the collected assistant text only when no delta-path
            // content reached the client already.
            if !relay.delta_content_sent {
                if let Some(blocks) = value.pointer("/message/content").and_then(Value::as_array)
                {
                    for block in blocks {
                        if block.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                forward_text(dispatcher, pid, text, chunks, sender, relay).await;
                            }
                        }
                    }
                }
            }
        }
        "content_block_delta" => {
            if let Some(text) = value.pointer("/delta/text").and_then(Value::as_str) {
                relay.delta_content_sent = true;
                forward_text(dispatcher, pid, text, chunks, sender, relay).await;
            }
        }
        "result" => {
            if !sender.has_content() {
                if let Some(text) = value.get("result").and_then(Value::as_str) {
                    forward_text(dispatcher, pid, text, chunks, sender, relay).await;
                }
            }
        }
        _ => {
            dispatcher.registry.touch(pid, 0, 0);
        }
    }
    // Any event carrying usage updates the live token counters.
    if let Some(usage) = value
        .get("usage")
        .or_else(|| value.pointer("/message/usage"))
    {
        apply_usage(dispatcher, pid, usage, relay);
    }
}

async fn forward_text(
    dispatcher: &Dispatcher,
    pid: u32,
    text: &str,
    chunks: &ChunkFactory,
    sender: &SseSender,
    relay: &mut RelayState,
) {
    if text.is_empty() {
        return;
    }
    relay.text_out.push_str(text);
    dispatcher.registry.touch(pid, 0, 0);
    let _ = sender.send_content(&chunks.content(text)).await;
}

/// Input tokens count fresh, cache-created and cache-read; output tokens
/// are reported cumulatively, so take the latest totals.
fn apply_usage(dispatcher: &Dispatcher, pid: u32, usage: &Value, relay: &mut RelayState) {
    let get = |field: &str| usage.get(field).and_then(Value::as_u64).unwrap_or(0);
    let input = get("input_tokens") + get("cache_creation_input_tokens") + get("cache_read_input_tokens");
    let output = get("output_tokens");
    if input == 0 && output == 0 {
        return;
    }
    let delta_in = input.saturating_sub(relay.usage_in);
    let delta_out = output.saturating_sub(relay.usage_out);
    relay.usage_in = relay.usage_in.max(input);
    relay.usage_out = relay.usage_out.max(output);
    relay.usage_reported = true;
    dispatcher.registry.touch(pid, delta_in, delta_out);
}

/// Relay the OpenAI-compatible fallback stream after every worker attempt
/// failed without content. Returns estimated (input, output) tokens.
async fn run_fallback(
    dispatcher: &Arc<Dispatcher>,
    ctx: &RequestCtx,
    request: &ChatRequest,
    chunks: &ChunkFactory,
    sender: &SseSender,
) -> Result<(u64, u64), crate::error::GatewayError> {
    let fallback = dispatcher
        .cfg
        .fallback_api
        .as_ref()
        .ok_or(crate::error::GatewayError::Exhausted)?;
    dispatcher.counters.errors.fallback.inc();
    dispatcher.events.emit(
        "fallback_used",
        json!({ "requestId": ctx.id, "backend": fallback.name }),
    );

    let body = json!({
        "model": fallback.model,
        "messages": request.messages,
        "stream": true,
        "max_tokens": request.max_tokens,
    });
    let response = dispatcher
        .http
        .post(format!(
            "{}/chat/completions",
            fallback.base_url.trim_end_matches('/')
        ))
        .bearer_auth(&fallback.api_key)
        .json(&body)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if is_context_overflow(&body) {
            dispatcher.counters.errors.fallback_context_overflow.inc();
        }
        let mut summary = body;
        summary.truncate(300);
        return Err(crate::error::GatewayError::Worker(format!(
            "fallback returned {status}: {summary}"
        )));
    }

    let mut events = SseEventStream::new(response);
    let mut chars_out = 0usize;
    loop {
        let event = tokio::select! {
            event = events.next_event() => event,
            _ = sender.closed() => break,
        };
        let event = match event {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                // Mid-stream failure still finalizes cleanly upstream.
                warn!(error = %e, "fallback stream ended abnormally");
                break;
            }
        };
        if event.data.trim() == DONE_SENTINEL {
            break;
        }
        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
            continue;
        };
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if is_context_overflow(message) || is_context_overflow(&event.data) {
                dispatcher.counters.errors.fallback_context_overflow.inc();
                dispatcher
                    .events
                    .emit("fallback_context_overflow", json!({ "requestId": ctx.id }));
            }
            break;
        }
        if let Some(text) = value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            chars_out += text.len();
            if !sender.send_content(&chunks.content(text)).await {
                break;
            }
        }
    }

    let prompt_chars: usize = request
        .messages
        .iter()
        .filter_map(|m| m.content.as_deref())
        .map(str::len)
        .sum();
    Ok((estimate_tokens(prompt_chars), estimate_tokens(chars_out)))
}
