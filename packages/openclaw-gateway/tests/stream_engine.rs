//! End-to-end streaming engine scenarios against stub CLI workers.

#![cfg(unix)]

mod common;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use openclaw_gateway::dispatch::stream::{run_stream, OutFrame, SseSender};
use openclaw_gateway::dispatch::{Dispatcher, SourceHint};
use openclaw_gateway::openai::DONE_SENTINEL;
use openclaw_gateway::queue::Priority;

use common::{build_dispatcher, chat_request, delta_line, script, test_config, worker_spec};

struct StreamRun {
    frames: Vec<OutFrame>,
}

impl StreamRun {
    fn contents(&self) -> Vec<String> {
        self.frames
            .iter()
            .filter_map(|frame| match frame {
                OutFrame::Data(payload) if payload != DONE_SENTINEL => {
                    let value: Value = serde_json::from_str(payload).ok()?;
                    value
                        .pointer("/choices/0/delta/content")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                }
                _ => None,
            })
            .collect()
    }

    fn done_count(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| matches!(frame, OutFrame::Data(p) if p == DONE_SENTINEL))
            .count()
    }

    fn finish_reasons(&self) -> Vec<String> {
        self.frames
            .iter()
            .filter_map(|frame| match frame {
                OutFrame::Data(payload) if payload != DONE_SENTINEL => {
                    let value: Value = serde_json::from_str(payload).ok()?;
                    value
                        .pointer("/choices/0/finish_reason")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                }
                _ => None,
            })
            .collect()
    }
}

async fn drive_stream(dispatcher: &Arc<Dispatcher>, prompt: &str) -> StreamRun {
    let request = chat_request(prompt, true);
    let ctx = dispatcher.ingress(&request, &SourceHint::default());
    let lease = dispatcher
        .queue
        .acquire(&ctx.source, Priority::Normal)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel::<OutFrame>(256);
    let sender = SseSender::new(tx);
    let engine = tokio::spawn(run_stream(
        Arc::clone(dispatcher),
        ctx,
        request,
        sender,
        lease,
    ));

    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    engine.await.unwrap();
    StreamRun { frames }
}

#[tokio::test]
async fn quick_fail_retries_on_second_worker_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let failing = script(dir.path(), "w1.sh", "cat > /dev/null\nexit 1");
    let good = script(
        dir.path(),
        "w2.sh",
        &format!(
            "cat > /dev/null\n{}\n{}\n{}\nexit 0",
            delta_line("one "),
            delta_line("two "),
            delta_line("three")
        ),
    );
    let dispatcher = build_dispatcher(test_config(vec![
        worker_spec("w1", &failing),
        worker_spec("w2", &good),
    ]));

    let run = drive_stream(&dispatcher, "hello").await;

    // The client sees exactly the three chunks from the second worker.
    assert_eq!(run.contents(), ["one ", "two ", "three"]);
    assert_eq!(run.done_count(), 1);
    assert_eq!(run.finish_reasons(), ["stop"]);
    assert!(matches!(run.frames.first(), Some(OutFrame::Comment(c)) if c == "proxy-accepted"));

    let stats = dispatcher.counters.stats();
    assert_eq!(stats.errors.stream_retry, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.errors.fallback, 0);
}

#[tokio::test]
async fn all_workers_failing_falls_back_to_http() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let upstream = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"alpha\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"beta\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"gamma\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let failing = script(dir.path(), "fail.sh", "cat > /dev/null\nexit 1");
    let mut cfg = test_config(vec![
        worker_spec("w1", &failing),
        worker_spec("w2", &failing),
    ]);
    cfg.fallback_api = Some(openclaw_gateway::config::FallbackApiConfig {
        base_url: upstream.uri(),
        api_key: "fk".to_string(),
        model: "fallback-model".to_string(),
        name: "fallback".to_string(),
    });
    let dispatcher = build_dispatcher(cfg);

    let run = drive_stream(&dispatcher, "hello").await;

    assert_eq!(run.contents(), ["alpha", "beta", "gamma"]);
    assert_eq!(run.done_count(), 1);

    let stats = dispatcher.counters.stats();
    assert_eq!(stats.errors.stream_retry, 1);
    assert_eq!(stats.errors.fallback, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn zero_exit_with_no_content_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let empty = script(dir.path(), "empty.sh", "cat > /dev/null\nexit 0");
    let second = script(dir.path(), "second.sh", "cat > /dev/null\nexit 0");
    let dispatcher = build_dispatcher(test_config(vec![
        worker_spec("w1", &empty),
        worker_spec("w2", &second),
    ]));

    let run = drive_stream(&dispatcher, "hello").await;

    // Clean empty completion still terminates the stream properly.
    assert_eq!(run.contents(), Vec::<String>::new());
    assert_eq!(run.done_count(), 1);
    let stats = dispatcher.counters.stats();
    assert_eq!(stats.errors.stream_retry, 0);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn no_retry_after_content_was_sent() {
    let dir = tempfile::tempdir().unwrap();
    let partial = script(
        dir.path(),
        "partial.sh",
        &format!("cat > /dev/null\n{}\nexit 1", delta_line("partial answer")),
    );
    let never_used = script(
        dir.path(),
        "never.sh",
        &format!("cat > /dev/null\n{}\nexit 0", delta_line("should not appear")),
    );
    let dispatcher = build_dispatcher(test_config(vec![
        worker_spec("w1", &partial),
        worker_spec("w2", &never_used),
    ]));

    let run = drive_stream(&dispatcher, "hello").await;

    let contents = run.contents();
    assert_eq!(contents.first().map(String::as_str), Some("partial answer"));
    assert!(!contents.iter().any(|c| c.contains("should not appear")));
    assert_eq!(run.done_count(), 1);
    assert_eq!(dispatcher.counters.stats().errors.stream_retry, 0);
}

#[tokio::test]
async fn result_events_forward_when_no_deltas_were_sent() {
    let dir = tempfile::tempdir().unwrap();
    let result_only = script(
        dir.path(),
        "result.sh",
        r#"cat > /dev/null
printf '%s\n' '{"type":"result","result":"final text","usage":{"input_tokens":7,"output_tokens":3}}'
exit 0"#,
    );
    let dispatcher = build_dispatcher(test_config(vec![worker_spec("w1", &result_only)]));

    let run = drive_stream(&dispatcher, "hello").await;

    assert_eq!(run.contents(), ["final text"]);
    assert_eq!(run.done_count(), 1);
    // Reported usage lands in the ledger.
    let tokens = dispatcher.tokens.stats();
    let sonnet = tokens.get("sonnet").unwrap();
    assert_eq!(sonnet.input, 7);
    assert_eq!(sonnet.output, 3);
}

#[tokio::test]
async fn tiny_refusal_output_is_counted_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let refusal = script(
        dir.path(),
        "refusal.sh",
        r#"cat > /dev/null
printf '%s\n' '{"type":"result","result":"I cannot help with that request."}'
exit 0"#,
    );
    let dispatcher = build_dispatcher(test_config(vec![worker_spec("w1", &refusal)]));

    let run = drive_stream(&dispatcher, "hello").await;

    assert_eq!(run.done_count(), 1);
    let stats = dispatcher.counters.stats();
    assert_eq!(stats.errors.safety_refusal, 1);
    assert_eq!(stats.errors.stream_retry, 0);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn rate_limited_worker_output_degrades_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let limited = script(
        dir.path(),
        "limited.sh",
        "cat > /dev/null\necho 'error: rate limit exceeded' >&2\nexit 1",
    );
    let good = script(
        dir.path(),
        "good.sh",
        &format!("cat > /dev/null\n{}\nexit 0", delta_line("served by w2")),
    );
    let mut cfg = test_config(vec![worker_spec("w1", &limited), worker_spec("w2", &good)]);
    cfg.primary_worker = Some("w2".to_string());
    let dispatcher = build_dispatcher(cfg);

    let run = drive_stream(&dispatcher, "hello").await;

    assert_eq!(run.contents(), ["served by w2"]);
    let stats = dispatcher.counters.stats();
    assert_eq!(stats.errors.worker_rate_limited, 1);
    let router = dispatcher.router.stats();
    let w1 = router.workers.iter().find(|w| w.name == "w1").unwrap();
    assert!(w1.limited);
    assert_eq!(
        router.mode,
        openclaw_gateway::router::PoolMode::Degraded
    );
}

#[tokio::test]
async fn queue_slot_is_released_after_stream_ends() {
    let dir = tempfile::tempdir().unwrap();
    let good = script(
        dir.path(),
        "good.sh",
        &format!("cat > /dev/null\n{}\nexit 0", delta_line("done")),
    );
    let dispatcher = build_dispatcher(test_config(vec![worker_spec("w1", &good)]));

    drive_stream(&dispatcher, "hello").await;
    let stats = dispatcher.queue.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.processed, 1);
    // Router connection count also returns to zero.
    assert!(dispatcher.router.stats().workers.iter().all(|w| w.active == 0));
}
