//! Shared harness: stub CLI workers and a fully wired dispatcher.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::time::Duration;

use openclaw_gateway::affinity::SessionAffinity;
use openclaw_gateway::config::{Config, TokenKind, WorkerSpec};
use openclaw_gateway::dispatch::Dispatcher;
use openclaw_gateway::events::EventLog;
use openclaw_gateway::metrics::{DispatcherCounters, TokenLedger};
use openclaw_gateway::openai::{ChatMessage, ChatRequest, ModelFamily, Role};
use openclaw_gateway::queue::{FairQueue, QueueConfig};
use openclaw_gateway::rate_limit::RateLimiter;
use openclaw_gateway::registry::{ProcessRegistry, RegistryConfig};
use openclaw_gateway::router::WorkerRouter;
use openclaw_gateway::warm::{WarmConfig, WarmPool};
use openclaw_gateway::worker::WorkerLauncher;

/// Write an executable stub worker script and return its path.
pub fn script(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_str().unwrap().to_string()
}

pub fn worker_spec(name: &str, bin: &str) -> WorkerSpec {
    WorkerSpec {
        name: name.to_string(),
        bin: bin.to_string(),
        token: None,
        token_kind: TokenKind::Flat,
    }
}

pub fn test_config(workers: Vec<WorkerSpec>) -> Config {
    Config {
        workers,
        // Cold spawns keep the attempt sequence deterministic.
        warm_pool: openclaw_gateway::config::WarmPoolConfig {
            enabled: false,
            size: 1,
            max_age_ms: 600_000,
        },
        stream_timeout_ms: 10_000,
        sync_timeout_ms: 10_000,
        max_retries: 1,
        retry_base_ms: 10,
        ..Config::default()
    }
}

pub fn build_dispatcher(cfg: Config) -> Arc<Dispatcher> {
    let cfg = Arc::new(cfg);
    let events = Arc::new(EventLog::new(cfg.max_events, None));
    let counters = Arc::new(DispatcherCounters::new());
    let tokens = Arc::new(TokenLedger::new(None));

    let queue = FairQueue::new(QueueConfig {
        max_concurrent: cfg.max_concurrent,
        max_queue_total: cfg.max_queue_total,
        max_queue_per_source: cfg.max_queue_per_source,
        default_source_cap: cfg.default_source_concurrency,
        source_caps: cfg.source_concurrency_limits.clone(),
        queue_timeout: Duration::from_millis(cfg.queue_timeout_ms),
        max_lease: Duration::from_millis(cfg.max_lease_ms),
        sweep_interval: Duration::from_secs(5),
    });

    let limits: HashMap<ModelFamily, _> = ModelFamily::all()
        .into_iter()
        .map(|model| (model, cfg.rate_limit_for(model)))
        .collect();
    let limiter = Arc::new(RateLimiter::new(limits, None));

    let affinity = Arc::new(SessionAffinity::new(Duration::from_secs(300)));
    let router = Arc::new(WorkerRouter::new(
        cfg.workers.clone(),
        cfg.primary_worker.clone(),
        Duration::from_millis(cfg.health_check_ms),
        Arc::clone(&affinity),
    ));
    let registry = ProcessRegistry::new(
        RegistryConfig {
            max_age: Duration::from_millis(cfg.max_process_age_ms),
            max_idle: Duration::from_millis(cfg.max_idle_ms),
            reaper_interval: Duration::from_millis(cfg.reaper_interval_ms),
        },
        None,
    );
    let launcher = Arc::new(WorkerLauncher::new(cfg.workers.clone()));
    let warm = WarmPool::new(
        WarmConfig {
            enabled: cfg.warm_pool.enabled,
            max_per_key: cfg.warm_pool.size,
            max_age: Duration::from_millis(cfg.warm_pool.max_age_ms),
        },
        Arc::clone(&launcher),
    );

    Arc::new(Dispatcher {
        cfg,
        queue,
        limiter,
        router,
        affinity,
        registry,
        warm,
        launcher,
        direct: None,
        events,
        counters,
        tokens,
        store: None,
        http: reqwest::Client::new(),
    })
}

pub fn chat_request(prompt: &str, stream: bool) -> ChatRequest {
    ChatRequest {
        messages: vec![ChatMessage::text(Role::User, prompt)],
        model: Some("claude-code/sonnet".to_string()),
        stream: Some(stream),
        max_tokens: None,
        temperature: None,
        top_p: None,
        tools: None,
        tool_choice: None,
        user: None,
    }
}

/// A stream-json line carrying one text delta, single-quoted for sh.
pub fn delta_line(text: &str) -> String {
    format!(
        r#"printf '%s\n' '{{"type":"stream_event","event":{{"type":"content_block_delta","index":0,"delta":{{"type":"text_delta","text":"{text}"}}}}}}'"#
    )
}
