//! OpenClaw Gateway daemon entry point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use openclaw_anthropic::{AnthropicClient, Credential, CredentialKind, CredentialPool};
use openclaw_gateway::affinity::SessionAffinity;
use openclaw_gateway::config::{Config, TokenKind};
use openclaw_gateway::dispatch::Dispatcher;
use openclaw_gateway::events::EventLog;
use openclaw_gateway::metrics::{DispatcherCounters, TokenLedger};
use openclaw_gateway::openai::ModelFamily;
use openclaw_gateway::queue::{FairQueue, QueueConfig};
use openclaw_gateway::rate_limit::RateLimiter;
use openclaw_gateway::registry::{ProcessRegistry, RegistryConfig};
use openclaw_gateway::router::WorkerRouter;
use openclaw_gateway::server::{self, AppState};
use openclaw_gateway::store::{self, keys, DurableStore, MemoryStore};
use openclaw_gateway::warm::{WarmConfig, WarmKey, WarmPool};
use openclaw_gateway::worker::WorkerLauncher;

const AFFINITY_TTL: Duration = Duration::from_secs(300);
const QUEUE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const WARM_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const METRICS_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "openclaw-gateway", about = "OpenAI-compatible proxy over CLI agent workers")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "openclaw.toml")]
    config: PathBuf,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Log filter, e.g. `info` or `openclaw_gateway=debug`.
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = args
        .log
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut cfg = if args.config.exists() {
        Config::load(&args.config).await?
    } else {
        warn!(path = %args.config.display(), "config file not found, using defaults");
        Config::default()
    };
    cfg.apply_env_overrides();
    if let Some(port) = args.port {
        cfg.port = port;
    }
    cfg.validate().context("invalid configuration")?;
    let cfg = Arc::new(cfg);

    info!(
        port = cfg.port,
        workers = cfg.workers.len(),
        credentials = cfg.token_pool.len(),
        "starting openclaw gateway"
    );

    let store: Option<Arc<dyn DurableStore>> = Some(Arc::new(MemoryStore::new()));
    let shutdown = CancellationToken::new();

    let events = Arc::new(EventLog::new(cfg.max_events, store.clone()));
    let counters = Arc::new(DispatcherCounters::new());
    let tokens = Arc::new(TokenLedger::new(store.clone()));

    let queue = FairQueue::new(QueueConfig {
        max_concurrent: cfg.max_concurrent,
        max_queue_total: cfg.max_queue_total,
        max_queue_per_source: cfg.max_queue_per_source,
        default_source_cap: cfg.default_source_concurrency,
        source_caps: cfg.source_concurrency_limits.clone(),
        queue_timeout: Duration::from_millis(cfg.queue_timeout_ms),
        max_lease: Duration::from_millis(cfg.max_lease_ms),
        sweep_interval: QUEUE_SWEEP_INTERVAL,
    });
    let _queue_sweeper = queue.spawn_sweeper(shutdown.clone());

    let limits: HashMap<ModelFamily, _> = ModelFamily::all()
        .into_iter()
        .map(|model| (model, cfg.rate_limit_for(model)))
        .collect();
    let limiter = Arc::new(RateLimiter::new(limits, store.clone()));

    let affinity = Arc::new(SessionAffinity::new(AFFINITY_TTL));
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
        store.clone(),
    );
    registry.restore().await;
    {
        let events = Arc::clone(&events);
        registry.set_reap_hook(Box::new(move |entry, reason| {
            events.emit(
                "process_reaped",
                json!({
                    "pid": entry.pid,
                    "worker": entry.worker,
                    "requestId": entry.request_id,
                    "reason": reason,
                }),
            );
        }));
    }
    let _reaper = registry.spawn_reaper(shutdown.clone());

    let launcher = Arc::new(WorkerLauncher::new(cfg.workers.clone()));
    let warm = WarmPool::new(
        WarmConfig {
            enabled: cfg.warm_pool.enabled,
            max_per_key: cfg.warm_pool.size,
            max_age: Duration::from_millis(cfg.warm_pool.max_age_ms),
        },
        Arc::clone(&launcher),
    );

    let direct = if cfg.token_pool.is_empty() {
        None
    } else {
        let credentials = cfg
            .token_pool
            .iter()
            .map(|entry| Credential {
                name: entry.name.clone(),
                secret: entry.token.clone(),
                kind: match entry.kind {
                    TokenKind::Flat => CredentialKind::Flat,
                    TokenKind::Metered => CredentialKind::Metered,
                },
            })
            .collect();
        Some(Arc::new(AnthropicClient::new(
            cfg.anthropic_base_url.clone(),
            CredentialPool::new(credentials),
        )))
    };

    let dispatcher = Arc::new(Dispatcher {
        cfg: Arc::clone(&cfg),
        queue: Arc::clone(&queue),
        limiter,
        router: Arc::clone(&router),
        affinity: Arc::clone(&affinity),
        registry: Arc::clone(&registry),
        warm: Arc::clone(&warm),
        launcher,
        direct,
        events: Arc::clone(&events),
        counters,
        tokens,
        store: store.clone(),
        http: reqwest::Client::new(),
    });

    spawn_background_tasks(&dispatcher, shutdown.clone()).await;

    let state = Arc::new(AppState {
        dispatcher: Arc::clone(&dispatcher),
        started_at: std::time::Instant::now(),
    });

    let shutdown_signal = shutdown.clone();
    let serve_result = server::serve(state, cfg.port, async move {
        wait_for_signal().await;
        shutdown_signal.cancel();
    })
    .await;

    info!("shutting down: terminating warm pool and registered workers");
    shutdown.cancel();
    warm.shutdown().await;
    let killed = registry.kill_all();
    if killed > 0 {
        info!(killed, "terminated in-flight worker processes");
    }

    serve_result.context("http server failed")?;
    Ok(())
}

/// Periodic maintenance: worker health, affinity TTL, warm pool sweep and
/// initial warm-up, durable metrics snapshots.
async fn spawn_background_tasks(dispatcher: &Arc<Dispatcher>, shutdown: CancellationToken) {
    // Worker health recovery tick, at most every 60 s.
    {
        let router = Arc::clone(&dispatcher.router);
        let events = Arc::clone(&dispatcher.events);
        let interval = Duration::from_millis(dispatcher.cfg.health_check_ms.min(60_000)).max(Duration::from_secs(1));
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        for worker in router.health_sweep() {
                            events.emit("worker_recovered", json!({ "worker": worker }));
                        }
                    }
                }
            }
        });
    }

    // Affinity TTL sweep.
    {
        let affinity = Arc::clone(&dispatcher.affinity);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(AFFINITY_TTL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => affinity.sweep(),
                }
            }
        });
    }

    // Warm pool: boot-time warm-up for the default streaming key of every
    // worker, then periodic sweeps.
    if dispatcher.cfg.warm_pool.enabled {
        for worker in dispatcher.launcher.names() {
            dispatcher
                .warm
                .warm_up(&WarmKey::new(ModelFamily::Sonnet, true, worker))
                .await;
        }
        let warm = Arc::clone(&dispatcher.warm);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WARM_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => warm.sweep().await,
                }
            }
        });
    }

    // Durable time series of metrics snapshots.
    {
        let dispatcher = Arc::clone(dispatcher);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(METRICS_SNAPSHOT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let snapshot = json!({
                            "queue": dispatcher.queue.stats(),
                            "worker_stats": dispatcher.counters.stats(),
                            "tokens": dispatcher.tokens.stats(),
                        });
                        let now = chrono::Utc::now().timestamp() as f64;
                        store::fire_and_forget(&dispatcher.store, move |store| async move {
                            store.zadd(keys::METRICS_TS, now, snapshot.to_string()).await;
                        });
                    }
                }
            }
        });
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
