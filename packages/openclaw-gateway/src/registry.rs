//! Process registry: ground truth for spawned worker children, with a
//! periodic zombie reaper.

use std::sync::{Arc, Mutex};

use atomic_counter::{AtomicCounter, RelaxedCounter};
use dashmap::DashMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::json;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::openai::ModelFamily;
use crate::store::{self, keys, DurableStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    Sync,
    Stream,
}

#[derive(Clone)]
pub struct RegistryEntry {
    pub pid: u32,
    pub request_id: String,
    pub model: ModelFamily,
    pub mode: WorkerMode,
    pub source: String,
    pub worker: String,
    pub spawned_at: Instant,
    pub last_activity_at: Instant,
    /// Wall-clock spawn time, for persistence and dashboards.
    pub spawned_at_ms: i64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl RegistryEntry {
    pub fn new(
        pid: u32,
        request_id: &str,
        model: ModelFamily,
        mode: WorkerMode,
        source: &str,
        worker: &str,
    ) -> Self {
        let now = Instant::now();
        Self {
            pid,
            request_id: request_id.to_string(),
            model,
            mode,
            source: source.to_string(),
            worker: worker.to_string(),
            spawned_at: now,
            last_activity_at: now,
            spawned_at_ms: chrono::Utc::now().timestamp_millis(),
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    fn persisted(&self) -> String {
        json!({
            "pid": self.pid,
            "requestId": self.request_id,
            "model": self.model.as_str(),
            "mode": self.mode,
            "source": self.source,
            "worker": self.worker,
            "spawnedAt": self.spawned_at_ms,
            "tokensIn": self.tokens_in,
            "tokensOut": self.tokens_out,
        })
        .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_age: Duration,
    pub max_idle: Duration,
    pub reaper_interval: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub live: usize,
    pub registered_total: usize,
    pub reaped: usize,
    pub killed: usize,
}

type ReapHook = Box<dyn Fn(&RegistryEntry, &'static str) + Send + Sync>;

pub struct ProcessRegistry {
    entries: DashMap<u32, RegistryEntry>,
    cfg: RegistryConfig,
    on_reap: Mutex<Option<ReapHook>>,
    registered_total: RelaxedCounter,
    reaped: RelaxedCounter,
    killed: RelaxedCounter,
    store: Option<Arc<dyn DurableStore>>,
}

fn send_term(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
}

fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

impl ProcessRegistry {
    pub fn new(cfg: RegistryConfig, store: Option<Arc<dyn DurableStore>>) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            cfg,
            on_reap: Mutex::new(None),
            registered_total: RelaxedCounter::new(0),
            reaped: RelaxedCounter::new(0),
            killed: RelaxedCounter::new(0),
            store,
        })
    }

    /// Callback invoked for every reaped zombie; upstream wires this into
    /// the event log and metrics.
    pub fn set_reap_hook(&self, hook: ReapHook) {
        *self.on_reap.lock().expect("reap hook poisoned") = Some(hook);
    }

    pub fn register(&self, entry: RegistryEntry) {
        let pid = entry.pid;
        let persisted = entry.persisted();
        self.entries.insert(pid, entry);
        self.registered_total.inc();
        debug!(pid, "worker process registered");
        store::fire_and_forget(&self.store, move |store| async move {
            store
                .hset(keys::PROC_ENTRIES, &pid.to_string(), persisted)
                .await;
        });
    }

    pub fn unregister(&self, pid: u32) -> Option<RegistryEntry> {
        let removed = self.entries.remove(&pid).map(|(_, e)| e);
        if removed.is_some() {
            store::fire_and_forget(&self.store, move |store| async move {
                store.hdel(keys::PROC_ENTRIES, &pid.to_string()).await;
            });
        }
        removed
    }

    /// Refresh activity on output, optionally bumping live token counters.
    pub fn touch(&self, pid: u32, tokens_in: u64, tokens_out: u64) {
        if let Some(mut entry) = self.entries.get_mut(&pid) {
            entry.last_activity_at = Instant::now();
            entry.tokens_in += tokens_in;
            entry.tokens_out += tokens_out;
        }
    }

    pub fn get(&self, pid: u32) -> Option<RegistryEntry> {
        self.entries.get(&pid).map(|e| e.clone())
    }

    pub fn get_all(&self) -> Vec<RegistryEntry> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    /// TERM the child and drop it from the table. Kill of a dead pid is
    /// non-fatal; the entry is removed regardless.
    pub fn kill(&self, pid: u32) -> Option<RegistryEntry> {
        send_term(pid);
        self.killed.inc();
        self.unregister(pid)
    }

    /// A registered child is a zombie when it outlives the age cap or goes
    /// idle past the idle cap.
    pub fn get_zombies(&self) -> Vec<RegistryEntry> {
        self.entries
            .iter()
            .filter(|e| {
                e.spawned_at.elapsed() > self.cfg.max_age
                    || e.last_activity_at.elapsed() > self.cfg.max_idle
            })
            .map(|e| e.clone())
            .collect()
    }

    /// TERM and remove every zombie, invoking the reap hook per entry.
    pub fn reap(&self) -> usize {
        let zombies = self.get_zombies();
        let count = zombies.len();
        for entry in zombies {
            let reason = if entry.spawned_at.elapsed() > self.cfg.max_age {
                "age"
            } else {
                "idle"
            };
            warn!(
                pid = entry.pid,
                worker = %entry.worker,
                reason,
                "reaping zombie worker process"
            );
            send_term(entry.pid);
            self.unregister(entry.pid);
            self.reaped.inc();
            if let Some(hook) = self.on_reap.lock().expect("reap hook poisoned").as_ref() {
                hook(&entry, reason);
            }
        }
        if count > 0 {
            store::fire_and_forget(&self.store, move |store| async move {
                store
                    .hincr_by(keys::PROC_METRICS, "reaped", count as i64)
                    .await;
            });
        }
        count
    }

    /// TERM everything still registered (shutdown path).
    pub fn kill_all(&self) -> usize {
        let pids: Vec<u32> = self.entries.iter().map(|e| e.pid).collect();
        let count = pids.len();
        for pid in pids {
            self.kill(pid);
        }
        count
    }

    /// Startup pass against the durable store: drop pids the OS no longer
    /// lists. In-memory entries stay authoritative while running.
    pub async fn restore(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let persisted = store.hget_all(keys::PROC_ENTRIES).await;
        let mut stale = 0;
        for pid_str in persisted.keys() {
            let alive = pid_str.parse::<u32>().map(pid_alive).unwrap_or(false);
            if !alive {
                store.hdel(keys::PROC_ENTRIES, pid_str).await;
                stale += 1;
            }
        }
        if stale > 0 {
            info!(stale, "cleared stale pids from durable store");
        }
    }

    pub fn spawn_reaper(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.cfg.reaper_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        registry.reap();
                    }
                }
            }
            debug!("process reaper stopped");
        })
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live: self.entries.len(),
            registered_total: self.registered_total.get(),
            reaped: self.reaped.get(),
            killed: self.killed.get(),
        }
    }
}
