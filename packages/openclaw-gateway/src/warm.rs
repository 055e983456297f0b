//! Warm process pool: pre-spawned workers blocked on stdin, handed off on
//! demand to hide cold-start latency.
//!
//! A warm child emits nothing until its payload arrives, so its pipes stay
//! empty while pooled; exit state is observed by polling `try_wait` inside
//! the pool lock, which keeps eviction atomic with acquisition.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use atomic_counter::{AtomicCounter, RelaxedCounter};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::openai::ModelFamily;
use crate::registry::WorkerMode;
use crate::worker::WorkerLauncher;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WarmKey {
    pub model: ModelFamily,
    pub stream: bool,
    pub worker: String,
}

impl WarmKey {
    pub fn new(model: ModelFamily, stream: bool, worker: &str) -> Self {
        Self {
            model,
            stream,
            worker: worker.to_string(),
        }
    }

    fn mode(&self) -> WorkerMode {
        if self.stream {
            WorkerMode::Stream
        } else {
            WorkerMode::Sync
        }
    }
}

struct WarmEntry {
    child: Child,
    created_at: Instant,
}

#[derive(Debug, Clone)]
pub struct WarmConfig {
    pub enabled: bool,
    pub max_per_key: usize,
    pub max_age: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmStats {
    pub keys: usize,
    pub entries: usize,
    pub spawned: usize,
    pub hits: usize,
    pub misses: usize,
    pub stale_evicted: usize,
    pub dead_evicted: usize,
    pub errors: usize,
}

pub struct WarmPool {
    cfg: WarmConfig,
    launcher: Arc<WorkerLauncher>,
    entries: Mutex<HashMap<WarmKey, VecDeque<WarmEntry>>>,
    spawned: RelaxedCounter,
    hits: RelaxedCounter,
    misses: RelaxedCounter,
    stale_evicted: RelaxedCounter,
    dead_evicted: RelaxedCounter,
    errors: RelaxedCounter,
}

impl WarmPool {
    pub fn new(cfg: WarmConfig, launcher: Arc<WorkerLauncher>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            launcher,
            entries: Mutex::new(HashMap::new()),
            spawned: RelaxedCounter::new(0),
            hits: RelaxedCounter::new(0),
            misses: RelaxedCounter::new(0),
            stale_evicted: RelaxedCounter::new(0),
            dead_evicted: RelaxedCounter::new(0),
            errors: RelaxedCounter::new(0),
        })
    }

    /// Hand off a live, fresh pre-spawned child for this key, if one
    /// exists. Either way one asynchronous `warm_up` is scheduled so the
    /// key replenishes.
    pub async fn acquire(self: &Arc<Self>, key: &WarmKey) -> Option<Child> {
        if !self.cfg.enabled {
            return None;
        }
        let mut handed = None;
        {
            let mut entries = self.entries.lock().await;
            if let Some(queue) = entries.get_mut(key) {
                while let Some(mut entry) = queue.pop_front() {
                    match entry.child.try_wait() {
                        Ok(Some(_)) | Err(_) => {
                            self.dead_evicted.inc();
                            continue;
                        }
                        Ok(None) => {}
                    }
                    if entry.created_at.elapsed() > self.cfg.max_age {
                        let _ = entry.child.start_kill();
                        self.stale_evicted.inc();
                        continue;
                    }
                    handed = Some(entry.child);
                    break;
                }
            }
        }
        if handed.is_some() {
            self.hits.inc();
            debug!(worker = %key.worker, model = key.model.as_str(), "warm pool hit");
        } else {
            self.misses.inc();
        }
        self.schedule_warm_up(key.clone());
        handed
    }

    fn schedule_warm_up(self: &Arc<Self>, key: WarmKey) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.warm_up(&key).await;
        });
    }

    /// Spawn one pre-initialized child for this key if it is under its cap.
    pub async fn warm_up(&self, key: &WarmKey) {
        if !self.cfg.enabled {
            return;
        }
        let mut entries = self.entries.lock().await;
        let queue = entries.entry(key.clone()).or_default();
        let before = queue.len();
        queue.retain_mut(|entry| matches!(entry.child.try_wait(), Ok(None)));
        self.dead_evicted.add(before - queue.len());

        if queue.len() >= self.cfg.max_per_key {
            return;
        }
        match self.launcher.spawn(&key.worker, key.model, key.mode()) {
            Ok(child) => {
                queue.push_back(WarmEntry {
                    child,
                    created_at: Instant::now(),
                });
                self.spawned.inc();
                debug!(
                    worker = %key.worker,
                    model = key.model.as_str(),
                    stream = key.stream,
                    "warm worker spawned"
                );
            }
            Err(e) => {
                self.errors.inc();
                warn!(worker = %key.worker, error = %e, "warm spawn failed");
            }
        }
    }

    /// Evict dead entries and terminate stale ones.
    pub async fn sweep(&self) {
        let mut entries = self.entries.lock().await;
        for queue in entries.values_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(mut entry) = queue.pop_front() {
                match entry.child.try_wait() {
                    Ok(Some(_)) | Err(_) => {
                        self.dead_evicted.inc();
                        continue;
                    }
                    Ok(None) => {}
                }
                if entry.created_at.elapsed() > self.cfg.max_age {
                    let _ = entry.child.start_kill();
                    self.stale_evicted.inc();
                    continue;
                }
                kept.push_back(entry);
            }
            *queue = kept;
        }
        entries.retain(|_, queue| !queue.is_empty());
    }

    /// Terminate every pooled child (shutdown path).
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        for (_, mut queue) in entries.drain() {
            while let Some(mut entry) = queue.pop_front() {
                let _ = entry.child.start_kill();
            }
        }
    }

    pub async fn live_count(&self, key: &WarmKey) -> usize {
        let mut entries = self.entries.lock().await;
        entries.get_mut(key).map_or(0, |queue| {
            queue.retain_mut(|entry| matches!(entry.child.try_wait(), Ok(None)));
            queue.len()
        })
    }

    pub async fn stats(&self) -> WarmStats {
        let entries = self.entries.lock().await;
        WarmStats {
            keys: entries.len(),
            entries: entries.values().map(VecDeque::len).sum(),
            spawned: self.spawned.get(),
            hits: self.hits.get(),
            misses: self.misses.get(),
            stale_evicted: self.stale_evicted.get(),
            dead_evicted: self.dead_evicted.get(),
            errors: self.errors.get(),
        }
    }
}
