//! Worker pool routing: health tracking, degraded-mode failover and
//! least-active-connections selection with session-affinity tiebreak.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::affinity::SessionAffinity;
use crate::config::WorkerSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// All traffic spread by least active connections.
    LoadBalance,
    /// At least one worker is rate-limited: concentrate on the primary.
    Degraded,
}

struct WorkerSlot {
    spec: WorkerSpec,
    limited: bool,
    limited_at: Option<Instant>,
    active: usize,
    total: u64,
}

struct RouterState {
    workers: Vec<WorkerSlot>,
    mode: PoolMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub name: String,
    pub limited: bool,
    pub limited_for_ms: Option<u64>,
    pub active: usize,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub mode: PoolMode,
    pub workers: Vec<WorkerStats>,
}

pub struct WorkerRouter {
    state: Mutex<RouterState>,
    affinity: Arc<SessionAffinity>,
    primary: Option<String>,
    cooldown: Duration,
}

impl WorkerRouter {
    pub fn new(
        specs: Vec<WorkerSpec>,
        primary: Option<String>,
        cooldown: Duration,
        affinity: Arc<SessionAffinity>,
    ) -> Self {
        let workers = specs
            .into_iter()
            .map(|spec| WorkerSlot {
                spec,
                limited: false,
                limited_at: None,
                active: 0,
                total: 0,
            })
            .collect();
        Self {
            state: Mutex::new(RouterState {
                workers,
                mode: PoolMode::LoadBalance,
            }),
            affinity,
            primary,
            cooldown,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.state.lock().expect("router state poisoned").workers.len()
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("router state poisoned")
            .workers
            .iter()
            .map(|w| w.spec.name.clone())
            .collect()
    }

    /// Pick the next worker and take one connection on it. `exclude` lists
    /// workers already tried this request; they are avoided while an
    /// untried healthy worker remains.
    pub fn select(&self, session_key: Option<&str>, exclude: &[String]) -> Option<String> {
        let mut st = self.state.lock().expect("router state poisoned");
        let idx = match st.mode {
            PoolMode::LoadBalance => self.select_least_loaded(&st, session_key, exclude),
            PoolMode::Degraded => self.select_degraded(&st, exclude),
        }?;
        let slot = &mut st.workers[idx];
        slot.active += 1;
        slot.total += 1;
        let name = slot.spec.name.clone();
        if let Some(key) = session_key {
            self.affinity.assign(key, &name);
        }
        Some(name)
    }

    fn candidate_indices(st: &RouterState, exclude: &[String]) -> Vec<usize> {
        let healthy: Vec<usize> = st
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| !w.limited)
            .map(|(i, _)| i)
            .collect();
        let untried: Vec<usize> = healthy
            .iter()
            .copied()
            .filter(|&i| !exclude.contains(&st.workers[i].spec.name))
            .collect();
        if untried.is_empty() {
            healthy
        } else {
            untried
        }
    }

    fn select_least_loaded(
        &self,
        st: &RouterState,
        session_key: Option<&str>,
        exclude: &[String],
    ) -> Option<usize> {
        let candidates = Self::candidate_indices(st, exclude);
        let best = candidates
            .iter()
            .copied()
            .min_by_key(|&i| (st.workers[i].active, st.workers[i].total))?;

        // Affinity wins only when the bound worker is strictly less loaded
        // than every other candidate (or is the sole candidate).
        if let Some(bound) = session_key.and_then(|key| self.affinity.lookup(key)) {
            if let Some(aff_idx) = candidates
                .iter()
                .copied()
                .find(|&i| st.workers[i].spec.name == bound)
            {
                let others_min = candidates
                    .iter()
                    .copied()
                    .filter(|&i| i != aff_idx)
                    .map(|i| st.workers[i].active)
                    .min();
                match others_min {
                    None => return Some(aff_idx),
                    Some(m) if st.workers[aff_idx].active < m => return Some(aff_idx),
                    _ => {}
                }
            }
        }
        Some(best)
    }

    fn select_degraded(&self, st: &RouterState, exclude: &[String]) -> Option<usize> {
        let candidates = Self::candidate_indices(st, exclude);
        if let Some(primary) = &self.primary {
            if let Some(idx) = candidates
                .iter()
                .copied()
                .find(|&i| &st.workers[i].spec.name == primary)
            {
                return Some(idx);
            }
        }
        if let Some(idx) = candidates.first().copied() {
            return Some(idx);
        }
        // Everyone is limited: last-resort attempt to revive the worker
        // that has been limited longest.
        st.workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.limited)
            .min_by_key(|(_, w)| w.limited_at.unwrap_or_else(Instant::now))
            .map(|(i, _)| i)
    }

    /// Drop one connection for this worker after its process terminates.
    pub fn release(&self, name: &str) {
        let mut st = self.state.lock().expect("router state poisoned");
        if let Some(slot) = st.workers.iter_mut().find(|w| w.spec.name == name) {
            slot.active = slot.active.saturating_sub(1);
        }
    }

    /// Rate-limit classification on a worker's failure output: flag the
    /// worker and concentrate traffic on the primary.
    pub fn mark_limited(&self, name: &str) {
        let mut st = self.state.lock().expect("router state poisoned");
        if let Some(slot) = st.workers.iter_mut().find(|w| w.spec.name == name) {
            slot.limited = true;
            slot.limited_at = Some(Instant::now());
        }
        if st.mode != PoolMode::Degraded {
            st.mode = PoolMode::Degraded;
            warn!(worker = name, "worker rate-limited, pool degraded");
        }
    }

    /// Health tick: limited workers recover after the cooldown; two healthy
    /// workers restore load balancing. Returns the recovered names.
    pub fn health_sweep(&self) -> Vec<String> {
        let mut st = self.state.lock().expect("router state poisoned");
        let mut recovered = Vec::new();
        for slot in &mut st.workers {
            if slot.limited
                && slot
                    .limited_at
                    .is_some_and(|at| at.elapsed() >= self.cooldown)
            {
                slot.limited = false;
                slot.limited_at = None;
                recovered.push(slot.spec.name.clone());
            }
        }
        let healthy = st.workers.iter().filter(|w| !w.limited).count();
        if st.mode == PoolMode::Degraded && healthy >= 2 {
            st.mode = PoolMode::LoadBalance;
            info!(healthy, "worker pool back in load-balance mode");
        }
        recovered
    }

    pub fn healthy_count(&self) -> usize {
        self.state
            .lock()
            .expect("router state poisoned")
            .workers
            .iter()
            .filter(|w| !w.limited)
            .count()
    }

    pub fn mode(&self) -> PoolMode {
        self.state.lock().expect("router state poisoned").mode
    }

    pub fn stats(&self) -> RouterStats {
        let st = self.state.lock().expect("router state poisoned");
        RouterStats {
            mode: st.mode,
            workers: st
                .workers
                .iter()
                .map(|w| WorkerStats {
                    name: w.spec.name.clone(),
                    limited: w.limited,
                    limited_for_ms: w.limited_at.map(|at| at.elapsed().as_millis() as u64),
                    active: w.active,
                    total: w.total,
                })
                .collect(),
        }
    }
}
