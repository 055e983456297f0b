//! Fair queue: per-source priority queues, round-robin dispatch across
//! sources, global and per-source concurrency caps, and leak-swept leases.
//!
//! All state lives behind one mutex; every operation (acquire, release,
//! sweep) completes its mutation inside a single critical section so
//! observers never see a partial grant.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("timed out waiting for a queue slot")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_queue_total: usize,
    pub max_queue_per_source: usize,
    pub default_source_cap: usize,
    pub source_caps: HashMap<String, usize>,
    pub queue_timeout: Duration,
    pub max_lease: Duration,
    pub sweep_interval: Duration,
}

impl QueueConfig {
    fn source_cap(&self, source: &str) -> usize {
        self.source_caps
            .get(source)
            .copied()
            .unwrap_or(self.default_source_cap)
    }
}

struct Waiter {
    priority: Priority,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<Lease, QueueError>>,
}

struct LeaseInfo {
    source: String,
    acquired_at: Instant,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SourceStats {
    pub active: usize,
    pub queued: usize,
    pub processed: u64,
    pub throttled: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub active: usize,
    pub queued: usize,
    pub processed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub leaked: u64,
    pub per_source: HashMap<String, SourceStats>,
}

#[derive(Default)]
struct SourceCounters {
    processed: u64,
    throttled: u64,
}

struct State {
    queues: HashMap<String, VecDeque<Waiter>>,
    /// Sources that currently have queued entries, in rotation order.
    rotation: Vec<String>,
    cursor: usize,
    queued_total: usize,
    active_total: usize,
    active_by_source: HashMap<String, usize>,
    leases: HashMap<u64, LeaseInfo>,
    next_lease_id: u64,
    processed: u64,
    timed_out: u64,
    rejected: u64,
    leaked: u64,
    per_source: HashMap<String, SourceCounters>,
}

impl State {
    fn active_for(&self, source: &str) -> usize {
        self.active_by_source.get(source).copied().unwrap_or(0)
    }
}

pub struct FairQueue {
    cfg: QueueConfig,
    state: Mutex<State>,
}

/// Single-use token for one global concurrency slot. Release is idempotent:
/// the second and later invocations are no-ops, and a lease force-released
/// by the leak sweep ignores its eventual late release.
pub struct Lease {
    id: u64,
    queue: Arc<FairQueue>,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn release(&self) {
        self.queue.release_lease(self.id);
    }
}

impl FairQueue {
    pub fn new(cfg: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            state: Mutex::new(State {
                queues: HashMap::new(),
                rotation: Vec::new(),
                cursor: 0,
                queued_total: 0,
                active_total: 0,
                active_by_source: HashMap::new(),
                leases: HashMap::new(),
                next_lease_id: 1,
                processed: 0,
                timed_out: 0,
                rejected: 0,
                leaked: 0,
                per_source: HashMap::new(),
            }),
        })
    }

    /// Wait for one global concurrency slot. Fails fast with `Full` when a
    /// cap is hit, and with `Timeout` when the entry outlives
    /// `queue_timeout` (enforced by the sweep).
    pub async fn acquire(
        self: &Arc<Self>,
        source: &str,
        priority: Priority,
    ) -> Result<Lease, QueueError> {
        let rx = {
            let mut st = self.state.lock().expect("queue state poisoned");

            // Fast path: free slot, source under its cap, nothing waiting.
            if st.queued_total == 0
                && st.active_total < self.cfg.max_concurrent
                && st.active_for(source) < self.cfg.source_cap(source)
            {
                return Ok(self.grant_locked(&mut st, source));
            }

            let source_queued = st.queues.get(source).map_or(0, VecDeque::len);
            if st.queued_total >= self.cfg.max_queue_total
                || source_queued >= self.cfg.max_queue_per_source
            {
                st.rejected += 1;
                st.per_source
                    .entry(source.to_string())
                    .or_default()
                    .throttled += 1;
                return Err(QueueError::Full);
            }

            st.per_source
                .entry(source.to_string())
                .or_default()
                .throttled += 1;

            let (tx, rx) = oneshot::channel();
            let waiter = Waiter {
                priority,
                enqueued_at: Instant::now(),
                tx,
            };
            let q = st.queues.entry(source.to_string()).or_default();
            // Priority-sorted insertion, stable within equal priority.
            let pos = q
                .iter()
                .rposition(|w| w.priority <= priority)
                .map_or(0, |p| p + 1);
            q.insert(pos, waiter);
            if !st.rotation.iter().any(|s| s == source) {
                st.rotation.push(source.to_string());
            }
            st.queued_total += 1;
            rx
        };

        match rx.await {
            Ok(result) => result,
            // The queue was torn down while we waited.
            Err(_) => Err(QueueError::Timeout),
        }
    }

    fn grant_locked(self: &Arc<Self>, st: &mut State, source: &str) -> Lease {
        let id = st.next_lease_id;
        st.next_lease_id += 1;
        st.leases.insert(
            id,
            LeaseInfo {
                source: source.to_string(),
                acquired_at: Instant::now(),
            },
        );
        st.active_total += 1;
        *st.active_by_source.entry(source.to_string()).or_insert(0) += 1;
        st.processed += 1;
        st.per_source
            .entry(source.to_string())
            .or_default()
            .processed += 1;
        Lease {
            id,
            queue: Arc::clone(self),
        }
    }

    fn release_locked(&self, st: &mut State, id: u64) -> bool {
        let Some(info) = st.leases.remove(&id) else {
            return false;
        };
        st.active_total = st.active_total.saturating_sub(1);
        if let Some(active) = st.active_by_source.get_mut(&info.source) {
            *active = active.saturating_sub(1);
        }
        true
    }

    fn release_lease(self: &Arc<Self>, id: u64) {
        let mut st = self.state.lock().expect("queue state poisoned");
        if self.release_locked(&mut st, id) {
            self.dispatch_locked(&mut st);
        }
    }

    /// Grant queued entries while slots are free. The cursor advances past
    /// the chosen source; sources at their per-source cap are skipped but
    /// remain in rotation.
    fn dispatch_locked(self: &Arc<Self>, st: &mut State) {
        while st.active_total < self.cfg.max_concurrent && st.queued_total > 0 {
            let n = st.rotation.len();
            if n == 0 {
                break;
            }
            let mut chosen = None;
            for step in 0..n {
                let idx = (st.cursor + step) % n;
                let source = &st.rotation[idx];
                let has_waiters = st.queues.get(source).is_some_and(|q| !q.is_empty());
                if has_waiters && st.active_for(source) < self.cfg.source_cap(source) {
                    chosen = Some(idx);
                    break;
                }
            }
            let Some(idx) = chosen else {
                break;
            };
            st.cursor = (idx + 1) % n;
            let source = st.rotation[idx].clone();
            let waiter = st
                .queues
                .get_mut(&source)
                .and_then(VecDeque::pop_front)
                .expect("chosen source has a waiter");
            st.queued_total -= 1;

            let lease = self.grant_locked(st, &source);
            let lease_id = lease.id;
            if waiter.tx.send(Ok(lease)).is_err() {
                // Waiter dropped its future; take the slot back.
                self.release_locked(st, lease_id);
            }
            Self::prune_rotation(st);
        }
        Self::prune_rotation(st);
    }

    fn prune_rotation(st: &mut State) {
        let mut i = 0;
        while i < st.rotation.len() {
            let empty = st
                .queues
                .get(&st.rotation[i])
                .map_or(true, VecDeque::is_empty);
            if empty {
                let source = st.rotation.remove(i);
                st.queues.remove(&source);
                if st.cursor > i {
                    st.cursor -= 1;
                }
            } else {
                i += 1;
            }
        }
        if st.rotation.is_empty() {
            st.cursor = 0;
        } else {
            st.cursor %= st.rotation.len();
        }
    }

    /// Periodic maintenance: evict queue entries past the queue timeout,
    /// force-release leases held past the lease cap, then re-dispatch.
    pub fn sweep(self: &Arc<Self>) {
        let mut st = self.state.lock().expect("queue state poisoned");

        let timeout = self.cfg.queue_timeout;
        let mut expired = 0u64;
        for q in st.queues.values_mut() {
            let mut kept = VecDeque::with_capacity(q.len());
            while let Some(waiter) = q.pop_front() {
                if waiter.enqueued_at.elapsed() >= timeout {
                    expired += 1;
                    let _ = waiter.tx.send(Err(QueueError::Timeout));
                } else {
                    kept.push_back(waiter);
                }
            }
            *q = kept;
        }
        st.timed_out += expired;
        st.queued_total = st.queued_total.saturating_sub(expired as usize);

        let max_lease = self.cfg.max_lease;
        let leaked: Vec<u64> = st
            .leases
            .iter()
            .filter(|(_, info)| info.acquired_at.elapsed() >= max_lease)
            .map(|(id, _)| *id)
            .collect();
        for id in leaked {
            if self.release_locked(&mut st, id) {
                st.leaked += 1;
                warn!(lease_id = id, "force-released leaked queue lease");
            }
        }

        Self::prune_rotation(&mut st);
        self.dispatch_locked(&mut st);
    }

    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(queue.cfg.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => queue.sweep(),
                }
            }
            debug!("queue sweeper stopped");
        })
    }

    pub fn stats(&self) -> QueueStats {
        let st = self.state.lock().expect("queue state poisoned");
        let mut per_source: HashMap<String, SourceStats> = HashMap::new();
        for (source, counters) in &st.per_source {
            per_source.insert(
                source.clone(),
                SourceStats {
                    active: st.active_for(source),
                    queued: st.queues.get(source).map_or(0, VecDeque::len),
                    processed: counters.processed,
                    throttled: counters.throttled,
                },
            );
        }
        QueueStats {
            active: st.active_total,
            queued: st.queued_total,
            processed: st.processed,
            timed_out: st.timed_out,
            rejected: st.rejected,
            leaked: st.leaked,
            per_source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn config(max_concurrent: usize) -> QueueConfig {
        QueueConfig {
            max_concurrent,
            max_queue_total: 100,
            max_queue_per_source: 50,
            default_source_cap: 10,
            source_caps: HashMap::new(),
            queue_timeout: Duration::from_millis(50),
            max_lease: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
        }
    }

    /// Acquire in a task and record the grant order in `order`.
    fn submit(
        queue: &Arc<FairQueue>,
        order: &Arc<StdMutex<Vec<String>>>,
        tag: &str,
        source: &str,
        priority: Priority,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(queue);
        let order = Arc::clone(order);
        let tag = tag.to_string();
        let source = source.to_string();
        tokio::spawn(async move {
            let lease = queue.acquire(&source, priority).await.unwrap();
            order.lock().unwrap().push(tag);
            lease.release();
        })
    }

    #[tokio::test(start_paused = true)]
    async fn round_robin_across_sources() {
        let queue = FairQueue::new(config(1));
        let order = Arc::new(StdMutex::new(Vec::new()));

        // Hold the only slot so all eight submissions queue up.
        let blocker = queue.acquire("warm", Priority::Normal).await.unwrap();
        let mut handles = Vec::new();
        for i in 1..=4 {
            handles.push(submit(&queue, &order, &format!("A{i}"), "a", Priority::Normal));
            tokio::task::yield_now().await;
            handles.push(submit(&queue, &order, &format!("B{i}"), "b", Priority::Normal));
            tokio::task::yield_now().await;
        }
        blocker.release();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            ["A1", "B1", "A2", "B2", "A3", "B3", "A4", "B4"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn priority_then_fifo_within_source() {
        let queue = FairQueue::new(config(1));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let blocker = queue.acquire("warm", Priority::Normal).await.unwrap();
        let submissions = [
            ("low1", Priority::Low),
            ("low2", Priority::Low),
            ("high1", Priority::High),
            ("normal1", Priority::Normal),
            ("high2", Priority::High),
            ("low3", Priority::Low),
        ];
        let mut handles = Vec::new();
        for (tag, priority) in submissions {
            handles.push(submit(&queue, &order, tag, "s", priority));
            tokio::task::yield_now().await;
        }
        blocker.release();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            ["high1", "high2", "normal1", "low1", "low2", "low3"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn queue_timeout_rejects_waiters() {
        let queue = FairQueue::new(config(0));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.acquire("s", Priority::Normal).await })
        };
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(60)).await;
        queue.sweep();

        assert!(matches!(waiter.await.unwrap(), Err(QueueError::Timeout)));
        let stats = queue.stats();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_full_rejects_immediately() {
        let mut cfg = config(1);
        cfg.max_queue_per_source = 1;
        let queue = FairQueue::new(cfg);

        let _held = queue.acquire("s", Priority::Normal).await.unwrap();
        let queued = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.acquire("s", Priority::Normal).await })
        };
        tokio::task::yield_now().await;
        // Per-source queue cap reached.
        assert!(matches!(
            queue.acquire("s", Priority::Normal).await,
            Err(QueueError::Full)
        ));
        assert_eq!(queue.stats().rejected, 1);
        queued.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn leaked_lease_is_force_released() {
        let mut cfg = config(1);
        cfg.max_lease = Duration::from_millis(100);
        let queue = FairQueue::new(cfg);

        let lease = queue.acquire("s", Priority::Normal).await.unwrap();
        std::mem::forget(lease);
        assert_eq!(queue.stats().active, 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        queue.sweep();

        let stats = queue.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.leaked, 1);
        // A new acquire succeeds on the recovered slot.
        let lease = queue.acquire("s", Priority::Normal).await.unwrap();
        lease.release();
    }

    #[tokio::test(start_paused = true)]
    async fn release_is_idempotent() {
        let queue = FairQueue::new(config(2));
        let a = queue.acquire("s", Priority::Normal).await.unwrap();
        let b = queue.acquire("s", Priority::Normal).await.unwrap();
        assert_eq!(queue.stats().active, 2);
        a.release();
        a.release();
        a.release();
        assert_eq!(queue.stats().active, 1);
        b.release();
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn source_at_cap_is_skipped_but_not_starved() {
        let mut cfg = config(2);
        cfg.source_caps.insert("capped".to_string(), 1);
        let queue = FairQueue::new(cfg);
        let order = Arc::new(StdMutex::new(Vec::new()));

        // "capped" holds its single per-source slot.
        let held = queue.acquire("capped", Priority::Normal).await.unwrap();
        let blocked = submit(&queue, &order, "capped2", "capped", Priority::Normal);
        tokio::task::yield_now().await;
        let other = submit(&queue, &order, "other1", "other", Priority::Normal);
        tokio::task::yield_now().await;

        // Dispatch skips the capped source and grants the other one.
        queue.sweep();
        other.await.unwrap();
        assert_eq!(order.lock().unwrap().as_slice(), ["other1"]);

        // Releasing unblocks the capped source's waiter.
        held.release();
        blocked.await.unwrap();
        assert_eq!(order.lock().unwrap().as_slice(), ["other1", "capped2"]);
    }
}
