//! Durable-store seam: hash/list/zset semantics over any backing store.
//!
//! All writes from the hot path are fire-and-forget; in-memory component
//! state stays authoritative and correctness never depends on the store.
//! The in-memory implementation backs single-process deployments and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

/// Well-known key layout shared by every component that mirrors state.
pub mod keys {
    pub const PROC_ENTRIES: &str = "procs:entries";
    pub const PROC_METRICS: &str = "procs:metrics";
    pub const TOKEN_MODELS: &str = "tokens:models";
    pub const TOKEN_REQUESTS: &str = "tokens:requests";
    pub const EVENTS: &str = "events";
    pub const EVENTS_NEXT_ID: &str = "events:nextId";
    pub const EVENTS_COUNTS: &str = "events:counts";
    pub const METRICS_TS: &str = "metrics:ts";

    pub fn rate_window(model: &str) -> String {
        format!("rate:{model}")
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn hset(&self, key: &str, field: &str, value: String);
    async fn hdel(&self, key: &str, field: &str);
    async fn hget_all(&self, key: &str) -> HashMap<String, String>;
    async fn hincr_by(&self, key: &str, field: &str, delta: i64);

    /// Push to the head and trim the list to `cap` entries.
    async fn lpush_trim(&self, key: &str, value: String, cap: usize);
    async fn lrange(&self, key: &str, start: usize, stop: usize) -> Vec<String>;

    async fn zadd(&self, key: &str, score: f64, member: String);
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64);

    async fn set(&self, key: &str, value: String);
    async fn get(&self, key: &str) -> Option<String>;
}

/// Spawn a store write without waiting on it. The closure receives the
/// cloned handle; errors are the store's problem, not the hot path's.
pub fn fire_and_forget<F, Fut>(store: &Option<Arc<dyn DurableStore>>, f: F)
where
    F: FnOnce(Arc<dyn DurableStore>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if let Some(store) = store {
        let store = Arc::clone(store);
        tokio::spawn(f(store));
    }
}

#[derive(Default)]
pub struct MemoryStore {
    hashes: DashMap<String, HashMap<String, String>>,
    lists: DashMap<String, VecDeque<String>>,
    zsets: DashMap<String, Vec<(f64, String)>>,
    kv: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn hset(&self, key: &str, field: &str, value: String) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    async fn hdel(&self, key: &str, field: &str) {
        if let Some(mut hash) = self.hashes.get_mut(key) {
            hash.remove(field);
        }
    }

    async fn hget_all(&self, key: &str) -> HashMap<String, String> {
        self.hashes
            .get(key)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        let current: i64 = hash
            .get(field)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        hash.insert(field.to_string(), (current + delta).to_string());
    }

    async fn lpush_trim(&self, key: &str, value: String, cap: usize) {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_front(value);
        list.truncate(cap);
    }

    async fn lrange(&self, key: &str, start: usize, stop: usize) -> Vec<String> {
        self.lists
            .get(key)
            .map(|l| {
                l.iter()
                    .skip(start)
                    .take(stop.saturating_sub(start) + 1)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn zadd(&self, key: &str, score: f64, member: String) {
        let mut zset = self.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != &member);
        let pos = zset.partition_point(|(s, _)| *s <= score);
        zset.insert(pos, (score, member));
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) {
        if let Some(mut zset) = self.zsets.get_mut(key) {
            zset.retain(|(s, _)| *s < min || *s > max);
        }
    }

    async fn set(&self, key: &str, value: String) {
        self.kv.insert(key.to_string(), value);
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.kv.get(key).map(|v| v.clone())
    }
}
