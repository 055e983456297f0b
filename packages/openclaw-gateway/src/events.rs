//! Append-only event log with a broadcast mirror for dashboard streams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::store::{self, keys, DurableStore};

#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub id: u64,
    pub ts_ms: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

pub struct EventLog {
    ring: Mutex<VecDeque<GatewayEvent>>,
    next_id: AtomicU64,
    counts: DashMap<String, u64>,
    tx: broadcast::Sender<GatewayEvent>,
    cap: usize,
    store: Option<Arc<dyn DurableStore>>,
}

impl EventLog {
    pub fn new(cap: usize, store: Option<Arc<dyn DurableStore>>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            ring: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            next_id: AtomicU64::new(1),
            counts: DashMap::new(),
            tx,
            cap,
            store,
        }
    }

    pub fn emit(&self, kind: &str, data: Value) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = GatewayEvent {
            id,
            ts_ms: chrono::Utc::now().timestamp_millis(),
            kind: kind.to_string(),
            data,
        };
        *self.counts.entry(kind.to_string()).or_insert(0) += 1;

        {
            let mut ring = self.ring.lock().expect("event ring poisoned");
            ring.push_back(event.clone());
            while ring.len() > self.cap {
                ring.pop_front();
            }
        }
        // Subscribers may lag or be absent; neither matters here.
        let _ = self.tx.send(event.clone());

        let cap = self.cap;
        let kind_owned = kind.to_string();
        store::fire_and_forget(&self.store, move |store| async move {
            let json = serde_json::to_string(&event).unwrap_or_default();
            store.lpush_trim(keys::EVENTS, json, cap).await;
            store.hincr_by(keys::EVENTS_COUNTS, &kind_owned, 1).await;
            store.set(keys::EVENTS_NEXT_ID, (id + 1).to_string()).await;
        });
        id
    }

    /// Tail of the log: events with id > `since_id`, optionally filtered by
    /// type, capped at `limit`.
    pub fn tail(&self, since_id: u64, limit: usize, kind: Option<&str>) -> Vec<GatewayEvent> {
        let ring = self.ring.lock().expect("event ring poisoned");
        ring.iter()
            .filter(|e| e.id > since_id)
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn counts(&self) -> HashMap<String, u64> {
        self.counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ids_are_monotonic_and_ring_is_capped() {
        let log = EventLog::new(3, None);
        for i in 0..5 {
            log.emit("test", json!({ "i": i }));
        }
        let tail = log.tail(0, 100, None);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].id, 3);
        assert_eq!(tail[2].id, 5);
        assert_eq!(*log.counts().get("test").unwrap(), 5);
    }

    #[tokio::test]
    async fn tail_filters_by_since_id_and_type() {
        let log = EventLog::new(100, None);
        log.emit("a", json!({}));
        log.emit("b", json!({}));
        log.emit("a", json!({}));
        assert_eq!(log.tail(1, 100, None).len(), 2);
        assert_eq!(log.tail(0, 100, Some("a")).len(), 2);
        assert_eq!(log.tail(0, 1, None).len(), 1);
    }

    #[tokio::test]
    async fn broadcast_mirrors_emits() {
        let log = EventLog::new(10, None);
        let mut rx = log.subscribe();
        log.emit("ping", json!({ "n": 1 }));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "ping");
        assert_eq!(event.id, 1);
    }
}
