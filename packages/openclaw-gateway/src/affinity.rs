//! Session-to-worker stickiness with an idle TTL.

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::trace;

struct AffinityEntry {
    worker: String,
    last_used: Instant,
    requests: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AffinityStats {
    pub entries: usize,
}

pub struct SessionAffinity {
    entries: DashMap<String, AffinityEntry>,
    ttl: Duration,
}

impl SessionAffinity {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// The worker bound to this session, if the binding is still fresh.
    /// Health is the router's call; stale entries are dropped here.
    pub fn lookup(&self, key: &str) -> Option<String> {
        let fresh = {
            let entry = self.entries.get(key)?;
            if entry.last_used.elapsed() < self.ttl {
                Some(entry.worker.clone())
            } else {
                None
            }
        };
        if fresh.is_none() {
            self.entries.remove(key);
        }
        fresh
    }

    /// Bind (or re-assert) the session's worker and refresh its TTL.
    pub fn assign(&self, key: &str, worker: &str) {
        let mut entry = self.entries.entry(key.to_string()).or_insert(AffinityEntry {
            worker: worker.to_string(),
            last_used: Instant::now(),
            requests: 0,
        });
        if entry.worker != worker {
            entry.worker = worker.to_string();
            entry.requests = 0;
        }
        entry.requests += 1;
        entry.last_used = Instant::now();
        trace!(key, worker, requests = entry.requests, "affinity assigned");
    }

    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.last_used.elapsed() < ttl);
    }

    pub fn stats(&self) -> AffinityStats {
        AffinityStats {
            entries: self.entries.len(),
        }
    }
}

/// Stable-per-conversation key: explicit session id, else a fingerprint of
/// the system prompt scoped to the source, else the source alone.
pub fn derive_session_key(
    source: &str,
    explicit: Option<&str>,
    system_prompt: Option<&str>,
) -> String {
    if let Some(id) = explicit {
        return format!("sid:{id}");
    }
    if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
        let prefix = &system.as_bytes()[..system.len().min(256)];
        return format!("{source}:{:08x}", fnv1a32(prefix));
    }
    format!("src:{source}")
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_idle_ttl() {
        let affinity = SessionAffinity::new(Duration::from_secs(300));
        affinity.assign("sid:a", "w1");
        assert_eq!(affinity.lookup("sid:a").as_deref(), Some("w1"));

        tokio::time::advance(Duration::from_secs(299)).await;
        // A fresh lookup does not renew the TTL.
        assert_eq!(affinity.lookup("sid:a").as_deref(), Some("w1"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(affinity.lookup("sid:a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn assign_renews_ttl_and_counts_requests() {
        let affinity = SessionAffinity::new(Duration::from_secs(10));
        affinity.assign("k", "w1");
        tokio::time::advance(Duration::from_secs(8)).await;
        affinity.assign("k", "w1");
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(affinity.lookup("k").as_deref(), Some("w1"));
    }

    #[tokio::test(start_paused = true)]
    async fn reassignment_switches_worker() {
        let affinity = SessionAffinity::new(Duration::from_secs(10));
        affinity.assign("k", "w1");
        affinity.assign("k", "w2");
        assert_eq!(affinity.lookup("k").as_deref(), Some("w2"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_stale_entries() {
        let affinity = SessionAffinity::new(Duration::from_secs(5));
        affinity.assign("a", "w1");
        tokio::time::advance(Duration::from_secs(6)).await;
        affinity.assign("b", "w1");
        affinity.sweep();
        assert_eq!(affinity.stats().entries, 1);
        assert_eq!(affinity.lookup("b").as_deref(), Some("w1"));
    }

    #[test]
    fn session_key_prefers_explicit_id() {
        assert_eq!(
            derive_session_key("src", Some("abc"), Some("sys")),
            "sid:abc"
        );
    }

    #[test]
    fn session_key_fingerprints_system_prompt_per_source() {
        let a = derive_session_key("src1", None, Some("You are a helpful bot"));
        let b = derive_session_key("src1", None, Some("You are a helpful bot"));
        let c = derive_session_key("src1", None, Some("Different prompt"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("src1:"));
    }

    #[test]
    fn session_key_falls_back_to_source() {
        assert_eq!(derive_session_key("src9", None, None), "src:src9");
        assert_eq!(derive_session_key("src9", None, Some("")), "src:src9");
    }
}
