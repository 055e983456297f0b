//! Per-model sliding-window rate limiter.
//!
//! A 60-second window of `(timestamp, estimated tokens)` events per model;
//! trimming is lazy (filter at read time). An optional durable mirror
//! pushes each event into a per-model zset, fire-and-forget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimitEntry;
use crate::openai::ModelFamily;
use crate::store::{self, keys, DurableStore};

const WINDOW: Duration = Duration::from_secs(60);
const MIN_WAIT_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Requests,
    Tokens,
}

#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub ok: bool,
    pub wait_ms: u64,
    pub reason: Option<LimitKind>,
}

impl Decision {
    fn allow() -> Self {
        Self {
            ok: true,
            wait_ms: 0,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelWindowStats {
    pub live_requests: usize,
    pub live_tokens: u64,
    pub requests_per_min: u32,
    pub tokens_per_min: u64,
}

pub struct RateLimiter {
    limits: HashMap<ModelFamily, RateLimitEntry>,
    windows: Mutex<HashMap<ModelFamily, Vec<(Instant, u64)>>>,
    store: Option<Arc<dyn DurableStore>>,
}

impl RateLimiter {
    pub fn new(
        limits: HashMap<ModelFamily, RateLimitEntry>,
        store: Option<Arc<dyn DurableStore>>,
    ) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
            store,
        }
    }

    fn limit_for(&self, model: ModelFamily) -> RateLimitEntry {
        self.limits.get(&model).copied().unwrap_or_default()
    }

    /// May this request proceed now, and if not, for how long should the
    /// caller sleep before asking again?
    pub fn check(&self, model: ModelFamily, est_tokens: u64) -> Decision {
        let limit = self.limit_for(model);
        let mut windows = self.windows.lock().expect("rate window poisoned");
        let window = windows.entry(model).or_default();
        window.retain(|(at, _)| at.elapsed() < WINDOW);

        let wait_from_oldest = |window: &[(Instant, u64)]| {
            let oldest_age = window
                .first()
                .map(|(at, _)| at.elapsed())
                .unwrap_or_default();
            let remaining = WINDOW.saturating_sub(oldest_age);
            (remaining.as_millis() as u64).max(MIN_WAIT_MS)
        };

        if window.len() >= limit.requests_per_min as usize {
            return Decision {
                ok: false,
                wait_ms: wait_from_oldest(window),
                reason: Some(LimitKind::Requests),
            };
        }

        let live_tokens: u64 = window.iter().map(|(_, tokens)| tokens).sum();
        if live_tokens + est_tokens > limit.tokens_per_min {
            // Empty-window carve-out: a single call cannot be split, so an
            // oversized first request is admitted rather than deadlocked.
            if window.is_empty() {
                return Decision::allow();
            }
            return Decision {
                ok: false,
                wait_ms: wait_from_oldest(window),
                reason: Some(LimitKind::Tokens),
            };
        }

        Decision::allow()
    }

    pub fn record(&self, model: ModelFamily, est_tokens: u64) {
        {
            let mut windows = self.windows.lock().expect("rate window poisoned");
            windows
                .entry(model)
                .or_default()
                .push((Instant::now(), est_tokens));
        }
        debug!(model = model.as_str(), est_tokens, "rate event recorded");

        let now_ms = chrono::Utc::now().timestamp_millis();
        store::fire_and_forget(&self.store, move |store| async move {
            let key = keys::rate_window(model.as_str());
            store
                .zadd(&key, now_ms as f64, format!("{now_ms}:{est_tokens}"))
                .await;
            store
                .zrem_range_by_score(&key, 0.0, (now_ms - 60_000) as f64)
                .await;
        });
    }

    pub fn stats(&self) -> HashMap<String, ModelWindowStats> {
        let mut windows = self.windows.lock().expect("rate window poisoned");
        let mut out = HashMap::new();
        for model in ModelFamily::all() {
            let limit = self.limit_for(model);
            let window = windows.entry(model).or_default();
            window.retain(|(at, _)| at.elapsed() < WINDOW);
            out.insert(
                model.as_str().to_string(),
                ModelWindowStats {
                    live_requests: window.len(),
                    live_tokens: window.iter().map(|(_, t)| t).sum(),
                    requests_per_min: limit.requests_per_min,
                    tokens_per_min: limit.tokens_per_min,
                },
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests_per_min: u32, tokens_per_min: u64) -> RateLimiter {
        let mut limits = HashMap::new();
        limits.insert(
            ModelFamily::Sonnet,
            RateLimitEntry {
                requests_per_min,
                tokens_per_min,
            },
        );
        RateLimiter::new(limits, None)
    }

    #[tokio::test(start_paused = true)]
    async fn request_ceiling_waits_for_oldest_to_age_out() {
        let limiter = limiter(1, 1_000_000);
        assert!(limiter.check(ModelFamily::Sonnet, 100).ok);
        limiter.record(ModelFamily::Sonnet, 100);

        tokio::time::advance(Duration::from_secs(30)).await;
        let decision = limiter.check(ModelFamily::Sonnet, 100);
        assert!(!decision.ok);
        assert_eq!(decision.reason, Some(LimitKind::Requests));
        // Oldest event is 30 s old: remaining wait is ~30 s.
        assert!((29_000..=30_000).contains(&decision.wait_ms));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(limiter.check(ModelFamily::Sonnet, 100).ok);
    }

    #[tokio::test(start_paused = true)]
    async fn token_ceiling_blocks_when_window_is_nonempty() {
        let limiter = limiter(100, 1000);
        limiter.record(ModelFamily::Sonnet, 800);
        let decision = limiter.check(ModelFamily::Sonnet, 300);
        assert!(!decision.ok);
        assert_eq!(decision.reason, Some(LimitKind::Tokens));
        assert!(decision.wait_ms >= MIN_WAIT_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_request_is_admitted_on_empty_window() {
        let limiter = limiter(100, 1000);
        // Estimate exceeds the entire per-minute budget, but nothing is in
        // flight: the request must be admitted.
        assert!(limiter.check(ModelFamily::Sonnet, 5000).ok);
        limiter.record(ModelFamily::Sonnet, 5000);
        // A second oversized request now has to wait.
        assert!(!limiter.check(ModelFamily::Sonnet, 5000).ok);
    }

    #[tokio::test(start_paused = true)]
    async fn events_age_out_of_the_window() {
        let limiter = limiter(2, 1_000_000);
        limiter.record(ModelFamily::Sonnet, 10);
        limiter.record(ModelFamily::Sonnet, 10);
        assert!(!limiter.check(ModelFamily::Sonnet, 10).ok);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check(ModelFamily::Sonnet, 10).ok);
        assert_eq!(
            limiter.stats().get("sonnet").unwrap().live_requests,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_models_use_defaults() {
        let limiter = limiter(1, 1000);
        // Opus has no explicit entry; the default ceiling applies.
        let stats = limiter.stats();
        assert_eq!(stats.get("opus").unwrap().requests_per_min, 60);
        assert!(limiter.check(ModelFamily::Opus, 100).ok);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_never_below_the_floor() {
        let limiter = limiter(1, 1_000_000);
        limiter.record(ModelFamily::Sonnet, 1);
        tokio::time::advance(Duration::from_millis(59_900)).await;
        let decision = limiter.check(ModelFamily::Sonnet, 1);
        assert!(!decision.ok);
        assert_eq!(decision.wait_ms, MIN_WAIT_MS);
    }
}
