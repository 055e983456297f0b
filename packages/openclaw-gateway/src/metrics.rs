//! Monotonic dispatcher counters, token accounting and the aggregate
//! metrics snapshot served by `/metrics`.

use std::collections::HashMap;
use std::sync::Arc;

use atomic_counter::{AtomicCounter, RelaxedCounter};
use serde::Serialize;
use serde_json::json;

use crate::openai::ModelFamily;
use crate::store::{self, keys, DurableStore};

pub struct DispatcherCounters {
    pub requests: RelaxedCounter,
    pub stream_requests: RelaxedCounter,
    pub sync_requests: RelaxedCounter,
    pub direct_requests: RelaxedCounter,
    pub completed: RelaxedCounter,
    pub failed: RelaxedCounter,
    pub errors: ErrorCounters,
}

pub struct ErrorCounters {
    pub queue_full: RelaxedCounter,
    pub queue_timeout: RelaxedCounter,
    pub rate_wait_timeout: RelaxedCounter,
    pub stream_retry: RelaxedCounter,
    pub fallback: RelaxedCounter,
    pub fallback_context_overflow: RelaxedCounter,
    pub heartbeat_timeout: RelaxedCounter,
    pub execution_timeout: RelaxedCounter,
    pub safety_refusal: RelaxedCounter,
    pub client_disconnect: RelaxedCounter,
    pub worker_rate_limited: RelaxedCounter,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub requests: usize,
    pub stream_requests: usize,
    pub sync_requests: usize,
    pub direct_requests: usize,
    pub completed: usize,
    pub failed: usize,
    pub errors: ErrorStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorStats {
    pub queue_full: usize,
    pub queue_timeout: usize,
    pub rate_wait_timeout: usize,
    pub stream_retry: usize,
    pub fallback: usize,
    pub fallback_context_overflow: usize,
    pub heartbeat_timeout: usize,
    pub execution_timeout: usize,
    pub safety_refusal: usize,
    pub client_disconnect: usize,
    pub worker_rate_limited: usize,
}

impl Default for DispatcherCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherCounters {
    pub fn new() -> Self {
        Self {
            requests: RelaxedCounter::new(0),
            stream_requests: RelaxedCounter::new(0),
            sync_requests: RelaxedCounter::new(0),
            direct_requests: RelaxedCounter::new(0),
            completed: RelaxedCounter::new(0),
            failed: RelaxedCounter::new(0),
            errors: ErrorCounters {
                queue_full: RelaxedCounter::new(0),
                queue_timeout: RelaxedCounter::new(0),
                rate_wait_timeout: RelaxedCounter::new(0),
                stream_retry: RelaxedCounter::new(0),
                fallback: RelaxedCounter::new(0),
                fallback_context_overflow: RelaxedCounter::new(0),
                heartbeat_timeout: RelaxedCounter::new(0),
                execution_timeout: RelaxedCounter::new(0),
                safety_refusal: RelaxedCounter::new(0),
                client_disconnect: RelaxedCounter::new(0),
                worker_rate_limited: RelaxedCounter::new(0),
            },
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            requests: self.requests.get(),
            stream_requests: self.stream_requests.get(),
            sync_requests: self.sync_requests.get(),
            direct_requests: self.direct_requests.get(),
            completed: self.completed.get(),
            failed: self.failed.get(),
            errors: ErrorStats {
                queue_full: self.errors.queue_full.get(),
                queue_timeout: self.errors.queue_timeout.get(),
                rate_wait_timeout: self.errors.rate_wait_timeout.get(),
                stream_retry: self.errors.stream_retry.get(),
                fallback: self.errors.fallback.get(),
                fallback_context_overflow: self.errors.fallback_context_overflow.get(),
                heartbeat_timeout: self.errors.heartbeat_timeout.get(),
                execution_timeout: self.errors.execution_timeout.get(),
                safety_refusal: self.errors.safety_refusal.get(),
                client_disconnect: self.errors.client_disconnect.get(),
                worker_rate_limited: self.errors.worker_rate_limited.get(),
            },
        }
    }
}

/// Per-model token totals, mirrored to the durable store per request.
pub struct TokenLedger {
    models: dashmap::DashMap<ModelFamily, ModelTokens>,
    store: Option<Arc<dyn DurableStore>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ModelTokens {
    pub input: u64,
    pub output: u64,
    pub requests: u64,
}

impl TokenLedger {
    pub fn new(store: Option<Arc<dyn DurableStore>>) -> Self {
        Self {
            models: dashmap::DashMap::new(),
            store,
        }
    }

    pub fn record(&self, request_id: &str, model: ModelFamily, input: u64, output: u64) {
        let totals = {
            let mut entry = self.models.entry(model).or_default();
            entry.input += input;
            entry.output += output;
            entry.requests += 1;
            *entry
        };

        let request_id = request_id.to_string();
        let ts = chrono::Utc::now().timestamp_millis();
        store::fire_and_forget(&self.store, move |store| async move {
            store
                .hset(
                    keys::TOKEN_MODELS,
                    model.as_str(),
                    json!({
                        "input": totals.input,
                        "output": totals.output,
                        "requests": totals.requests,
                    })
                    .to_string(),
                )
                .await;
            store
                .hset(
                    keys::TOKEN_REQUESTS,
                    &request_id,
                    json!({
                        "input": input,
                        "output": output,
                        "model": model.as_str(),
                        "ts": ts,
                    })
                    .to_string(),
                )
                .await;
        });
    }

    pub fn stats(&self) -> HashMap<String, ModelTokens> {
        self.models
            .iter()
            .map(|e| (e.key().as_str().to_string(), *e.value()))
            .collect()
    }
}
