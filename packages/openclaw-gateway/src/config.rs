//! Gateway configuration: TOML file plus `OPENCLAW_*` environment
//! overrides for scalar options.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::openai::ModelFamily;

/// Sentinel `auth_token` value that disables authentication.
pub const AUTH_OPEN: &str = "open";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP bind port.
    pub port: u16,
    /// Static bearer token; the sentinel value `open` disables auth.
    pub auth_token: String,
    /// CLI worker pool, in preference order.
    pub workers: Vec<WorkerSpec>,
    /// Worker preferred while the pool is degraded.
    pub primary_worker: Option<String>,
    /// Cooldown before a limited worker is considered healthy again.
    pub health_check_ms: u64,
    /// Credentials for the direct Anthropic path.
    pub token_pool: Vec<TokenPoolEntry>,
    /// Base URL for the direct Anthropic path.
    pub anthropic_base_url: String,

    pub max_concurrent: usize,
    pub max_queue_total: usize,
    pub max_queue_per_source: usize,
    pub source_concurrency_limits: HashMap<String, usize>,
    pub default_source_concurrency: usize,
    pub queue_timeout_ms: u64,
    /// Leases held longer than this are force-released by the sweep.
    pub max_lease_ms: u64,

    pub sync_timeout_ms: u64,
    pub stream_timeout_ms: u64,
    pub heartbeat_by_model: HeartbeatConfig,

    pub max_retries: u32,
    pub retry_base_ms: u64,

    pub max_process_age_ms: u64,
    pub max_idle_ms: u64,
    pub reaper_interval_ms: u64,

    pub warm_pool: WarmPoolConfig,
    /// Per-model ceilings, keyed `opus` / `sonnet` / `haiku`.
    pub rate_limits: HashMap<String, RateLimitEntry>,
    pub max_prompt_chars: usize,
    pub fallback_api: Option<FallbackApiConfig>,
    /// Event-log ring capacity.
    pub max_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Stable name, unique within the pool.
    pub name: String,
    /// Launch binary.
    pub bin: String,
    /// Optional credential injected into the worker environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub token_kind: TokenKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Flat-fee subscription credential (OAuth-style bearer).
    #[default]
    Flat,
    /// Metered API key.
    Metered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPoolEntry {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub kind: TokenKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub opus: u64,
    pub sonnet: u64,
    pub haiku: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            opus: 30 * 60 * 1000,
            sonnet: 20 * 60 * 1000,
            haiku: 10 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmPoolConfig {
    pub enabled: bool,
    /// Cap of live pre-spawned processes per (model, stream, worker) key.
    pub size: usize,
    pub max_age_ms: u64,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: 1,
            max_age_ms: 10 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub requests_per_min: u32,
    pub tokens_per_min: u64,
}

impl Default for RateLimitEntry {
    fn default() -> Self {
        Self {
            requests_per_min: 60,
            tokens_per_min: 400_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_fallback_name")]
    pub name: String,
}

fn default_fallback_name() -> String {
    "fallback".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8089,
            auth_token: AUTH_OPEN.to_string(),
            workers: Vec::new(),
            primary_worker: None,
            health_check_ms: 5 * 60 * 1000,
            token_pool: Vec::new(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            max_concurrent: 4,
            max_queue_total: 100,
            max_queue_per_source: 20,
            source_concurrency_limits: HashMap::new(),
            default_source_concurrency: 2,
            queue_timeout_ms: 120_000,
            max_lease_ms: 10 * 60 * 1000,
            sync_timeout_ms: 5 * 60 * 1000,
            stream_timeout_ms: 30 * 60 * 1000,
            heartbeat_by_model: HeartbeatConfig::default(),
            max_retries: 3,
            retry_base_ms: 1000,
            max_process_age_ms: 60 * 60 * 1000,
            max_idle_ms: 10 * 60 * 1000,
            reaper_interval_ms: 60_000,
            warm_pool: WarmPoolConfig::default(),
            rate_limits: HashMap::new(),
            max_prompt_chars: 100_000,
            fallback_api: None,
            max_events: 1000,
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self, GatewayError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::Config(format!("failed to read {path:?}: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("failed to parse {path:?}: {e}")))?;
        Ok(config)
    }

    /// Overlay `OPENCLAW_*` environment variables onto scalar options.
    pub fn apply_env_overrides(&mut self) {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }
        if let Some(v) = env_parse("OPENCLAW_PORT") {
            self.port = v;
        }
        if let Ok(v) = std::env::var("OPENCLAW_AUTH_TOKEN") {
            self.auth_token = v;
        }
        if let Some(v) = env_parse("OPENCLAW_MAX_CONCURRENT") {
            self.max_concurrent = v;
        }
        if let Some(v) = env_parse("OPENCLAW_QUEUE_TIMEOUT_MS") {
            self.queue_timeout_ms = v;
        }
        if let Some(v) = env_parse("OPENCLAW_STREAM_TIMEOUT_MS") {
            self.stream_timeout_ms = v;
        }
        if let Some(v) = env_parse("OPENCLAW_SYNC_TIMEOUT_MS") {
            self.sync_timeout_ms = v;
        }
        if let Some(v) = env_parse("OPENCLAW_MAX_PROMPT_CHARS") {
            self.max_prompt_chars = v;
        }
        if let Ok(v) = std::env::var("OPENCLAW_ANTHROPIC_BASE_URL") {
            self.anthropic_base_url = v;
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.workers.is_empty() && self.token_pool.is_empty() {
            return Err(GatewayError::Config(
                "at least one worker or token_pool entry is required".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for worker in &self.workers {
            if worker.name.is_empty() || worker.bin.is_empty() {
                return Err(GatewayError::Config(
                    "worker name and bin must be non-empty".into(),
                ));
            }
            if !seen.insert(worker.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate worker name: {}",
                    worker.name
                )));
            }
        }
        if let Some(primary) = &self.primary_worker {
            if !self.workers.iter().any(|w| &w.name == primary) {
                return Err(GatewayError::Config(format!(
                    "primary_worker {primary} is not in the worker pool"
                )));
            }
        }
        if self.max_concurrent == 0 {
            return Err(GatewayError::Config("max_concurrent must be > 0".into()));
        }
        Ok(())
    }

    pub fn auth_disabled(&self) -> bool {
        self.auth_token == AUTH_OPEN || self.auth_token.is_empty()
    }

    pub fn heartbeat_for(&self, model: ModelFamily) -> Duration {
        let ms = match model {
            ModelFamily::Opus => self.heartbeat_by_model.opus,
            ModelFamily::Sonnet => self.heartbeat_by_model.sonnet,
            ModelFamily::Haiku => self.heartbeat_by_model.haiku,
        };
        Duration::from_millis(ms)
    }

    pub fn rate_limit_for(&self, model: ModelFamily) -> RateLimitEntry {
        self.rate_limits
            .get(model.as_str())
            .copied()
            .unwrap_or_default()
    }

    pub fn source_cap(&self, source: &str) -> usize {
        self.source_concurrency_limits
            .get(source)
            .copied()
            .unwrap_or(self.default_source_concurrency)
    }
}
