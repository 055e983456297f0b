//! Gateway error enum and failure classification.
//!
//! Classification is by effect, not by class: text markers decide whether a
//! worker failure is transient, a rate-limit event, or a safety refusal,
//! and exit codes decide retryability.

use thiserror::Error;

use openclaw_anthropic::AnthropicError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("queue is full, retry after {retry_after_ms} ms")]
    QueueFull { retry_after_ms: u64 },

    #[error("timed out waiting for a queue slot")]
    QueueTimeout,

    #[error("timed out waiting for rate-limit clearance")]
    RateWaitTimeout,

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("all workers failed without producing content")]
    Exhausted,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("upstream HTTP error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream API error: {0}")]
    Api(#[from] AnthropicError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// HTTP status for the non-streaming error envelope.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::QueueFull { .. }
            | GatewayError::QueueTimeout
            | GatewayError::RateWaitTimeout => 503,
            GatewayError::BadRequest(_) => 400,
            GatewayError::Unauthorized => 401,
            GatewayError::Config(_) => 500,
            GatewayError::Api(AnthropicError::Api { status, .. }) => *status,
            _ => 502,
        }
    }

    /// The `error.type` field of the JSON envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::QueueFull { .. } => "queue_full",
            GatewayError::QueueTimeout => "queue_timeout",
            GatewayError::RateWaitTimeout => "rate_limit_timeout",
            GatewayError::Spawn(_) => "worker_spawn_error",
            GatewayError::Worker(_) => "worker_error",
            GatewayError::Exhausted => "all_workers_failed",
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::Unauthorized => "authentication_error",
            GatewayError::Config(_) => "configuration_error",
            GatewayError::Upstream(_) | GatewayError::Api(_) => "upstream_error",
            GatewayError::Io(_) => "io_error",
            GatewayError::Json(_) => "parse_error",
        }
    }
}

/// Exit status the engine assigns to a TERM-ed child (128 + 15).
pub const TERM_EXIT_CODE: i32 = 143;

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "429",
    "too many requests",
    "overloaded",
    "you've hit your limit",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "epipe",
    "429",
    "503",
    "529",
    "overloaded",
    "too many",
];

const REFUSAL_MARKERS: &[&str] = &[
    "i cannot",
    "i can't",
    "i'm not able",
    "not authorized",
    "safety concern",
    "cannot assist",
];

/// Largest output (bytes) still considered for refusal detection.
pub const REFUSAL_MAX_LEN: usize = 2048;

/// Does this failure text look like an upstream rate limit?
pub fn is_rate_limited_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Does this failure text look transient (worth a backoff retry)?
pub fn is_transient_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Exit-code taxonomy: 1 and 2 are generic/invocation errors (retryable),
/// 143 is our own TERM (reaper or heartbeat — not retryable).
pub fn is_retryable_exit(code: i32) -> bool {
    matches!(code, 1 | 2)
}

/// Tiny outputs matching a refusal phrase are counted, never retried.
pub fn is_safety_refusal(output: &str) -> bool {
    if output.is_empty() || output.len() >= REFUSAL_MAX_LEN {
        return false;
    }
    let lower = output.to_lowercase();
    REFUSAL_MARKERS.iter().any(|m| lower.contains(m))
}

/// Fallback-specific context-size errors are counted separately from other
/// upstream failures.
pub fn is_context_overflow(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("prompt is too long")
        || lower.contains("context window")
}
