//! Request orchestration: ingress derivation, the admission sequence
//! (queue slot + rate-limit clearance), prompt assembly, and the handoff
//! into the streaming, sync and direct paths.

pub mod direct;
pub mod stream;
pub mod sync;

use std::net::IpAddr;
use std::sync::Arc;

use atomic_counter::AtomicCounter;
use tokio::time::{Duration, Instant};
use tracing::debug;

use openclaw_anthropic::AnthropicClient;

use crate::affinity::{derive_session_key, SessionAffinity};
use crate::config::Config;
use crate::error::GatewayError;
use crate::events::EventLog;
use crate::metrics::{DispatcherCounters, TokenLedger};
use crate::openai::{ChatRequest, ModelFamily, Role};
use crate::queue::{FairQueue, Lease, Priority, QueueError};
use crate::rate_limit::RateLimiter;
use crate::registry::ProcessRegistry;
use crate::router::WorkerRouter;
use crate::store::DurableStore;
use crate::warm::WarmPool;
use crate::worker::WorkerLauncher;

/// Hard cap on the admission token estimate: over-estimating big code/JSON
/// prompts would starve the limiter, and the upstream enforces for real.
const EST_TOKEN_CAP: u64 = 5000;

/// Total time the dispatcher will sleep waiting for rate-limit clearance.
const RATE_WAIT_CAP: Duration = Duration::from_secs(300);

/// Longest single sleep while waiting on the limiter.
const RATE_WAIT_SLICE_MS: u64 = 5000;

const TRUNCATION_SENTINEL: &str = "[...earlier conversation truncated...]";

/// Everything derived from one request at ingress.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub id: String,
    pub source: String,
    pub model: ModelFamily,
    pub priority: Priority,
    pub stream: bool,
    pub est_tokens: u64,
    pub session_key: String,
    pub received_at: Instant,
}

/// Source identity material the transport layer extracts from headers.
#[derive(Debug, Default, Clone)]
pub struct SourceHint {
    pub explicit_source: Option<String>,
    pub api_key: Option<String>,
    pub session_id: Option<String>,
    pub remote: Option<IpAddr>,
}

pub struct Dispatcher {
    pub cfg: Arc<Config>,
    pub queue: Arc<FairQueue>,
    pub limiter: Arc<RateLimiter>,
    pub router: Arc<WorkerRouter>,
    pub affinity: Arc<SessionAffinity>,
    pub registry: Arc<ProcessRegistry>,
    pub warm: Arc<WarmPool>,
    pub launcher: Arc<WorkerLauncher>,
    pub direct: Option<Arc<AnthropicClient>>,
    pub events: Arc<EventLog>,
    pub counters: Arc<DispatcherCounters>,
    pub tokens: Arc<TokenLedger>,
    pub store: Option<Arc<dyn DurableStore>>,
    pub http: reqwest::Client,
}

impl Dispatcher {
    /// Derive the request context: model family, priority, source identity
    /// and the session key used for sticky routing.
    pub fn ingress(&self, request: &ChatRequest, hint: &SourceHint) -> RequestCtx {
        let model = ModelFamily::resolve(request.model.as_deref());
        let source = identify_source(hint, &self.cfg.auth_token);
        let system_prompt = collect_system(request);
        let session_key = derive_session_key(
            &source,
            hint.session_id.as_deref(),
            system_prompt.as_deref(),
        );
        let prompt_chars: usize = request
            .messages
            .iter()
            .filter_map(|m| m.content.as_deref())
            .map(str::len)
            .sum();

        let ctx = RequestCtx {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            source,
            model,
            priority: model.priority(),
            stream: request.stream.unwrap_or(false),
            est_tokens: estimate_tokens(prompt_chars),
            session_key,
            received_at: Instant::now(),
        };
        debug!(
            request_id = %ctx.id,
            source = %ctx.source,
            model = ctx.model.as_str(),
            stream = ctx.stream,
            est_tokens = ctx.est_tokens,
            "request admitted to dispatch"
        );
        ctx
    }

    /// Tool-carrying requests bypass CLI workers (which cannot execute
    /// tools) when a direct-API credential pool is configured.
    pub fn use_direct(&self, request: &ChatRequest) -> bool {
        request.has_tools() && self.direct.is_some()
    }

    /// Admission sequence shared by every path: one queue slot, then
    /// bounded sleeping until the rate limiter clears, then record.
    pub async fn admit(&self, ctx: &RequestCtx) -> Result<Lease, GatewayError> {
        let lease = self
            .queue
            .acquire(&ctx.source, ctx.priority)
            .await
            .map_err(|e| match e {
                QueueError::Full => {
                    self.counters.errors.queue_full.inc();
                    self.events.emit(
                        "queue_rejected",
                        serde_json::json!({ "source": ctx.source, "requestId": ctx.id }),
                    );
                    GatewayError::QueueFull {
                        retry_after_ms: RATE_WAIT_SLICE_MS,
                    }
                }
                QueueError::Timeout => {
                    self.counters.errors.queue_timeout.inc();
                    self.events.emit(
                        "queue_timeout",
                        serde_json::json!({ "source": ctx.source, "requestId": ctx.id }),
                    );
                    GatewayError::QueueTimeout
                }
            })?;

        let started = Instant::now();
        loop {
            let decision = self.limiter.check(ctx.model, ctx.est_tokens);
            if decision.ok {
                break;
            }
            if started.elapsed() >= RATE_WAIT_CAP {
                lease.release();
                self.counters.errors.rate_wait_timeout.inc();
                return Err(GatewayError::RateWaitTimeout);
            }
            tokio::time::sleep(Duration::from_millis(
                decision.wait_ms.min(RATE_WAIT_SLICE_MS),
            ))
            .await;
        }
        self.limiter.record(ctx.model, ctx.est_tokens);
        Ok(lease)
    }
}

/// Source identity: explicit headers beat api-key fingerprints beat the
/// remote address.
pub fn identify_source(hint: &SourceHint, auth_token: &str) -> String {
    if let Some(source) = hint.explicit_source.as_deref().filter(|s| !s.is_empty()) {
        return source.to_string();
    }
    if let Some(key) = hint
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty() && *k != auth_token)
    {
        return format!("key:{:08x}", fnv1a32(key.as_bytes()));
    }
    match hint.remote {
        Some(ip) => ip.to_string(),
        None => "anonymous".to_string(),
    }
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// `min(ceil(chars / 4), 5000)`.
pub fn estimate_tokens(prompt_chars: usize) -> u64 {
    (((prompt_chars as u64) + 3) / 4).min(EST_TOKEN_CAP)
}

fn collect_system(request: &ChatRequest) -> Option<String> {
    let parts: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .filter_map(|m| m.content.as_deref())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

#[derive(Debug, Clone)]
pub struct PromptParts {
    pub system: Option<String>,
    pub prompt: String,
    pub truncated: bool,
}

/// Render the conversation for a CLI worker, truncating from the front
/// (oldest first) to fit the prompt budget. The final turn is always
/// retained; a sentinel line marks any truncation.
pub fn extract_prompt(request: &ChatRequest, max_prompt_chars: usize) -> PromptParts {
    let system = collect_system(request);
    let mut segments: Vec<String> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .filter_map(|m| {
            m.content
                .as_deref()
                .map(|content| format!("{}: {}", m.role.label(), content))
        })
        .collect();

    let joined_len =
        |segments: &[String]| -> usize { segments.iter().map(String::len).sum::<usize>() + segments.len().saturating_sub(1) * 2 };

    let mut truncated = false;
    let budget = |truncated: bool| {
        if truncated {
            max_prompt_chars.saturating_sub(TRUNCATION_SENTINEL.len() + 2)
        } else {
            max_prompt_chars
        }
    };
    while segments.len() > 1 && joined_len(&segments) > budget(truncated) {
        segments.remove(0);
        truncated = true;
    }

    let mut prompt = segments.join("\n\n");
    if truncated {
        prompt = format!("{TRUNCATION_SENTINEL}\n\n{prompt}");
    }
    PromptParts {
        system,
        prompt,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::ChatMessage;

    fn request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            messages,
            model: None,
            stream: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            tools: None,
            tool_choice: None,
            user: None,
        }
    }

    #[test]
    fn token_estimate_rounds_up_and_caps() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(8), 2);
        assert_eq!(estimate_tokens(9), 3);
        assert_eq!(estimate_tokens(1_000_000), 5000);
    }

    #[test]
    fn source_prefers_explicit_header() {
        let hint = SourceHint {
            explicit_source: Some("team-a".into()),
            api_key: Some("sk-x".into()),
            session_id: None,
            remote: Some("10.0.0.1".parse().unwrap()),
        };
        assert_eq!(identify_source(&hint, "auth"), "team-a");
    }

    #[test]
    fn source_fingerprints_foreign_api_keys() {
        let hint = SourceHint {
            explicit_source: None,
            api_key: Some("sk-abc".into()),
            session_id: None,
            remote: None,
        };
        let source = identify_source(&hint, "shared-token");
        assert!(source.starts_with("key:"));
        // The shared bearer token is not an identity.
        let hint = SourceHint {
            api_key: Some("shared-token".into()),
            ..SourceHint::default()
        };
        assert_eq!(identify_source(&hint, "shared-token"), "anonymous");
    }

    #[test]
    fn source_falls_back_to_remote_address() {
        let hint = SourceHint {
            remote: Some("192.168.1.9".parse().unwrap()),
            ..SourceHint::default()
        };
        assert_eq!(identify_source(&hint, "auth"), "192.168.1.9");
    }

    #[test]
    fn prompt_keeps_everything_under_budget() {
        let req = request(vec![
            ChatMessage::text(Role::User, "hello"),
            ChatMessage::text(Role::Assistant, "hi"),
            ChatMessage::text(Role::User, "bye"),
        ]);
        let parts = extract_prompt(&req, 10_000);
        assert!(!parts.truncated);
        assert_eq!(parts.prompt, "User: hello\n\nAssistant: hi\n\nUser: bye");
    }

    #[test]
    fn prompt_truncates_from_the_front_with_sentinel() {
        let req = request(vec![
            ChatMessage::text(Role::User, "x".repeat(200)),
            ChatMessage::text(Role::Assistant, "y".repeat(200)),
            ChatMessage::text(Role::User, "final question"),
        ]);
        let parts = extract_prompt(&req, 300);
        assert!(parts.truncated);
        assert!(parts.prompt.starts_with(TRUNCATION_SENTINEL));
        assert!(parts.prompt.ends_with("User: final question"));
        assert!(parts.prompt.len() <= 300);
    }

    #[test]
    fn oversized_final_turn_is_sole_survivor() {
        let req = request(vec![
            ChatMessage::text(Role::User, "early"),
            ChatMessage::text(Role::User, "z".repeat(500)),
        ]);
        let parts = extract_prompt(&req, 100);
        assert!(parts.truncated);
        // The final segment alone exceeds the budget but is retained.
        assert!(parts.prompt.contains(&"z".repeat(500)));
        assert!(!parts.prompt.contains("early"));
    }

    #[test]
    fn system_messages_feed_the_system_section_not_the_prompt() {
        let req = request(vec![
            ChatMessage::text(Role::System, "be brief"),
            ChatMessage::text(Role::User, "hello"),
        ]);
        let parts = extract_prompt(&req, 10_000);
        assert_eq!(parts.system.as_deref(), Some("be brief"));
        assert_eq!(parts.prompt, "User: hello");
    }
}
