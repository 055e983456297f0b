//! HTTP surface: the OpenAI-compatible endpoint plus health, metrics and
//! the event firehose, behind a static bearer token.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use atomic_counter::AtomicCounter;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::dispatch::stream::{OutFrame, SseSender};
use crate::dispatch::{direct, stream, sync, Dispatcher, SourceHint};
use crate::error::GatewayError;
use crate::openai::{error_body, ChatRequest, ModelFamily};

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: std::time::Instant,
}

/// Like `Option<ConnectInfo<SocketAddr>>`, but implemented locally: axum 0.8's
/// `ConnectInfo` doesn't implement `OptionalFromRequestParts`, so the blanket
/// `Option<T>` extractor impl doesn't apply to it.
struct MaybeConnectInfo(Option<SocketAddr>);

impl<S> axum::extract::FromRequestParts<S> for MaybeConnectInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(MaybeConnectInfo(
            ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
                .await
                .ok()
                .map(|ConnectInfo(addr)| addr),
        ))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_auth,
        ));

    Router::new()
        .merge(api)
        .route("/health", get(health))
        .route("/metrics", get(metrics_snapshot))
        .route("/events", get(events_tail))
        .route("/stream", get(event_stream))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let cfg = &state.dispatcher.cfg;
    if cfg.auth_disabled() {
        return next.run(request).await;
    }
    let headers = request.headers();
    let presented = bearer_token(headers).or_else(|| header_str(headers, "x-api-key"));
    if presented == Some(cfg.auth_token.as_str()) {
        next.run(request).await
    } else {
        error_response(&GatewayError::Unauthorized)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn source_hint(headers: &HeaderMap, remote: Option<SocketAddr>) -> SourceHint {
    SourceHint {
        explicit_source: header_str(headers, "x-openclaw-source")
            .or_else(|| header_str(headers, "x-source"))
            .map(str::to_string),
        api_key: bearer_token(headers)
            .or_else(|| header_str(headers, "x-api-key"))
            .map(str::to_string),
        session_id: header_str(headers, "x-session-id").map(str::to_string),
        remote: remote.map(|addr| addr.ip()),
    }
}

pub fn error_response(error: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (
        status,
        Json(error_body(&error.to_string(), error.error_type())),
    )
        .into_response();
    if let GatewayError::QueueFull { retry_after_ms } = error {
        let secs = (retry_after_ms / 1000).max(1).to_string();
        if let Ok(header_value) = secs.parse() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header_value);
        }
    }
    response
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    MaybeConnectInfo(connect_addr): MaybeConnectInfo,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let dispatcher = Arc::clone(&state.dispatcher);
    if request.messages.is_empty() {
        return error_response(&GatewayError::BadRequest(
            "messages must not be empty".to_string(),
        ));
    }

    let hint = source_hint(&headers, connect_addr);
    let ctx = dispatcher.ingress(&request, &hint);
    dispatcher.counters.requests.inc();
    dispatcher.events.emit(
        "request_received",
        json!({
            "requestId": ctx.id,
            "source": ctx.source,
            "model": ctx.model.as_str(),
            "stream": ctx.stream,
        }),
    );

    let lease = match dispatcher.admit(&ctx).await {
        Ok(lease) => lease,
        Err(e) => return error_response(&e),
    };

    if ctx.stream {
        let (tx, rx) = mpsc::channel::<OutFrame>(64);
        let sender = SseSender::new(tx);
        let use_direct = dispatcher.use_direct(&request);
        tokio::spawn(async move {
            if use_direct {
                direct::run_direct_stream(dispatcher, ctx, request, sender, lease).await;
            } else {
                stream::run_stream(dispatcher, ctx, request, sender, lease).await;
            }
        });

        let body = ReceiverStream::new(rx).map(|frame| {
            Ok::<Event, Infallible>(match frame {
                OutFrame::Comment(text) => Event::default().comment(text),
                OutFrame::Data(payload) => Event::default().data(payload),
            })
        });
        (
            [
                (header::CACHE_CONTROL, "no-cache"),
                (header::HeaderName::from_static("x-accel-buffering"), "no"),
            ],
            Sse::new(body),
        )
            .into_response()
    } else {
        let result = if dispatcher.use_direct(&request) {
            direct::run_direct_sync(&dispatcher, &ctx, &request).await
        } else {
            sync::run_sync(&dispatcher, &ctx, &request).await
        };
        lease.release();
        match result {
            Ok(response) => Json(response).into_response(),
            Err(e) => error_response(&e),
        }
    }
}

async fn list_models() -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = ModelFamily::all()
        .iter()
        .map(|family| {
            json!({
                "id": family.public_id(),
                "object": "model",
                "owned_by": "openclaw",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let d = &state.dispatcher;
    Json(json!({
        "status": "ok",
        "uptime_ms": state.started_at.elapsed().as_millis() as u64,
        "queue": d.queue.stats(),
        "workers": d.router.stats(),
        "processes": d.registry.stats(),
        "warm": d.warm.stats().await,
    }))
}

async fn metrics_snapshot(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(build_snapshot(&state).await)
}

pub async fn build_snapshot(state: &AppState) -> serde_json::Value {
    let d = &state.dispatcher;
    json!({
        "uptime_ms": state.started_at.elapsed().as_millis() as u64,
        "queue": d.queue.stats(),
        "rate": d.limiter.stats(),
        "workers": d.router.stats(),
        "processes": d.registry.stats(),
        "warm": d.warm.stats().await,
        "affinity": d.affinity.stats(),
        "worker_stats": d.counters.stats(),
        "tokens": d.tokens.stats(),
        "events": d.events.counts(),
    })
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since_id: u64,
    limit: Option<usize>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn events_tail(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<serde_json::Value> {
    let events = state.dispatcher.events.tail(
        query.since_id,
        query.limit.unwrap_or(100).min(1000),
        query.kind.as_deref(),
    );
    Json(json!({ "events": events }))
}

/// SSE firehose of internal events for dashboards.
async fn event_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rx = state.dispatcher.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        let event: crate::events::GatewayEvent = result.ok()?;
        let payload = serde_json::to_string(&event).ok()?;
        Some(Ok::<Event, Infallible>(Event::default().data(payload)))
    });
    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// Serve until the shutdown future resolves.
pub async fn serve(
    state: Arc<AppState>,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), GatewayError> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_and_api_key_headers_are_recognized() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer tok-1".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("tok-1"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "tok-2".parse().unwrap());
        let hint = source_hint(&headers, None);
        assert_eq!(hint.api_key.as_deref(), Some("tok-2"));
    }

    #[test]
    fn source_headers_take_precedence_in_hint() {
        let mut headers = HeaderMap::new();
        headers.insert("x-source", "generic".parse().unwrap());
        headers.insert("x-openclaw-source", "specific".parse().unwrap());
        headers.insert("x-session-id", "sess-1".parse().unwrap());
        let hint = source_hint(&headers, None);
        assert_eq!(hint.explicit_source.as_deref(), Some("specific"));
        assert_eq!(hint.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn queue_full_response_carries_retry_after() {
        let response = error_response(&GatewayError::QueueFull {
            retry_after_ms: 5000,
        });
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "5"
        );
    }
}
