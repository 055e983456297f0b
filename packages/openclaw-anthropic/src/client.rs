//! HTTP client and credential pool for the Messages API.

use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::AnthropicError;
use crate::sse::SseEventStream;
use crate::stream::MessageStream;
use crate::types::{MessagesRequest, MessagesResponse};

const API_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// How a credential is billed, which decides how it is sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Subscription credential: `Authorization: Bearer` plus the beta marker.
    Flat,
    /// Pay-per-token credential: `x-api-key` header.
    Metered,
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub name: String,
    pub secret: String,
    pub kind: CredentialKind,
}

/// Round-robin over configured credentials; the cursor is process-wide for
/// the lifetime of the pool so consecutive requests rotate.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn next(&self) -> Option<&Credential> {
        if self.credentials.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.credentials.len();
        Some(&self.credentials[idx])
    }
}

pub struct AnthropicClient {
    http: Client,
    base_url: String,
    pool: CredentialPool,
}

impl AnthropicClient {
    pub fn new(base_url: impl Into<String>, pool: CredentialPool) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            pool,
        }
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    fn build_request(&self, req: &MessagesRequest) -> Result<reqwest::RequestBuilder, AnthropicError> {
        let credential = self.pool.next().ok_or(AnthropicError::NoCredentials)?;
        debug!(credential = %credential.name, model = %req.model, "dispatching messages request");

        let mut builder = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json");

        builder = match credential.kind {
            CredentialKind::Flat => builder
                .bearer_auth(&credential.secret)
                .header("anthropic-beta", OAUTH_BETA),
            CredentialKind::Metered => builder.header("x-api-key", &credential.secret),
        };

        Ok(builder.json(req))
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AnthropicError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or(body);
        Err(AnthropicError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// One-shot (non-streaming) message creation.
    pub async fn messages(&self, req: &MessagesRequest) -> Result<MessagesResponse, AnthropicError> {
        let response = self.build_request(req)?.send().await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Streaming message creation; the caller drives the returned stream.
    pub async fn messages_stream(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessageStream, AnthropicError> {
        let response = self
            .build_request(req)?
            .header("accept", "text/event-stream")
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(MessageStream::new(SseEventStream::new(response)))
    }
}
