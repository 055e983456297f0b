use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnthropicError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to parse stream event: {0}")]
    Parse(String),

    #[error("no credentials configured")]
    NoCredentials,
}

impl AnthropicError {
    /// Whether the upstream rejected us for load reasons (worth retrying
    /// elsewhere rather than surfacing immediately).
    pub fn is_overloaded(&self) -> bool {
        match self {
            AnthropicError::Api { status, .. } => matches!(status, 429 | 503 | 529),
            _ => false,
        }
    }
}
