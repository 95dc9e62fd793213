use thiserror::Error;

#[derive(Debug, Error)]
pub enum VedaError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl VedaError {
    /// Returns `true` when the error is likely transient and worth retrying
    /// (HTTP 429/5xx, network timeouts, connection refused).
    pub fn is_transient(&self) -> bool {
        match self {
            // A reqwest error that never got a status is a network-level failure
            Self::Http(e) => match e.status() {
                Some(status) => is_transient_status(status.as_u16()),
                None => !e.is_builder() && !e.is_decode(),
            },
            Self::Status { status, .. } => is_transient_status(*status),
            Self::Stream(msg) => is_transient_message(msg),
            _ => false,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_transient_message(msg: &str) -> bool {
    let msg_lower = msg.to_lowercase();
    let patterns = [
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "broken pipe",
        "temporarily unavailable",
    ];
    patterns.iter().any(|p| msg_lower.contains(p))
}

pub type Result<T> = std::result::Result<T, VedaError>;
