use std::time::Duration;

/// Failures surfaced by the collaborators the sync core talks to.
/// None of them are fatal; callers log and carry on.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("fetch failed {status}: {body}")]
    Fetch { status: u16, body: String },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("stream closed")]
    Closed,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Network(_) | Self::Timeout(_) | Self::Closed => true,
            Self::Fetch { status, .. } => *status == 429 || *status >= 500,
            Self::Unauthorized(_) | Self::Decode(_) => false,
        }
    }

    /// Short classification string for logging/counters.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Fetch { .. } => "fetch",
            Self::Unauthorized(_) => "unauthorized",
            Self::Network(_) => "network",
            Self::Decode(_) => "decode",
            Self::Timeout(_) => "timeout",
            Self::Closed => "closed",
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            _ => Self::Fetch { status, body },
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
