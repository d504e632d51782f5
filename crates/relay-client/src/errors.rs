//! HTTP client errors.

use std::time::Duration;

use relay_core::errors::SyncError;

/// Errors raised while talking to the server over HTTP.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Request could not be sent or the body could not be read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Request exceeded the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// Host URL is not an http(s) origin.
    #[error("invalid host URL: {0}")]
    InvalidUrl(String),
}

impl From<ClientError> for SyncError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Http(e) if e.is_decode() => Self::Decode(e.to_string()),
            ClientError::Http(e) if e.is_connect() || e.is_request() => {
                Self::Network(e.to_string())
            }
            ClientError::Http(e) => Self::Transport(e.to_string()),
            ClientError::Status { status, body } => Self::from_status(status, body),
            ClientError::Timeout(d) => Self::Timeout(d),
            ClientError::Decode(msg) => Self::Decode(msg),
            ClientError::InvalidUrl(msg) => Self::Transport(msg),
        }
    }
}
