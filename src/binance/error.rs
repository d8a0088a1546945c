// =============================================================================
// Exchange error taxonomy
// =============================================================================

use thiserror::Error;

/// Longest body excerpt carried by [`ExchangeError::HttpStatus`].
pub const BODY_EXCERPT_CHARS: usize = 200;

/// Failure of a single exchange REST call. This layer never retries; callers
/// pick a policy (best-effort, bounded retry, or tri-state downgrade).
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Transport-level failure: no HTTP response was received (DNS, TLS,
    /// connection reset, request timeout).
    #[error("network error: {0}")]
    Network(String),

    /// The exchange answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        status: u16,
        /// Response body, truncated to [`BODY_EXCERPT_CHARS`] characters.
        body: String,
    },

    /// A success response that could not be decoded into the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    pub fn http_status(status: u16, body: &str) -> Self {
        Self::HttpStatus {
            status,
            body: excerpt(body),
        }
    }

    /// Exchange error code -1021: request timestamp outside the recvWindow.
    pub fn is_timestamp_drift(&self) -> bool {
        matches!(self, Self::HttpStatus { body, .. } if body.contains("-1021"))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Truncate on a character boundary.
fn excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_CHARS).collect()
}
