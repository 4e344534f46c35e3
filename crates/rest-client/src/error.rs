use thiserror::Error;

/// Errors from a public exchange REST call.
#[derive(Debug, Error)]
pub enum RestError {
    /// Non-success HTTP status.
    #[error("HTTP error: {status} - {message}")]
    HttpError {
        /// HTTP status code.
        status: u16,
        /// Error message or response body.
        message: String,
    },

    /// Request timed out.
    #[error("Request timeout")]
    Timeout,

    /// Network failure before a response arrived.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Response body did not match the expected shape.
    #[error("JSON parse error: {0}")]
    Parse(String),

    /// HTTP 429.
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Server-suggested wait, or a default when absent.
        retry_after_ms: u64,
    },

    /// The exchange answered with a well-formed error payload.
    #[error("Exchange error {code}: {message}")]
    Api {
        /// Exchange-specific error code, as sent.
        code: String,
        message: String,
    },

    /// Failed to build the HTTP request.
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

impl RestError {
    /// Transport-level failures worth another attempt on the next poll.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RestError::Timeout | RestError::Connection(_) | RestError::RateLimited { .. }
        ) || matches!(self, RestError::HttpError { status, .. } if *status >= 500)
    }
}

impl From<reqwest::Error> for RestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RestError::Timeout
        } else if err.is_connect() {
            RestError::Connection(err.to_string())
        } else if err.is_decode() {
            RestError::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            RestError::HttpError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            RestError::Connection(err.to_string())
        }
    }
}
