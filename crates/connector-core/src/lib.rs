//! Exchange-agnostic pieces of a funding-rate feed.

mod adapter;
mod config;
mod state;

pub use adapter::{FeedAdapter, ParsedMessage};
pub use config::FeedConfig;
pub use state::{FeedEvent, FeedState, FeedStateMachine};

use rest_client::RestError;
use thiserror::Error;

/// Errors from a feed's websocket or REST side.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Handshake, read or write failure on the socket.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Payload did not match the exchange's schema.
    #[error("Parse error: {0}")]
    Parse(String),

    /// REST poll or listing fetch failed.
    #[error("REST error: {0}")]
    Rest(#[from] RestError),

    /// Connect attempt exceeded its timeout, in milliseconds.
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// The server closed the stream.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ConnectorError {
    /// Transport failures that may clear up on a second attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::Rest(e) => e.is_retryable(),
            ConnectorError::WebSocket(_)
            | ConnectorError::Timeout(_)
            | ConnectorError::ConnectionClosed => true,
            ConnectorError::Parse(_) => false,
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        ConnectorError::Parse(err.to_string())
    }
}
