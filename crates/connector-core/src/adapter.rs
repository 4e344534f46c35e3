//! Per-exchange wire knowledge plugged into the generic feed loop.

use crate::ConnectorError;
use async_trait::async_trait;
use model::{Exchange, NativeRate};
use std::time::Duration;

/// Result of decoding one websocket text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    Rates(Vec<NativeRate>),
    /// Subscription acks, pongs and similar.
    Control,
    /// Valid JSON we do not act on.
    Unknown,
}

#[async_trait]
pub trait FeedAdapter: Send + Sync + 'static {
    fn exchange(&self) -> Exchange;

    /// Websocket endpoint for the given native symbols.
    fn stream_url(&self, natives: &[String]) -> String;

    /// Frames to send right after the socket opens.
    fn subscribe_messages(&self, _natives: &[String]) -> Vec<String> {
        Vec::new()
    }

    /// Application-level ping frame and its period, if the exchange needs one.
    fn keepalive(&self) -> Option<(Duration, String)> {
        None
    }

    fn parse(&self, text: &str) -> Result<ParsedMessage, serde_json::Error>;

    /// Current rates over REST, used while the stream is unavailable.
    async fn poll(&self, natives: &[String]) -> Result<Vec<NativeRate>, ConnectorError>;

    /// Native names of every tradable USDT perpetual.
    async fn listings(&self) -> Result<Vec<String>, ConnectorError>;
}
