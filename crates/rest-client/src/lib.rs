//! Read-only HTTP client for public exchange market-data endpoints.
//!
//! Used for instrument discovery at startup and for funding-rate polling
//! while a websocket feed is down. Nothing here signs requests.

mod client;
mod error;

pub use client::RestClient;
pub use error::RestError;
