//! Funding-rate feeds for Binance, Bybit and OKX.

mod binance;
mod bybit;
mod feed;
mod okx;
mod wire;

pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use feed::{FeedConnection, FeedHandle};
pub use okx::OkxAdapter;

use common::Environment;
use connector_core::FeedAdapter;
use model::Exchange;
use rest_client::RestError;
use std::sync::Arc;

/// Build the adapter for `exchange` in `environment`.
pub fn adapter_for(
    exchange: Exchange,
    environment: Environment,
) -> Result<Arc<dyn FeedAdapter>, RestError> {
    Ok(match exchange {
        Exchange::Binance => Arc::new(BinanceAdapter::new(environment)?),
        Exchange::Bybit => Arc::new(BybitAdapter::new(environment)?),
        Exchange::Okx => Arc::new(OkxAdapter::new(environment)?),
    })
}
