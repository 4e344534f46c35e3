//! Normalized market data types shared by feeds, the engine and the runner.

mod symbol;

pub use symbol::{CanonicalSymbol, SymbolError};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Perpetual-futures venues the engine can track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Okx,
}

impl Exchange {
    pub const ALL: [Exchange; 3] = [Exchange::Binance, Exchange::Bybit, Exchange::Okx];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Okx => "okx",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "bybit" => Ok(Exchange::Bybit),
            "okx" => Ok(Exchange::Okx),
            other => Err(SymbolError::UnknownExchange(other.to_string())),
        }
    }
}

/// How a rate observation reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateSource {
    /// Pushed over the exchange websocket.
    Stream,
    /// Pulled over REST while the websocket is unavailable.
    Fallback,
}

/// Direction of one leg of a market-neutral pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegSide {
    Long,
    Short,
}

impl fmt::Display for LegSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegSide::Long => f.write_str("LONG"),
            LegSide::Short => f.write_str("SHORT"),
        }
    }
}

/// A funding rate as reported by an exchange, before symbol reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeRate {
    pub native_symbol: String,
    pub rate: Decimal,
    /// 0 when the exchange did not report it.
    pub next_funding_time_ms: i64,
    /// Exchange-side timestamp of the message; 0 when absent. Only feeds
    /// the lag metric, never ordering.
    pub event_time_ms: i64,
}

/// One immutable funding-rate observation for an (exchange, symbol) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub exchange: Exchange,
    pub symbol: CanonicalSymbol,
    /// Signed fraction paid by longs to shorts per funding period.
    pub rate: Decimal,
    pub next_funding_time_ms: i64,
    pub observed_at_ms: i64,
    pub source: RateSource,
}

impl FundingRate {
    /// Milliseconds since this rate was observed (never negative).
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.observed_at_ms).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_exchange_round_trip_names() {
        for exchange in Exchange::ALL {
            assert_eq!(exchange.as_str().parse::<Exchange>().unwrap(), exchange);
        }
        assert!("kraken".parse::<Exchange>().is_err());
    }

    #[test]
    fn test_exchange_order_is_lexical() {
        let mut names: Vec<&str> = Exchange::ALL.iter().map(|e| e.as_str()).collect();
        names.sort();
        let ordered: Vec<&str> = Exchange::ALL.iter().map(|e| e.as_str()).collect();
        assert_eq!(names, ordered);
    }

    #[test]
    fn test_exchange_deserializes_lowercase() {
        let ex: Exchange = serde_json::from_str(r#""okx""#).unwrap();
        assert_eq!(ex, Exchange::Okx);
    }

    #[test]
    fn test_age_never_negative() {
        let rate = FundingRate {
            exchange: Exchange::Bybit,
            symbol: CanonicalSymbol::new("BTC", "USDT").unwrap(),
            rate: dec!(0.0001),
            next_funding_time_ms: 0,
            observed_at_ms: 10_000,
            source: RateSource::Stream,
        };
        assert_eq!(rate.age_ms(12_500), 2_500);
        assert_eq!(rate.age_ms(9_000), 0);
    }
}
