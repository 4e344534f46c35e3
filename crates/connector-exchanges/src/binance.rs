//! Binance USDⓈ-M futures: all-market mark price stream.

use crate::wire;
use async_trait::async_trait;
use common::Environment;
use connector_core::{ConnectorError, FeedAdapter, ParsedMessage};
use model::{Exchange, NativeRate};
use rest_client::{RestClient, RestError};
use serde::Deserialize;
use std::collections::HashSet;

const STREAM: &str = "!markPrice@arr@1s";

/// Raw `markPriceUpdate` event.
#[derive(Debug, Deserialize)]
struct MarkPriceRaw {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    /// Empty for delivery contracts.
    #[serde(rename = "r", default)]
    funding_rate: String,
    #[serde(rename = "T", default)]
    next_funding_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Frame {
    Batch(Vec<MarkPriceRaw>),
    Single(MarkPriceRaw),
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndexRaw {
    symbol: String,
    #[serde(default)]
    last_funding_rate: String,
    #[serde(default)]
    next_funding_time: i64,
    #[serde(default)]
    time: i64,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoRaw {
    symbols: Vec<SymbolInfoRaw>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfoRaw {
    symbol: String,
    status: String,
    quote_asset: String,
    #[serde(default)]
    contract_type: String,
}

impl MarkPriceRaw {
    fn into_native(self) -> Option<NativeRate> {
        if self.event_type != "markPriceUpdate" {
            return None;
        }
        Some(NativeRate {
            rate: wire::decimal(&self.funding_rate)?,
            native_symbol: self.symbol,
            next_funding_time_ms: self.next_funding_time,
            event_time_ms: self.event_time,
        })
    }
}

fn parse_frame(text: &str) -> Result<ParsedMessage, serde_json::Error> {
    Ok(match serde_json::from_str::<Frame>(text)? {
        Frame::Batch(items) => {
            ParsedMessage::Rates(items.into_iter().filter_map(MarkPriceRaw::into_native).collect())
        }
        Frame::Single(item) => match item.into_native() {
            Some(rate) => ParsedMessage::Rates(vec![rate]),
            None => ParsedMessage::Unknown,
        },
        Frame::Other(value) if value.get("result").is_some() => ParsedMessage::Control,
        Frame::Other(_) => ParsedMessage::Unknown,
    })
}

fn rates_from_premium_index(items: Vec<PremiumIndexRaw>, wanted: &HashSet<&str>) -> Vec<NativeRate> {
    items
        .into_iter()
        .filter(|item| wanted.is_empty() || wanted.contains(item.symbol.as_str()))
        .filter_map(|item| {
            Some(NativeRate {
                rate: wire::decimal(&item.last_funding_rate)?,
                native_symbol: item.symbol,
                next_funding_time_ms: item.next_funding_time,
                event_time_ms: item.time,
            })
        })
        .collect()
}

fn perpetual_usdt(info: ExchangeInfoRaw) -> Vec<String> {
    info.symbols
        .into_iter()
        .filter(|s| s.status == "TRADING" && s.quote_asset == "USDT" && s.contract_type == "PERPETUAL")
        .map(|s| s.symbol)
        .collect()
}

/// USDⓈ-M futures: all-market mark price stream, `premiumIndex` polling.
pub struct BinanceAdapter {
    ws_base: &'static str,
    rest: RestClient,
}

impl BinanceAdapter {
    /// Testnet picks the exchange's sandbox hosts.
    pub fn new(environment: Environment) -> Result<Self, RestError> {
        let (ws_base, rest_base) = match environment {
            Environment::Production => ("wss://fstream.binance.com", "https://fapi.binance.com"),
            Environment::Testnet => (
                "wss://stream.binancefuture.com",
                "https://testnet.binancefuture.com",
            ),
        };
        Ok(Self {
            ws_base,
            rest: RestClient::with_default_timeout(rest_base)?,
        })
    }
}

#[async_trait]
impl FeedAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    /// The all-market stream covers every symbol, so `natives` is unused.
    fn stream_url(&self, _natives: &[String]) -> String {
        format!("{}/ws/{}", self.ws_base, STREAM)
    }

    fn parse(&self, text: &str) -> Result<ParsedMessage, serde_json::Error> {
        parse_frame(text)
    }

    async fn poll(&self, natives: &[String]) -> Result<Vec<NativeRate>, ConnectorError> {
        let items: Vec<PremiumIndexRaw> = self.rest.get("/fapi/v1/premiumIndex", &[]).await?;
        let wanted: HashSet<&str> = natives.iter().map(String::as_str).collect();
        Ok(rates_from_premium_index(items, &wanted))
    }

    async fn listings(&self) -> Result<Vec<String>, ConnectorError> {
        let info: ExchangeInfoRaw = self.rest.get("/fapi/v1/exchangeInfo", &[]).await?;
        Ok(perpetual_usdt(info))
    }
}
