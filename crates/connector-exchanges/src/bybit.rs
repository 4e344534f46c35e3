//! Bybit v5 linear perpetuals: per-symbol `tickers` topics.

use crate::wire;
use async_trait::async_trait;
use common::Environment;
use connector_core::{ConnectorError, FeedAdapter, ParsedMessage};
use model::{Exchange, NativeRate};
use parking_lot::Mutex;
use rest_client::{RestClient, RestError};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Bybit caps the number of args in one subscribe request.
const SUBSCRIBE_BATCH: usize = 10;
const PING_INTERVAL: Duration = Duration::from_secs(20);
const INSTRUMENTS_PAGE: &str = "1000";

#[derive(Debug, Deserialize)]
struct TickerFrame {
    topic: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    ts: i64,
    data: TickerData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    symbol: String,
    funding_rate: Option<String>,
    next_funding_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestEnvelope<T> {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResult<T> {
    list: Vec<T>,
    #[serde(default)]
    next_page_cursor: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerRaw {
    symbol: String,
    #[serde(default)]
    funding_rate: String,
    #[serde(default)]
    next_funding_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentRaw {
    symbol: String,
    status: String,
    quote_coin: String,
    #[serde(default)]
    contract_type: String,
}

impl<T> RestEnvelope<T> {
    fn into_result(self) -> Result<T, ConnectorError> {
        match (self.ret_code, self.result) {
            (0, Some(result)) => Ok(result),
            (code, _) => Err(RestError::Api {
                code: code.to_string(),
                message: self.ret_msg,
            }
            .into()),
        }
    }
}

/// Last known funding fields per symbol, since deltas only carry changes.
#[derive(Debug, Default, Clone, Copy)]
struct TickerCache {
    rate: Option<Decimal>,
    next_funding_time_ms: i64,
}

/// Bybit v5 linear perpetuals: per-symbol ticker topics with delta merging.
pub struct BybitAdapter {
    ws_url: &'static str,
    rest: RestClient,
    cache: Mutex<HashMap<String, TickerCache>>,
}

impl BybitAdapter {
    pub fn new(environment: Environment) -> Result<Self, RestError> {
        let (ws_url, rest_base) = match environment {
            Environment::Production => (
                "wss://stream.bybit.com/v5/public/linear",
                "https://api.bybit.com",
            ),
            Environment::Testnet => (
                "wss://stream-testnet.bybit.com/v5/public/linear",
                "https://api-testnet.bybit.com",
            ),
        };
        Ok(Self {
            ws_url,
            rest: RestClient::with_default_timeout(rest_base)?,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn merge(&self, frame: TickerFrame) -> Option<NativeRate> {
        if !frame.topic.starts_with("tickers.") {
            return None;
        }
        let data = frame.data;
        let mut cache = self.cache.lock();
        let entry = cache.entry(data.symbol.clone()).or_default();

        if frame.kind == "snapshot" {
            *entry = TickerCache::default();
        } else if data.funding_rate.is_none() && data.next_funding_time.is_none() {
            return None;
        }
        if let Some(rate) = data.funding_rate.as_deref().and_then(wire::decimal) {
            entry.rate = Some(rate);
        }
        if let Some(next) = data.next_funding_time.as_deref() {
            entry.next_funding_time_ms = wire::millis(next);
        }

        Some(NativeRate {
            native_symbol: data.symbol,
            rate: entry.rate?,
            next_funding_time_ms: entry.next_funding_time_ms,
            event_time_ms: frame.ts,
        })
    }
}

#[async_trait]
impl FeedAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn stream_url(&self, _natives: &[String]) -> String {
        self.ws_url.to_string()
    }

    fn subscribe_messages(&self, natives: &[String]) -> Vec<String> {
        natives
            .chunks(SUBSCRIBE_BATCH)
            .map(|chunk| {
                let args: Vec<String> = chunk.iter().map(|s| format!("tickers.{}", s)).collect();
                serde_json::json!({ "op": "subscribe", "args": args }).to_string()
            })
            .collect()
    }

    fn keepalive(&self) -> Option<(Duration, String)> {
        Some((PING_INTERVAL, r#"{"op":"ping"}"#.to_string()))
    }

    fn parse(&self, text: &str) -> Result<ParsedMessage, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("op").is_some() || value.get("success").is_some() {
            return Ok(ParsedMessage::Control);
        }
        if value.get("topic").is_none() {
            return Ok(ParsedMessage::Unknown);
        }
        let frame: TickerFrame = serde_json::from_value(value)?;
        Ok(match self.merge(frame) {
            Some(rate) => ParsedMessage::Rates(vec![rate]),
            None => ParsedMessage::Unknown,
        })
    }

    async fn poll(&self, natives: &[String]) -> Result<Vec<NativeRate>, ConnectorError> {
        let envelope: RestEnvelope<ListResult<TickerRaw>> = self
            .rest
            .get("/v5/market/tickers", &[("category", "linear")])
            .await?;
        let wanted: HashSet<&str> = natives.iter().map(String::as_str).collect();
        let now = common::now_ms();

        Ok(envelope
            .into_result()?
            .list
            .into_iter()
            .filter(|t| wanted.is_empty() || wanted.contains(t.symbol.as_str()))
            .filter_map(|t| {
                Some(NativeRate {
                    rate: wire::decimal(&t.funding_rate)?,
                    next_funding_time_ms: wire::millis(&t.next_funding_time),
                    native_symbol: t.symbol,
                    event_time_ms: now,
                })
            })
            .collect())
    }

    async fn listings(&self) -> Result<Vec<String>, ConnectorError> {
        let mut symbols = Vec::new();
        let mut cursor = String::new();

        loop {
            let mut query = vec![("category", "linear"), ("limit", INSTRUMENTS_PAGE)];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.as_str()));
            }
            let page: ListResult<InstrumentRaw> = self
                .rest
                .get::<RestEnvelope<ListResult<InstrumentRaw>>>("/v5/market/instruments-info", &query)
                .await?
                .into_result()?;

            symbols.extend(
                page.list
                    .into_iter()
                    .filter(|i| {
                        i.status == "Trading"
                            && i.quote_coin == "USDT"
                            && i.contract_type == "LinearPerpetual"
                    })
                    .map(|i| i.symbol),
            );

            if page.next_page_cursor.is_empty() {
                break;
            }
            cursor = page.next_page_cursor;
        }
        Ok(symbols)
    }
}
