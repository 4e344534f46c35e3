//! OKX v5 USDT swaps: `funding-rate` channel per instrument.

use crate::wire;
use async_trait::async_trait;
use common::Environment;
use connector_core::{ConnectorError, FeedAdapter, ParsedMessage};
use futures_util::stream::{self, StreamExt};
use model::{Exchange, NativeRate};
use rest_client::{RestClient, RestError};
use serde::Deserialize;
use std::time::Duration;

const SUBSCRIBE_BATCH: usize = 20;
const PING_INTERVAL: Duration = Duration::from_secs(25);
/// Concurrent per-instrument requests during a fallback poll.
const POLL_CONCURRENCY: usize = 8;
const SWAP_SUFFIX: &str = "-USDT-SWAP";

#[derive(Debug, Deserialize)]
struct PushFrame {
    arg: PushArg,
    data: Vec<FundingRateRaw>,
}

#[derive(Debug, Deserialize)]
struct PushArg {
    channel: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundingRateRaw {
    inst_id: String,
    #[serde(default)]
    funding_rate: String,
    /// Settlement time of `funding_rate`.
    #[serde(default)]
    funding_time: String,
    #[serde(default)]
    ts: String,
}

#[derive(Debug, Deserialize)]
struct RestEnvelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentRaw {
    inst_id: String,
    state: String,
}

impl<T> RestEnvelope<T> {
    fn into_data(self) -> Result<Vec<T>, ConnectorError> {
        if self.code == "0" {
            Ok(self.data)
        } else {
            Err(RestError::Api {
                code: self.code,
                message: self.msg,
            }
            .into())
        }
    }
}

impl FundingRateRaw {
    fn into_native(self) -> Option<NativeRate> {
        Some(NativeRate {
            rate: wire::decimal(&self.funding_rate)?,
            next_funding_time_ms: wire::millis(&self.funding_time),
            event_time_ms: wire::millis(&self.ts),
            native_symbol: self.inst_id,
        })
    }
}

fn parse_frame(text: &str) -> Result<ParsedMessage, serde_json::Error> {
    if text.trim() == "pong" {
        return Ok(ParsedMessage::Control);
    }
    let value: serde_json::Value = serde_json::from_str(text)?;
    if let Some(event) = value.get("event").and_then(|e| e.as_str()) {
        if event == "error" {
            tracing::warn!(
                code = %value.get("code").and_then(|c| c.as_str()).unwrap_or_default(),
                msg = %value.get("msg").and_then(|m| m.as_str()).unwrap_or_default(),
                "OKX rejected request"
            );
        }
        return Ok(ParsedMessage::Control);
    }
    if value.get("arg").is_none() || value.get("data").is_none() {
        return Ok(ParsedMessage::Unknown);
    }

    let frame: PushFrame = serde_json::from_value(value)?;
    if frame.arg.channel != "funding-rate" {
        return Ok(ParsedMessage::Unknown);
    }
    Ok(ParsedMessage::Rates(
        frame.data.into_iter().filter_map(FundingRateRaw::into_native).collect(),
    ))
}

fn live_usdt_swaps(instruments: Vec<InstrumentRaw>) -> Vec<String> {
    instruments
        .into_iter()
        .filter(|i| i.state == "live" && i.inst_id.ends_with(SWAP_SUFFIX))
        .map(|i| i.inst_id)
        .collect()
}

/// OKX USDT swaps: `funding-rate` channel, one REST request per instrument when polling.
pub struct OkxAdapter {
    ws_url: &'static str,
    rest: RestClient,
}

impl OkxAdapter {
    /// Testnet only swaps the websocket for the demo-trading one; public REST
    /// data is the same.
    pub fn new(environment: Environment) -> Result<Self, RestError> {
        let ws_url = match environment {
            Environment::Production => "wss://ws.okx.com:8443/ws/v5/public",
            Environment::Testnet => "wss://wspap.okx.com:8443/ws/v5/public?brokerId=9999",
        };
        Ok(Self {
            ws_url,
            rest: RestClient::with_default_timeout("https://www.okx.com")?,
        })
    }

    async fn fetch_one(&self, inst_id: &str) -> Result<Vec<NativeRate>, ConnectorError> {
        let envelope: RestEnvelope<FundingRateRaw> = self
            .rest
            .get("/api/v5/public/funding-rate", &[("instId", inst_id)])
            .await?;
        Ok(envelope
            .into_data()?
            .into_iter()
            .filter_map(FundingRateRaw::into_native)
            .collect())
    }
}

#[async_trait]
impl FeedAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    fn stream_url(&self, _natives: &[String]) -> String {
        self.ws_url.to_string()
    }

    fn subscribe_messages(&self, natives: &[String]) -> Vec<String> {
        natives
            .chunks(SUBSCRIBE_BATCH)
            .map(|chunk| {
                let args: Vec<serde_json::Value> = chunk
                    .iter()
                    .map(|inst| serde_json::json!({ "channel": "funding-rate", "instId": inst }))
                    .collect();
                serde_json::json!({ "op": "subscribe", "args": args }).to_string()
            })
            .collect()
    }

    fn keepalive(&self) -> Option<(Duration, String)> {
        Some((PING_INTERVAL, "ping".to_string()))
    }

    fn parse(&self, text: &str) -> Result<ParsedMessage, serde_json::Error> {
        parse_frame(text)
    }

    /// One request per instrument; fails only if every request fails.
    async fn poll(&self, natives: &[String]) -> Result<Vec<NativeRate>, ConnectorError> {
        // Futures are built up front so no higher-ranked closure is held
        // across the await (keeps the async-trait future `Send`).
        let requests: Vec<_> = natives.iter().map(|inst| self.fetch_one(inst)).collect();
        let results: Vec<Result<Vec<NativeRate>, ConnectorError>> = stream::iter(requests)
            .buffer_unordered(POLL_CONCURRENCY)
            .collect()
            .await;

        let mut rates = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(batch) => rates.extend(batch),
                Err(e) => {
                    tracing::debug!(error = %e, "OKX funding-rate request failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if rates.is_empty() => Err(e),
            _ => Ok(rates),
        }
    }

    async fn listings(&self) -> Result<Vec<String>, ConnectorError> {
        let envelope: RestEnvelope<InstrumentRaw> = self
            .rest
            .get("/api/v5/public/instruments", &[("instType", "SWAP")])
            .await?;
        Ok(live_usdt_swaps(envelope.into_data()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_funding_push() {
        let text = r#"{"arg":{"channel":"funding-rate","instId":"BTC-USDT-SWAP"},"data":[{"instId":"BTC-USDT-SWAP","instType":"SWAP","fundingRate":"0.0000792386885340","fundingTime":"1703059200000","nextFundingRate":"","nextFundingTime":"1703088000000","ts":"1703056000000"}]}"#;

        let ParsedMessage::Rates(rates) = parse_frame(text).unwrap() else {
            panic!("expected rates");
        };
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].native_symbol, "BTC-USDT-SWAP");
        assert_eq!(rates[0].rate, dec!(0.0000792386885340));
        assert_eq!(rates[0].next_funding_time_ms, 1_703_059_200_000);
        assert_eq!(rates[0].event_time_ms, 1_703_056_000_000);
    }

    #[test]
    fn test_parse_control_frames() {
        assert_eq!(parse_frame("pong").unwrap(), ParsedMessage::Control);
        assert_eq!(
            parse_frame(r#"{"event":"subscribe","arg":{"channel":"funding-rate","instId":"BTC-USDT-SWAP"},"connId":"a"}"#).unwrap(),
            ParsedMessage::Control
        );
        assert_eq!(
            parse_frame(r#"{"event":"error","code":"60012","msg":"Invalid request"}"#).unwrap(),
            ParsedMessage::Control
        );
    }

    #[test]
    fn test_other_channel_ignored() {
        let text = r#"{"arg":{"channel":"tickers","instId":"BTC-USDT-SWAP"},"data":[]}"#;
        assert_eq!(parse_frame(text).unwrap(), ParsedMessage::Unknown);
    }

    #[test]
    fn test_subscribe_message_shape() {
        let adapter = OkxAdapter::new(Environment::Testnet).unwrap();
        let messages = adapter.subscribe_messages(&["ETH-USDT-SWAP".to_string()]);
        let msg: serde_json::Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(msg["args"][0]["channel"], "funding-rate");
        assert_eq!(msg["args"][0]["instId"], "ETH-USDT-SWAP");
        assert!(adapter.stream_url(&[]).contains("wspap.okx.com"));
    }

    #[test]
    fn test_instruments_filtered() {
        let envelope: RestEnvelope<InstrumentRaw> = serde_json::from_str(
            r#"{"code":"0","msg":"","data":[
                {"instId":"BTC-USDT-SWAP","state":"live"},
                {"instId":"BTC-USD-SWAP","state":"live"},
                {"instId":"OLD-USDT-SWAP","state":"suspend"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(live_usdt_swaps(envelope.into_data().unwrap()), vec!["BTC-USDT-SWAP"]);
    }

    #[test]
    fn test_error_envelope() {
        let envelope: RestEnvelope<InstrumentRaw> =
            serde_json::from_str(r#"{"code":"51001","msg":"Instrument ID does not exist","data":[]}"#).unwrap();
        assert!(envelope.into_data().is_err());
    }
}
