//! Generic websocket feed with reconnect backoff and REST fallback.

use common::ExponentialBackoff;
use connector_core::{
    ConnectorError, FeedAdapter, FeedConfig, FeedEvent, FeedState, FeedStateMachine,
    ParsedMessage,
};
use futures_util::{SinkExt, StreamExt};
use market_data::{MarketState, SymbolMapper, UpsertOutcome};
use metrics::FeedMetrics;
use model::{Exchange, FundingRate, NativeRate, RateSource};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum ConnectResult {
    Connected(WsStream),
    Shutdown,
    Error(ConnectorError),
}

/// How a streaming session ended.
enum SessionResult {
    Shutdown,
    Ended {
        duration: Duration,
        error: ConnectorError,
    },
}

/// Everything a feed task needs besides its symbols.
pub struct FeedConnection {
    adapter: Arc<dyn FeedAdapter>,
    config: FeedConfig,
    market: Arc<MarketState>,
    mapper: Arc<SymbolMapper>,
    metrics: Arc<FeedMetrics>,
}

/// Owner side of a running feed.
pub struct FeedHandle {
    exchange: Exchange,
    state_rx: watch::Receiver<FeedState>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FeedHandle {
    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    /// Current state of the feed task.
    pub fn state(&self) -> FeedState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<FeedState> {
        self.state_rx.clone()
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(exchange = %self.exchange, error = %e, "Feed task panicked");
        }
    }
}

impl FeedConnection {
    /// Wire a feed to the shared market state. Nothing runs until [`start`].
    ///
    /// [`start`]: FeedConnection::start
    pub fn new(
        adapter: Arc<dyn FeedAdapter>,
        config: FeedConfig,
        market: Arc<MarketState>,
        mapper: Arc<SymbolMapper>,
        metrics: Arc<FeedMetrics>,
    ) -> Self {
        Self {
            adapter,
            config,
            market,
            mapper,
            metrics,
        }
    }

    /// Spawn the feed task for `natives` on the current runtime.
    pub fn start(self, natives: Vec<String>) -> FeedHandle {
        let exchange = self.adapter.exchange();
        let (state_tx, state_rx) = watch::channel(FeedState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            self.run(natives, state_tx, stop_rx).await;
        });

        FeedHandle {
            exchange,
            state_rx,
            stop_tx,
            task,
        }
    }

    async fn run(
        self,
        natives: Vec<String>,
        state_tx: watch::Sender<FeedState>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let exchange = self.adapter.exchange();
        let url = self.adapter.stream_url(&natives);
        let mut machine = FeedStateMachine::new(self.config.max_reconnect_attempts);
        let mut backoff = self.config.backoff.start();
        let mut has_connected = false;

        let apply = |machine: &mut FeedStateMachine, event: FeedEvent| {
            let before = machine.state();
            let after = machine.on_event(event);
            if before != after {
                debug!(exchange = %exchange, from = %before, to = %after, "Feed state changed");
                state_tx.send_replace(after);
            }
            after
        };

        apply(&mut machine, FeedEvent::Start);
        info!(exchange = %exchange, symbols = natives.len(), "Feed started");

        loop {
            if *stop_rx.borrow() {
                break;
            }

            match machine.state() {
                FeedState::FallbackPolling => {
                    if self.poll_until_retry(&natives, &mut stop_rx).await {
                        break;
                    }
                    info!(exchange = %exchange, "Retrying websocket from fallback");
                    apply(&mut machine, FeedEvent::FallbackRetryDue);
                }
                FeedState::Connecting | FeedState::Reconnecting => {
                    let ws = match self.connect(&url, &mut stop_rx).await {
                        ConnectResult::Connected(ws) => ws,
                        ConnectResult::Shutdown => break,
                        ConnectResult::Error(e) => {
                            self.metrics.inc_websocket_errors();
                            let next = apply(&mut machine, FeedEvent::ConnectFailed);
                            if next == FeedState::FallbackPolling {
                                warn!(
                                    exchange = %exchange,
                                    error = %e,
                                    failures = machine.consecutive_failures(),
                                    "Reconnect attempts exhausted, switching to REST polling"
                                );
                                continue;
                            }
                            if self.backoff_wait(&mut backoff, &e, &mut stop_rx).await {
                                break;
                            }
                            continue;
                        }
                    };

                    if has_connected {
                        self.metrics.inc_reconnect_successes();
                    }
                    has_connected = true;
                    apply(&mut machine, FeedEvent::Opened);
                    info!(exchange = %exchange, "Streaming");

                    match self.stream(ws, &natives, &mut stop_rx).await {
                        SessionResult::Shutdown => break,
                        SessionResult::Ended { duration, error } => {
                            apply(&mut machine, FeedEvent::Closed);
                            if duration >= self.config.stable_after {
                                debug!(
                                    exchange = %exchange,
                                    duration_secs = duration.as_secs(),
                                    "Session was stable, resetting backoff"
                                );
                                backoff.reset();
                            }
                            if self.backoff_wait(&mut backoff, &error, &mut stop_rx).await {
                                break;
                            }
                        }
                    }
                }
                FeedState::Streaming | FeedState::Disconnected => break,
            }
        }

        apply(&mut machine, FeedEvent::Stop);
        info!(exchange = %exchange, "Feed stopped");
    }

    /// Sleep for the next backoff delay. Returns true if stop was requested.
    async fn backoff_wait(
        &self,
        backoff: &mut ExponentialBackoff,
        error: &ConnectorError,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        self.metrics.inc_reconnect_attempts();
        let delay = backoff.next_delay();
        warn!(
            exchange = %self.adapter.exchange(),
            error = %error,
            attempt = backoff.attempt(),
            delay_secs = delay.as_secs_f64(),
            "Connection lost, reconnecting"
        );
        sleep_or_stop(delay, stop_rx).await
    }

    async fn connect(&self, url: &str, stop_rx: &mut watch::Receiver<bool>) -> ConnectResult {
        debug!(exchange = %self.adapter.exchange(), url = %url, "Connecting");
        let timeout = self.config.connect_timeout;

        tokio::select! {
            biased;

            _ = wait_for_stop(stop_rx) => ConnectResult::Shutdown,

            result = tokio::time::timeout(timeout, connect_async(url)) => match result {
                Ok(Ok((ws, _))) => ConnectResult::Connected(ws),
                Ok(Err(e)) => ConnectResult::Error(ConnectorError::WebSocket(e.to_string())),
                Err(_) => ConnectResult::Error(ConnectorError::Timeout(timeout.as_millis() as u64)),
            },
        }
    }

    async fn stream(
        &self,
        ws: WsStream,
        natives: &[String],
        stop_rx: &mut watch::Receiver<bool>,
    ) -> SessionResult {
        let connected_at = Instant::now();
        let ended = |error: ConnectorError| SessionResult::Ended {
            duration: connected_at.elapsed(),
            error,
        };
        let (mut write, mut read) = ws.split();

        for msg in self.adapter.subscribe_messages(natives) {
            if let Err(e) = write.send(Message::Text(msg)).await {
                self.metrics.inc_websocket_errors();
                return ended(ConnectorError::WebSocket(e.to_string()));
            }
        }

        let (ping_period, ping_frame) = match self.adapter.keepalive() {
            Some((period, frame)) => (period, Some(frame)),
            None => (Duration::from_secs(3600), None),
        };
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);

        loop {
            tokio::select! {
                biased;

                _ = wait_for_stop(stop_rx) => {
                    let _ = write.close().await;
                    return SessionResult::Shutdown;
                }

                _ = ping.tick(), if ping_frame.is_some() => {
                    let frame = ping_frame.clone().unwrap_or_default();
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        self.metrics.inc_websocket_errors();
                        return ended(ConnectorError::WebSocket(e.to_string()));
                    }
                }

                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            warn!(exchange = %self.adapter.exchange(), error = %e, "WebSocket error");
                            self.metrics.inc_websocket_errors();
                            return ended(ConnectorError::WebSocket(e.to_string()));
                        }
                        None => return ended(ConnectorError::ConnectionClosed),
                    };

                    match msg {
                        Message::Text(text) => {
                            self.metrics.inc_messages_received();
                            match self.adapter.parse(&text) {
                                Ok(ParsedMessage::Rates(rates)) => {
                                    self.ingest(rates, RateSource::Stream);
                                }
                                Ok(ParsedMessage::Control) | Ok(ParsedMessage::Unknown) => {}
                                Err(e) => {
                                    self.metrics.inc_parse_errors();
                                    warn!(exchange = %self.adapter.exchange(), error = %e, "Failed to parse message");
                                }
                            }
                        }
                        Message::Ping(data) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                self.metrics.inc_websocket_errors();
                                return ended(ConnectorError::WebSocket(e.to_string()));
                            }
                        }
                        Message::Close(_) => {
                            info!(exchange = %self.adapter.exchange(), "WebSocket closed by server");
                            return ended(ConnectorError::ConnectionClosed);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Poll REST at the fixed interval until the websocket retry is due.
    /// Returns true if stop was requested.
    async fn poll_until_retry(&self, natives: &[String], stop_rx: &mut watch::Receiver<bool>) -> bool {
        let retry_at = Instant::now() + self.config.fallback_retry_interval;

        loop {
            let timeout = self.config.poll_timeout;
            let result = tokio::select! {
                biased;
                _ = wait_for_stop(stop_rx) => return true,
                result = tokio::time::timeout(timeout, self.adapter.poll(natives)) => result,
            };

            self.metrics.inc_fallback_polls();
            match result {
                Ok(Ok(rates)) => {
                    let written = self.ingest(rates, RateSource::Fallback);
                    debug!(exchange = %self.adapter.exchange(), written, "Fallback poll");
                }
                Ok(Err(e)) => {
                    self.metrics.inc_fallback_failures();
                    warn!(exchange = %self.adapter.exchange(), error = %e, "Fallback poll failed");
                }
                Err(_) => {
                    self.metrics.inc_fallback_failures();
                    warn!(
                        exchange = %self.adapter.exchange(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Fallback poll timed out"
                    );
                }
            }

            let now = Instant::now();
            if now >= retry_at {
                return false;
            }
            let wait = self.config.poll_interval.min(retry_at - now);
            if sleep_or_stop(wait, stop_rx).await {
                return true;
            }
            if Instant::now() >= retry_at {
                return false;
            }
        }
    }

    /// Map and upsert rates. Returns how many were written.
    fn ingest(&self, rates: Vec<NativeRate>, source: RateSource) -> u64 {
        let exchange = self.adapter.exchange();
        let observed_at_ms = common::now_ms();
        let mut written = 0;

        for native in rates {
            if native.event_time_ms > 0 {
                let lag = observed_at_ms.saturating_sub(native.event_time_ms);
                self.metrics.record_event_lag_ms(u64::try_from(lag).unwrap_or(0));
            }
            let Some(symbol) = self.mapper.canonicalize(exchange, &native.native_symbol) else {
                self.metrics.inc_unmapped_symbols();
                continue;
            };
            let outcome = self.market.upsert(FundingRate {
                exchange,
                symbol,
                rate: native.rate,
                next_funding_time_ms: native.next_funding_time_ms,
                observed_at_ms,
                source,
            });
            if outcome != UpsertOutcome::Rejected {
                written += 1;
            }
        }

        self.metrics.add_rates_received(written);
        written
    }
}

/// Resolves once the stop flag is set. Never resolves if the sender is gone.
async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Returns true if stop was requested before `delay` elapsed.
async fn sleep_or_stop(delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = wait_for_stop(stop_rx) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::BackoffPolicy;
    use market_data::SymbolTable;
    use model::CanonicalSymbol;
    use rust_decimal_macros::dec;
    use tokio::net::TcpListener;

    /// Adapter speaking `{"s": "...", "r": "..."}` frames with a canned REST poll.
    struct StubAdapter {
        url: String,
        poll_rates: Vec<NativeRate>,
    }

    #[async_trait]
    impl FeedAdapter for StubAdapter {
        fn exchange(&self) -> Exchange {
            Exchange::Bybit
        }

        fn stream_url(&self, _natives: &[String]) -> String {
            self.url.clone()
        }

        fn parse(&self, text: &str) -> Result<ParsedMessage, serde_json::Error> {
            let value: serde_json::Value = serde_json::from_str(text)?;
            let rate = value["r"].as_str().and_then(|r| r.parse().ok());
            Ok(match (value["s"].as_str(), rate) {
                (Some(s), Some(rate)) => ParsedMessage::Rates(vec![NativeRate {
                    native_symbol: s.to_string(),
                    rate,
                    next_funding_time_ms: 0,
                    event_time_ms: 0,
                }]),
                _ => ParsedMessage::Unknown,
            })
        }

        async fn poll(&self, _natives: &[String]) -> Result<Vec<NativeRate>, ConnectorError> {
            Ok(self.poll_rates.clone())
        }

        async fn listings(&self) -> Result<Vec<String>, ConnectorError> {
            Ok(vec![])
        }
    }

    fn btc() -> CanonicalSymbol {
        "BTC-USDT-PERP".parse().unwrap()
    }

    fn mapper() -> Arc<SymbolMapper> {
        let mut table = SymbolTable::new();
        table.insert(Exchange::Bybit, "BTCUSDT", btc());
        Arc::new(SymbolMapper::new(table))
    }

    fn fast_config() -> FeedConfig {
        FeedConfig {
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(2),
                jitter_factor: 0.0,
            },
            max_reconnect_attempts: 2,
            poll_interval: Duration::from_millis(10),
            fallback_retry_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(1),
            stable_after: Duration::from_secs(30),
        }
    }

    async fn wait_for_state(rx: &mut watch::Receiver<FeedState>, want: FeedState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while *rx.borrow_and_update() != want {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("feed never reached {}", want));
    }

    #[tokio::test]
    async fn test_falls_back_after_failed_reconnects() {
        let adapter = Arc::new(StubAdapter {
            url: "not a url".to_string(),
            poll_rates: vec![
                NativeRate {
                    native_symbol: "BTCUSDT".into(),
                    rate: dec!(0.0003),
                    next_funding_time_ms: 42,
                    event_time_ms: common::now_ms() - 5_000,
                },
                NativeRate {
                    native_symbol: "UNLISTEDUSDT".into(),
                    rate: dec!(0.0001),
                    next_funding_time_ms: 0,
                    event_time_ms: 0,
                },
            ],
        });
        let market = Arc::new(MarketState::new());
        let metrics = Arc::new(FeedMetrics::new());
        let feed = FeedConnection::new(adapter, fast_config(), market.clone(), mapper(), metrics.clone());

        let handle = feed.start(vec!["BTCUSDT".into()]);
        let mut state = handle.watch_state();
        wait_for_state(&mut state, FeedState::FallbackPolling).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.fallback_polls() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stored = market.get(Exchange::Bybit, &btc()).unwrap();
        assert_eq!(stored.source, RateSource::Fallback);
        assert_eq!(stored.rate, dec!(0.0003));
        assert_eq!(stored.next_funding_time_ms, 42);
        assert!(metrics.websocket_errors() >= 2);
        assert!(metrics.unmapped_symbols() >= 1);
        assert!(metrics.event_lag_ms() >= 5_000);
        assert_eq!(market.len(), 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_while_polling() {
        let adapter = Arc::new(StubAdapter {
            url: "not a url".to_string(),
            poll_rates: vec![],
        });
        let feed = FeedConnection::new(
            adapter,
            fast_config(),
            Arc::new(MarketState::new()),
            mapper(),
            Arc::new(FeedMetrics::new()),
        );
        let handle = feed.start(vec![]);
        let mut state = handle.watch_state();
        wait_for_state(&mut state, FeedState::FallbackPolling).await;

        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .unwrap();
        assert_eq!(*state.borrow(), FeedState::Disconnected);
    }

    #[tokio::test]
    async fn test_streams_from_websocket_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"s":"BTCUSDT","r":"0.0007"}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text("garbage".into())).await.unwrap();
            ws.send(Message::Text(r#"{"s":"ETHUSDT","r":"0.0001"}"#.into()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = ws.close(None).await;
        });

        let adapter = Arc::new(StubAdapter {
            url: format!("ws://{}", addr),
            poll_rates: vec![],
        });
        let market = Arc::new(MarketState::new());
        let metrics = Arc::new(FeedMetrics::new());
        let feed = FeedConnection::new(adapter, fast_config(), market.clone(), mapper(), metrics.clone());

        let handle = feed.start(vec!["BTCUSDT".into()]);
        let mut state = handle.watch_state();
        wait_for_state(&mut state, FeedState::Streaming).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.unmapped_symbols() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stored = market.get(Exchange::Bybit, &btc()).unwrap();
        assert_eq!(stored.source, RateSource::Stream);
        assert_eq!(stored.rate, dec!(0.0007));
        assert_eq!(metrics.parse_errors(), 1);

        // server hangs up and nothing listens any more
        wait_for_state(&mut state, FeedState::FallbackPolling).await;
        handle.stop().await;
    }
}
