mod config;
mod display;

use arb_engine::{DryRunExecutor, EvaluationLoop, OpportunityEngine, PositionManager};
use config::{ConfigError, ValidatedConfig};
use connector_core::{ConnectorError, FeedAdapter, FeedState};
use connector_exchanges::{adapter_for, FeedConnection, FeedHandle};
use display::TerminalPresenter;
use futures_util::future::join_all;
use market_data::{
    build_universe, native_symbol, MarketState, SymbolMapper, SymbolTable, UniverseRequest,
};
use metrics::{EngineMetrics, FeedMetrics};
use model::Exchange;
use rest_client::RestError;
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Interval for periodic health status logging.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);
/// How often listings are re-fetched so delisted instruments stop ranking.
const UNIVERSE_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
/// Pause before the single retry of a failed listing fetch.
const LISTING_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot build {exchange} client: {source}")]
    Adapter {
        exchange: Exchange,
        source: RestError,
    },

    #[error("no symbol is listed on two or more exchanges")]
    EmptyUniverse,
}

#[tokio::main]
async fn main() -> ExitCode {
    common::init_logging();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let config = config::load()?;
    info!(
        environment = %config.environment,
        exchanges = ?config.exchanges,
        interval_secs = config.check_interval.as_secs(),
        "Starting funding arbitrage engine (dry run)"
    );

    let adapters = config
        .exchanges
        .iter()
        .map(|&exchange| {
            adapter_for(exchange, config.environment)
                .map(|adapter| (exchange, adapter))
                .map_err(|source| StartupError::Adapter { exchange, source })
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let listings = fetch_listings(&adapters, &config).await;
    let universe = build_universe(&listings, &config.universe);
    for symbol in &universe.missing {
        warn!(symbol = %symbol, "Configured symbol is not listed anywhere");
    }
    for symbol in &universe.single_coverage {
        warn!(symbol = %symbol, "Symbol listed on one exchange only, never ranked");
    }
    if universe.table.symbols().count() == universe.single_coverage.len() {
        return Err(StartupError::EmptyUniverse);
    }
    info!(
        symbols = universe.table.symbols().count(),
        single = universe.single_coverage.len(),
        unparsed = universe.unparsed,
        "Symbol universe built"
    );

    let mapper = Arc::new(SymbolMapper::new(universe.table));
    let market = Arc::new(MarketState::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(refresh_universe(
        adapters.clone(),
        config.universe.clone(),
        mapper.clone(),
        shutdown_tx.subscribe(),
    ));

    let mut feeds: Vec<(FeedHandle, Arc<FeedMetrics>)> = Vec::new();
    for (exchange, adapter) in adapters {
        let natives = mapper.table().natives(exchange);
        if natives.is_empty() {
            warn!(exchange = %exchange, "No tracked symbols, feed not started");
            continue;
        }
        info!(exchange = %exchange, symbols = natives.len(), "Starting feed");
        let feed_metrics = Arc::new(FeedMetrics::new());
        let handle = FeedConnection::new(
            adapter,
            config.feed.clone(),
            market.clone(),
            mapper.clone(),
            feed_metrics.clone(),
        )
        .start(natives);
        feeds.push((handle, feed_metrics));
    }

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, initiating shutdown");
            let _ = shutdown_tx_clone.send(true);
        }
    });

    let health = feeds
        .iter()
        .map(|(handle, m)| (handle.exchange(), handle.watch_state(), m.clone()))
        .collect();
    tokio::spawn(report_health(health, shutdown_tx.subscribe()));

    let engine_metrics = Arc::new(EngineMetrics::new());
    let evaluation = EvaluationLoop::new(
        OpportunityEngine::new(config.evaluation),
        PositionManager::new(config.manager, Arc::new(DryRunExecutor)),
        market,
        mapper,
        engine_metrics.clone(),
        config.check_interval,
    );
    evaluation
        .run(TerminalPresenter::default(), shutdown_rx)
        .await;

    for (handle, _) in feeds {
        handle.stop().await;
    }

    let summary = engine_metrics.snapshot();
    info!(
        ticks = summary.ticks,
        opened = summary.positions_opened,
        closed = summary.positions_closed,
        failures = summary.execution_failures,
        funding_events = summary.funding_events,
        "Shutdown complete"
    );
    Ok(())
}

/// Native listings per exchange. A failed fetch falls back to the
/// configured symbols, spelled natively.
async fn fetch_listings(
    adapters: &BTreeMap<Exchange, Arc<dyn FeedAdapter>>,
    config: &ValidatedConfig,
) -> BTreeMap<Exchange, Vec<String>> {
    let fetches = adapters.iter().map(|(&exchange, adapter)| async move {
        match listings_with_retry(exchange, adapter.as_ref()).await {
            Ok(natives) => {
                info!(exchange = %exchange, count = natives.len(), "Fetched listings");
                (exchange, natives)
            }
            Err(e) => {
                let configured: Vec<String> = config
                    .universe
                    .symbols
                    .iter()
                    .flatten()
                    .map(|symbol| native_symbol(exchange, symbol))
                    .collect();
                warn!(
                    exchange = %exchange,
                    error = %e,
                    fallback = configured.len(),
                    "Listing fetch failed, using configured symbols"
                );
                (exchange, configured)
            }
        }
    });
    join_all(fetches).await.into_iter().collect()
}

/// One retry when the failure looks transient.
async fn listings_with_retry(
    exchange: Exchange,
    adapter: &dyn FeedAdapter,
) -> Result<Vec<String>, ConnectorError> {
    match adapter.listings().await {
        Err(e) if e.is_retryable() => {
            warn!(exchange = %exchange, error = %e, "Listing fetch failed, retrying");
            tokio::time::sleep(LISTING_RETRY_DELAY).await;
            adapter.listings().await
        }
        result => result,
    }
}

/// Rebuild the symbol table from fresh listings every
/// `UNIVERSE_REFRESH_INTERVAL`.
///
/// Feeds keep their startup subscriptions, so the new table only ever
/// shrinks: instruments delisted since startup lose coverage and stop
/// ranking. A round where any exchange fails keeps the current table.
async fn refresh_universe(
    adapters: BTreeMap<Exchange, Arc<dyn FeedAdapter>>,
    request: UniverseRequest,
    mapper: Arc<SymbolMapper>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let subscribed = mapper.table();
    let mut interval = tokio::time::interval(UNIVERSE_REFRESH_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let fetches = adapters.iter().map(|(&exchange, adapter)| async move {
                    (exchange, listings_with_retry(exchange, adapter.as_ref()).await)
                });
                let mut listings = BTreeMap::new();
                for (exchange, result) in join_all(fetches).await {
                    match result {
                        Ok(natives) => {
                            listings.insert(exchange, natives);
                        }
                        Err(e) => {
                            warn!(exchange = %exchange, error = %e, "Listing refresh failed, keeping symbol table");
                        }
                    }
                }
                if listings.len() == adapters.len() {
                    let universe = build_universe(&subscribed_only(listings, &subscribed), &request);
                    mapper.refresh(universe.table);
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Drop listings no running feed is subscribed to.
fn subscribed_only(
    listings: BTreeMap<Exchange, Vec<String>>,
    subscribed: &SymbolTable,
) -> BTreeMap<Exchange, Vec<String>> {
    listings
        .into_iter()
        .map(|(exchange, natives)| {
            let kept = natives
                .into_iter()
                .filter(|native| subscribed.canonicalize(exchange, native).is_some())
                .collect();
            (exchange, kept)
        })
        .collect()
}

async fn report_health(
    feeds: Vec<(Exchange, watch::Receiver<FeedState>, Arc<FeedMetrics>)>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                for (exchange, state, feed_metrics) in &feeds {
                    let snapshot = feed_metrics.snapshot();
                    let current = *state.borrow();
                    info!(
                        exchange = %exchange,
                        state = %current,
                        status = %snapshot.health_status(),
                        rates = snapshot.rates_received,
                        unmapped = snapshot.unmapped_symbols,
                        errors = snapshot.websocket_errors + snapshot.parse_errors,
                        reconnects = snapshot.reconnect_attempts,
                        fallback_polls = snapshot.fallback_polls,
                        lag_ms = snapshot.event_lag_ms,
                        "Health check"
                    );
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use connector_core::ParsedMessage;
    use model::{CanonicalSymbol, NativeRate};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Listings {
        failures: AtomicU32,
        error: fn() -> ConnectorError,
    }

    #[async_trait]
    impl FeedAdapter for Listings {
        fn exchange(&self) -> Exchange {
            Exchange::Okx
        }

        fn stream_url(&self, _natives: &[String]) -> String {
            String::new()
        }

        fn parse(&self, _text: &str) -> Result<ParsedMessage, serde_json::Error> {
            Ok(ParsedMessage::Unknown)
        }

        async fn poll(&self, _natives: &[String]) -> Result<Vec<NativeRate>, ConnectorError> {
            Ok(vec![])
        }

        async fn listings(&self) -> Result<Vec<String>, ConnectorError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err((self.error)());
            }
            Ok(vec!["BTC-USDT-SWAP".to_string()])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_fetch_retries_transient_error() {
        let adapter = Listings {
            failures: AtomicU32::new(1),
            error: || ConnectorError::Rest(RestError::Timeout),
        };
        let natives = listings_with_retry(Exchange::Okx, &adapter).await.unwrap();
        assert_eq!(natives, vec!["BTC-USDT-SWAP"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_fetch_gives_up_on_permanent_error() {
        let adapter = Listings {
            failures: AtomicU32::new(1),
            error: || ConnectorError::Parse("not a listing".into()),
        };
        assert!(listings_with_retry(Exchange::Okx, &adapter).await.is_err());
        assert_eq!(adapter.failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_refresh_keeps_only_subscribed_listings() {
        let btc: CanonicalSymbol = "BTC-USDT-PERP".parse().unwrap();
        let mut subscribed = SymbolTable::new();
        subscribed.insert(Exchange::Binance, "BTCUSDT", btc.clone());
        subscribed.insert(Exchange::Okx, "BTC-USDT-SWAP", btc.clone());

        let listings = BTreeMap::from([
            (Exchange::Binance, vec!["BTCUSDT".to_string(), "NEWUSDT".to_string()]),
            (Exchange::Okx, vec!["ETH-USDT-SWAP".to_string()]),
        ]);
        let kept = subscribed_only(listings, &subscribed);
        assert_eq!(kept[&Exchange::Binance], vec!["BTCUSDT"]);
        assert!(kept[&Exchange::Okx].is_empty());

        // okx delisted BTC since startup
        let universe = build_universe(&kept, &UniverseRequest::default());
        let mapper = SymbolMapper::new(subscribed);
        mapper.refresh(universe.table);
        assert_eq!(mapper.coverage(&btc).len(), 1);
        assert_eq!(mapper.canonicalize(Exchange::Okx, "BTC-USDT-SWAP"), None);
    }
}
