//! Fixed-cadence evaluation task.

use crate::manager::{PositionManager, TickReport};
use crate::opportunity::{OpportunityEngine, Ranking};
use crate::position::Position;
use market_data::{MarketState, SymbolMapper};
use metrics::EngineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Everything the presentation side sees of one tick.
pub struct TickView<'a> {
    pub ranking: &'a Ranking,
    pub positions: Vec<&'a Position>,
    pub report: &'a TickReport,
    pub now_ms: i64,
}

pub trait Presenter: Send {
    fn present(&mut self, view: &TickView<'_>);
}

pub struct EvaluationLoop {
    engine: OpportunityEngine,
    manager: PositionManager,
    market: Arc<MarketState>,
    mapper: Arc<SymbolMapper>,
    metrics: Arc<EngineMetrics>,
    interval: Duration,
}

impl EvaluationLoop {
    pub fn new(
        engine: OpportunityEngine,
        manager: PositionManager,
        market: Arc<MarketState>,
        mapper: Arc<SymbolMapper>,
        metrics: Arc<EngineMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            manager,
            market,
            mapper,
            metrics,
            interval,
        }
    }

    pub fn manager(&self) -> &PositionManager {
        &self.manager
    }

    /// Snapshot, rank, then drive positions. An empty market yields an empty ranking.
    pub async fn tick(&mut self, now_ms: i64) -> (Ranking, TickReport) {
        let snapshot = self.market.snapshot();
        let ranking = self.engine.evaluate(&snapshot, &self.mapper, now_ms);
        let report = self.manager.on_tick(&ranking, &snapshot, now_ms).await;

        self.metrics
            .record_tick(ranking.opportunities.len(), ranking.excluded());
        self.record(&report);

        debug!(
            rates = snapshot.rate_count(),
            opportunities = ranking.opportunities.len(),
            excluded = ranking.excluded(),
            positions = self.manager.active_count(),
            "tick evaluated"
        );
        (ranking, report)
    }

    fn record(&self, report: &TickReport) {
        for _ in &report.opened {
            self.metrics.inc_positions_opened();
        }
        for _ in &report.closed {
            self.metrics.inc_positions_closed();
        }
        for _ in &report.failures {
            self.metrics.inc_execution_failures();
        }
        self.metrics.add_funding_events(u64::from(report.funding_events));
    }

    /// Close every position before the process exits.
    pub async fn close_all(&mut self, now_ms: i64) -> TickReport {
        let report = self.manager.close_all(now_ms).await;
        self.record(&report);
        if self.manager.active_count() == 0 {
            info!(closed = report.closed.len(), "all positions closed");
        } else {
            warn!(
                closed = report.closed.len(),
                remaining = self.manager.active_count(),
                "positions still open at shutdown"
            );
        }
        report
    }

    /// Run until shutdown is signaled, then close every position. The first
    /// tick fires immediately.
    pub async fn run<P: Presenter>(mut self, mut presenter: P, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs_f64(), "starting evaluation loop");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("shutdown signal received");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let now_ms = common::now_ms();
                    let (ranking, report) = self.tick(now_ms).await;
                    presenter.present(&TickView {
                        ranking: &ranking,
                        positions: self.manager.positions().collect(),
                        report: &report,
                        now_ms,
                    });
                }
            }
        }

        self.close_all(common::now_ms()).await;
        info!("evaluation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::DryRunExecutor;
    use crate::manager::ManagerConfig;
    use crate::opportunity::{EvaluationParams, Freshness};
    use crate::risk::RiskLimits;
    use market_data::SymbolTable;
    use model::{CanonicalSymbol, Exchange, FundingRate, RateSource};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl Presenter for Counting {
        fn present(&mut self, _view: &TickView<'_>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn btc_market(now: i64) -> Arc<MarketState> {
        let market = Arc::new(MarketState::new());
        for (exchange, rate) in [(Exchange::Binance, dec!(-0.0007)), (Exchange::Bybit, dec!(0.0020))] {
            market.upsert(FundingRate {
                exchange,
                symbol: "BTC-USDT-PERP".parse().unwrap(),
                rate,
                next_funding_time_ms: 0,
                observed_at_ms: now,
                source: RateSource::Stream,
            });
        }
        market
    }

    fn evaluation_loop(market: Arc<MarketState>, metrics: Arc<EngineMetrics>) -> EvaluationLoop {
        let freshness = Freshness {
            stale_after_ms: 60_000,
            fallback_stale_after_ms: 120_000,
        };
        let params = EvaluationParams {
            fees: BTreeMap::from([
                (Exchange::Binance, dec!(0.0004)),
                (Exchange::Bybit, dec!(0.0006)),
            ]),
            slippage: dec!(0.0003),
            notional_usd: dec!(1000),
            freshness,
            funding_interval_hours: 8,
        };
        let config = ManagerConfig {
            limits: RiskLimits {
                max_positions: 5,
                max_drawdown: dec!(0.05),
                stop_loss_pct: dec!(0.02),
                min_spread: dec!(0.0005),
            },
            close_spread_fraction: dec!(0.5),
            freshness,
            funding_interval_ms: params.funding_interval_ms(),
        };

        let mut table = SymbolTable::new();
        let btc: CanonicalSymbol = "BTC-USDT-PERP".parse().unwrap();
        table.insert(Exchange::Binance, "BTCUSDT", btc.clone());
        table.insert(Exchange::Bybit, "BTCUSDT", btc);

        EvaluationLoop::new(
            OpportunityEngine::new(params),
            PositionManager::new(config, Arc::new(DryRunExecutor)),
            market,
            Arc::new(SymbolMapper::new(table)),
            metrics,
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn test_tick_on_empty_market() {
        let metrics = Arc::new(EngineMetrics::new());
        let mut evaluation = evaluation_loop(Arc::new(MarketState::new()), metrics.clone());

        let (ranking, report) = evaluation.tick(1_000).await;
        assert!(ranking.opportunities.is_empty());
        assert_eq!(report, TickReport::default());
        assert_eq!(metrics.snapshot().ticks, 1);
    }

    #[tokio::test]
    async fn test_tick_opens_and_counts() {
        let now = 1_700_000_000_000;
        let metrics = Arc::new(EngineMetrics::new());
        let mut evaluation = evaluation_loop(btc_market(now), metrics.clone());

        let (ranking, report) = evaluation.tick(now).await;
        assert_eq!(ranking.opportunities.len(), 1);
        assert_eq!(report.opened.len(), 1);
        assert_eq!(evaluation.manager().active_count(), 1);
        assert_eq!(metrics.snapshot().positions_opened, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let presented = Arc::new(AtomicUsize::new(0));
        let evaluation = evaluation_loop(Arc::new(MarketState::new()), Arc::new(EngineMetrics::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(evaluation.run(Counting(presented.clone()), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(70)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(presented.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_run_closes_positions_on_shutdown() {
        let now = common::now_ms();
        let metrics = Arc::new(EngineMetrics::new());
        let mut evaluation = evaluation_loop(btc_market(now), metrics.clone());
        evaluation.tick(now).await;
        assert_eq!(evaluation.manager().active_count(), 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        evaluation.run(Counting(Arc::new(AtomicUsize::new(0))), shutdown_rx).await;

        let counters = metrics.snapshot();
        assert_eq!(counters.positions_opened, 1);
        assert_eq!(counters.positions_closed, 1);
        assert_eq!(counters.execution_failures, 0);
    }
}
