//! Feed rates in, positions out: the evaluation pipeline end to end.

use arb_engine::{
    DryRunExecutor, EvaluationParams, ExclusionReason, ExecutionClient, ExecutionError, Freshness,
    LegClose, LegFill, ManagerConfig, OpportunityEngine, PositionManager, RiskLimits,
};
use async_trait::async_trait;
use market_data::{build_universe, MarketState, SymbolMapper, UniverseRequest, UpsertOutcome};
use model::{CanonicalSymbol, Exchange, FundingRate, LegSide, RateSource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const NOW: i64 = 1_700_000_000_000;

fn sym(s: &str) -> CanonicalSymbol {
    s.parse().unwrap()
}

fn freshness() -> Freshness {
    Freshness {
        stale_after_ms: 60_000,
        fallback_stale_after_ms: 120_000,
    }
}

fn params() -> EvaluationParams {
    EvaluationParams {
        fees: BTreeMap::from([
            (Exchange::Binance, dec!(0.0004)),
            (Exchange::Bybit, dec!(0.0006)),
            (Exchange::Okx, dec!(0.0005)),
        ]),
        slippage: dec!(0.0003),
        notional_usd: dec!(1000),
        freshness: freshness(),
        funding_interval_hours: 8,
    }
}

fn manager_config(max_positions: usize) -> ManagerConfig {
    ManagerConfig {
        limits: RiskLimits {
            max_positions,
            max_drawdown: dec!(0.05),
            stop_loss_pct: dec!(0.02),
            min_spread: dec!(0.0005),
        },
        close_spread_fraction: dec!(0.5),
        freshness: freshness(),
        funding_interval_ms: 8 * 3_600_000,
    }
}

/// Mapper over the natives each exchange would list for `bases`.
fn mapper(listed: &[(Exchange, &[&str])]) -> SymbolMapper {
    let listings: BTreeMap<Exchange, Vec<String>> = listed
        .iter()
        .map(|(exchange, bases)| {
            let natives = bases
                .iter()
                .map(|base| match exchange {
                    Exchange::Okx => format!("{}-USDT-SWAP", base),
                    _ => format!("{}USDT", base),
                })
                .collect();
            (*exchange, natives)
        })
        .collect();
    SymbolMapper::new(build_universe(&listings, &UniverseRequest::default()).table)
}

fn rate(exchange: Exchange, symbol: &str, rate: Decimal, observed_at_ms: i64) -> FundingRate {
    FundingRate {
        exchange,
        symbol: sym(symbol),
        rate,
        next_funding_time_ms: NOW + 3_600_000,
        observed_at_ms,
        source: RateSource::Stream,
    }
}

#[tokio::test]
async fn test_worked_example_opens_position() {
    let market = MarketState::new();
    let mapper = mapper(&[(Exchange::Binance, &["BTC"]), (Exchange::Bybit, &["BTC"])]);
    market.upsert(rate(Exchange::Binance, "BTC-USDT-PERP", dec!(-0.0007), NOW));
    market.upsert(rate(Exchange::Bybit, "BTC-USDT-PERP", dec!(0.0020), NOW));

    let snapshot = market.snapshot();
    let ranking = OpportunityEngine::new(params()).evaluate(&snapshot, &mapper, NOW);

    let top = &ranking.opportunities[0];
    assert_eq!(top.exchange_long, Exchange::Binance);
    assert_eq!(top.exchange_short, Exchange::Bybit);
    assert_eq!(top.expected_profit_per_period, dec!(1.4));
    assert_eq!(top.break_even_periods.round_dp(2), dec!(0.93));
    assert_eq!(top.next_funding_time_ms, NOW + 3_600_000);

    let mut manager = PositionManager::new(manager_config(5), Arc::new(DryRunExecutor));
    let report = manager.on_tick(&ranking, &snapshot, NOW).await;
    assert_eq!(report.opened, vec![sym("BTC-USDT-PERP")]);
}

#[test]
fn test_three_exchanges_zero_profit() {
    let market = MarketState::new();
    let all: &[&str] = &["SOL"];
    let mapper = mapper(&[
        (Exchange::Binance, all),
        (Exchange::Bybit, all),
        (Exchange::Okx, all),
    ]);
    market.upsert(rate(Exchange::Binance, "SOL-USDT-PERP", dec!(-0.0012), NOW));
    market.upsert(rate(Exchange::Bybit, "SOL-USDT-PERP", dec!(0.0001), NOW));
    market.upsert(rate(Exchange::Okx, "SOL-USDT-PERP", dec!(-0.0009), NOW));

    let ranking = OpportunityEngine::new(params()).evaluate(&market.snapshot(), &mapper, NOW);
    assert!(ranking.opportunities.is_empty());
    assert_eq!(ranking.excluded_for(ExclusionReason::Unprofitable), 1);
}

#[test]
fn test_symbol_becomes_eligible_with_second_rate() {
    let market = MarketState::new();
    let mapper = mapper(&[(Exchange::Binance, &["ETH"]), (Exchange::Okx, &["ETH"])]);
    let engine = OpportunityEngine::new(params());

    market.upsert(rate(Exchange::Binance, "ETH-USDT-PERP", dec!(0.0030), NOW));
    let ranking = engine.evaluate(&market.snapshot(), &mapper, NOW);
    assert!(ranking.opportunities.is_empty());
    assert_eq!(ranking.excluded_for(ExclusionReason::StaleRates), 1);

    market.upsert(rate(Exchange::Okx, "ETH-USDT-PERP", dec!(-0.0010), NOW + 500));
    let ranking = engine.evaluate(&market.snapshot(), &mapper, NOW + 500);
    assert_eq!(ranking.opportunities.len(), 1);
    assert_eq!(ranking.opportunities[0].exchange_long, Exchange::Okx);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_keep_newest() {
    let market = Arc::new(MarketState::new());
    let mut writers = Vec::new();
    for writer in 0..4i64 {
        let market = market.clone();
        writers.push(tokio::spawn(async move {
            for step in 0..250i64 {
                let observed = NOW + step * 4 + writer;
                market.upsert(rate(
                    Exchange::Bybit,
                    "BTC-USDT-PERP",
                    Decimal::new(observed - NOW, 6),
                    observed,
                ));
                tokio::task::yield_now().await;
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let newest = NOW + 249 * 4 + 3;
    let stored = market.get(Exchange::Bybit, &sym("BTC-USDT-PERP")).unwrap();
    assert_eq!(stored.observed_at_ms, newest);
    assert_eq!(stored.rate, Decimal::new(newest - NOW, 6));
    assert_eq!(
        market.upsert(rate(Exchange::Bybit, "BTC-USDT-PERP", dec!(0.01), newest)),
        UpsertOutcome::Rejected
    );
}

#[test]
fn test_evaluation_is_deterministic() {
    let market = MarketState::new();
    let bases: &[&str] = &["BTC", "ETH", "SOL", "XRP", "DOGE"];
    let mapper = mapper(&[
        (Exchange::Binance, bases),
        (Exchange::Bybit, bases),
        (Exchange::Okx, bases),
    ]);
    let mut rng = StdRng::seed_from_u64(7);
    for base in bases {
        for exchange in Exchange::ALL {
            let r = Decimal::new(rng.gen_range(-40..40), 4);
            market.upsert(rate(exchange, &format!("{}-USDT-PERP", base), r, NOW));
        }
    }

    let engine = OpportunityEngine::new(params());
    let snapshot = market.snapshot();
    let first = engine.evaluate(&snapshot, &mapper, NOW);
    for _ in 0..10 {
        assert_eq!(engine.evaluate(&market.snapshot(), &mapper, NOW), first);
    }
    let profits: Vec<Decimal> = first
        .opportunities
        .iter()
        .map(|o| o.expected_profit_per_period)
        .collect();
    assert!(profits.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_evaluation_is_deterministic_under_concurrent_writes() {
    let bases: &[&str] = &["BTC", "ETH", "SOL", "XRP", "DOGE"];
    let mapper = Arc::new(mapper(&[
        (Exchange::Binance, bases),
        (Exchange::Bybit, bases),
        (Exchange::Okx, bases),
    ]));
    let market = Arc::new(MarketState::new());
    let mut rng = StdRng::seed_from_u64(7);
    for base in bases {
        for exchange in Exchange::ALL {
            let r = Decimal::new(rng.gen_range(-40..40), 4);
            market.upsert(rate(exchange, &format!("{}-USDT-PERP", base), r, NOW));
        }
    }

    let engine = Arc::new(OpportunityEngine::new(params()));
    let snapshot = Arc::new(market.snapshot());
    let expected = engine.evaluate(&snapshot, &mapper, NOW);
    assert!(!expected.opportunities.is_empty());

    let writer = {
        let market = market.clone();
        tokio::spawn(async move {
            for step in 1..=500i64 {
                let base = ["BTC", "ETH", "SOL"][(step % 3) as usize];
                let r = Decimal::new((step % 80) - 40, 4);
                market.upsert(rate(Exchange::Okx, &format!("{}-USDT-PERP", base), r, NOW + step));
                tokio::task::yield_now().await;
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let (engine, mapper, snapshot) = (engine.clone(), mapper.clone(), snapshot.clone());
        readers.push(tokio::spawn(async move {
            let mut rankings = Vec::new();
            for _ in 0..50 {
                rankings.push(engine.evaluate(&snapshot, &mapper, NOW));
                tokio::task::yield_now().await;
            }
            rankings
        }));
    }

    for reader in readers {
        for ranking in reader.await.unwrap() {
            assert_eq!(ranking, expected);
        }
    }
    writer.await.unwrap();
    assert_ne!(market.snapshot(), *snapshot);
}

/// Fails a random share of calls.
struct Flaky {
    rng: parking_lot::Mutex<StdRng>,
}

impl Flaky {
    fn fails(&self) -> bool {
        self.rng.lock().gen_bool(0.3)
    }
}

#[async_trait]
impl ExecutionClient for Flaky {
    async fn open_leg(
        &self,
        exchange: Exchange,
        symbol: &CanonicalSymbol,
        side: LegSide,
        notional_usd: Decimal,
    ) -> Result<LegFill, ExecutionError> {
        if self.fails() {
            return Err(ExecutionError::Unavailable(exchange));
        }
        Ok(LegFill {
            fill_id: 0,
            exchange,
            symbol: symbol.clone(),
            side,
            notional_usd,
            filled_at_ms: NOW,
        })
    }

    async fn close_leg(
        &self,
        exchange: Exchange,
        symbol: &CanonicalSymbol,
    ) -> Result<LegClose, ExecutionError> {
        if self.fails() {
            return Err(ExecutionError::Timeout);
        }
        Ok(LegClose {
            fill_id: 0,
            exchange,
            symbol: symbol.clone(),
            closed_at_ms: NOW,
        })
    }
}

#[tokio::test]
async fn test_position_limits_hold_for_random_ticks() {
    let bases: &[&str] = &["BTC", "ETH", "SOL", "XRP", "DOGE", "ADA", "AVAX", "LINK"];
    let mapper = mapper(&[
        (Exchange::Binance, bases),
        (Exchange::Bybit, bases),
        (Exchange::Okx, bases),
    ]);
    let market = MarketState::new();
    let engine = OpportunityEngine::new(params());
    let executor = Arc::new(Flaky {
        rng: parking_lot::Mutex::new(StdRng::seed_from_u64(11)),
    });
    let mut manager = PositionManager::new(manager_config(3), executor);
    let mut rng = StdRng::seed_from_u64(42);

    for tick in 0..200i64 {
        let now = NOW + tick * 30_000;
        for base in bases {
            for exchange in Exchange::ALL {
                if rng.gen_bool(0.6) {
                    let r = Decimal::new(rng.gen_range(-60..60), 4);
                    market.upsert(rate(exchange, &format!("{}-USDT-PERP", base), r, now));
                }
            }
        }

        let snapshot = market.snapshot();
        let ranking = engine.evaluate(&snapshot, &mapper, now);
        let report = manager.on_tick(&ranking, &snapshot, now).await;

        assert!(manager.active_count() <= 3, "tick {}", tick);
        let symbols: BTreeSet<&CanonicalSymbol> = manager.positions().map(|p| &p.symbol).collect();
        assert_eq!(symbols.len(), manager.active_count(), "tick {}", tick);
        for position in manager.positions() {
            let stored = manager.get(&position.symbol).unwrap();
            assert!(std::ptr::eq(stored, position), "{} filed under another key", position.symbol);
            assert_ne!(position.exchange_long, position.exchange_short);
        }
        for symbol in &report.opened {
            assert_eq!(report.opened.iter().filter(|s| *s == symbol).count(), 1, "tick {}", tick);
        }
    }
}
