//! Position lifecycle: NONE → PENDING_OPEN → OPEN → PENDING_CLOSE → NONE.

use crate::error::EngineError;
use crate::execution::{with_retry, ExecutionClient, ExecutionError};
use crate::opportunity::{Freshness, Opportunity, Ranking};
use crate::position::{CloseReason, LegRates, Position, PositionStatus};
use crate::risk::{RiskLimits, RiskPolicy, RiskVerdict};
use market_data::MarketSnapshot;
use model::{CanonicalSymbol, Exchange, LegSide};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub limits: RiskLimits,
    /// Close once the spread falls below this fraction of the entry spread.
    pub close_spread_fraction: Decimal,
    pub freshness: Freshness,
    pub funding_interval_ms: i64,
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.limits.validate()?;
        let fraction = self.close_spread_fraction;
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(EngineError::OutOfRange {
                name: "close_spread_fraction",
                expected: "in (0, 1]",
                value: fraction,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedAction {
    Open,
    Close,
    /// Closing the filled leg of a one-sided open.
    Unwind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub symbol: CanonicalSymbol,
    pub exchange: Exchange,
    pub action: FailedAction,
    pub error: ExecutionError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub reason: CloseReason,
    pub closed_at_ms: i64,
}

/// What one tick changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub opened: Vec<CanonicalSymbol>,
    pub closed: Vec<ClosedPosition>,
    pub failures: Vec<ExecutionFailure>,
    pub funding_events: u32,
}

/// Owns every position; driven only by the evaluation task.
///
/// At most one position per symbol and at most `max_positions` in any state.
pub struct PositionManager {
    config: ManagerConfig,
    executor: Arc<dyn ExecutionClient>,
    positions: BTreeMap<CanonicalSymbol, Position>,
}

impl PositionManager {
    pub fn new(config: ManagerConfig, executor: Arc<dyn ExecutionClient>) -> Self {
        Self {
            config,
            executor,
            positions: BTreeMap::new(),
        }
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn get(&self, symbol: &CanonicalSymbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn active_count(&self) -> usize {
        self.positions.len()
    }

    pub async fn on_tick(&mut self, ranking: &Ranking, snapshot: &MarketSnapshot, now_ms: i64) -> TickReport {
        let mut report = TickReport::default();
        self.accrue_funding(snapshot, now_ms, &mut report);
        self.close_phase(ranking, snapshot, now_ms, &mut report).await;
        self.open_phase(ranking, now_ms, &mut report).await;
        report
    }

    /// Close every position, open or half-closed, with [`CloseReason::Shutdown`].
    ///
    /// Each leg gets one retry. Positions whose close still fails stay in the
    /// book and are returned as failures.
    pub async fn close_all(&mut self, now_ms: i64) -> TickReport {
        let mut report = TickReport::default();
        let symbols: Vec<CanonicalSymbol> = self.positions.keys().cloned().collect();
        for symbol in symbols {
            self.close_position(&symbol, CloseReason::Shutdown, now_ms, &mut report).await;
        }
        report
    }

    fn leg_rates(
        &self,
        position: &Position,
        snapshot: &MarketSnapshot,
        now_ms: i64,
        fresh_only: bool,
    ) -> Option<LegRates> {
        let long = snapshot.get(&position.symbol, position.exchange_long)?;
        let short = snapshot.get(&position.symbol, position.exchange_short)?;
        if fresh_only
            && !(self.config.freshness.is_fresh(long, now_ms)
                && self.config.freshness.is_fresh(short, now_ms))
        {
            return None;
        }
        Some(LegRates {
            long: long.rate,
            short: short.rate,
        })
    }

    /// Credit every funding timestamp that has passed, at the latest known rates.
    ///
    /// A position with a closed leg no longer collects on both sides and is
    /// skipped until the close finishes.
    fn accrue_funding(&mut self, snapshot: &MarketSnapshot, now_ms: i64, report: &mut TickReport) {
        let interval = self.config.funding_interval_ms;
        if interval <= 0 {
            return;
        }

        let updates: Vec<(CanonicalSymbol, LegRates)> = self
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::Open && p.next_funding_time_ms > 0)
            .filter(|p| !p.long_closed && !p.short_closed)
            .filter(|p| now_ms >= p.next_funding_time_ms)
            .filter_map(|p| Some((p.symbol.clone(), self.leg_rates(p, snapshot, now_ms, false)?)))
            .collect();

        for (symbol, rates) in updates {
            let Some(position) = self.positions.get_mut(&symbol) else {
                continue;
            };
            while now_ms >= position.next_funding_time_ms {
                let payment = position.notional_usd * rates.spread();
                position.accrued_funding += payment;
                position.funding_periods += 1;
                position.next_funding_time_ms += interval;
                report.funding_events += 1;
                info!(
                    symbol = %symbol,
                    payment = %payment.round_dp(4),
                    accrued = %position.accrued_funding.round_dp(4),
                    periods = position.funding_periods,
                    "funding accrued"
                );
            }
        }
    }

    async fn close_phase(
        &mut self,
        ranking: &Ranking,
        snapshot: &MarketSnapshot,
        now_ms: i64,
        report: &mut TickReport,
    ) {
        let mut to_close = Vec::new();
        let symbols: Vec<CanonicalSymbol> = self.positions.keys().cloned().collect();

        for symbol in symbols {
            let fresh = match self.positions.get(&symbol) {
                Some(p) if p.status == PositionStatus::Open => {
                    self.leg_rates(p, snapshot, now_ms, true)
                }
                _ => continue,
            };
            let Some(position) = self.positions.get_mut(&symbol) else {
                continue;
            };
            position.peak_pnl = position.peak_pnl.max(position.mark(fresh.as_ref()));

            if let Some(reason) = position.close_reason {
                to_close.push((symbol, reason));
                continue;
            }
            if let Some(reason) = self.close_reason(&symbol, fresh, ranking) {
                to_close.push((symbol, reason));
            }
        }

        for (symbol, reason) in to_close {
            self.close_position(&symbol, reason, now_ms, report).await;
        }
    }

    fn close_reason(
        &self,
        symbol: &CanonicalSymbol,
        fresh: Option<LegRates>,
        ranking: &Ranking,
    ) -> Option<CloseReason> {
        let position = self.positions.get(symbol)?;

        match RiskPolicy::check(position, fresh.as_ref(), &self.config.limits) {
            RiskVerdict::StopLoss => return Some(CloseReason::StopLoss),
            RiskVerdict::DrawdownBreach => return Some(CloseReason::DrawdownBreach),
            RiskVerdict::Ok => {}
        }

        // stale legs: hold
        let current = fresh?.spread();
        if current < self.config.close_spread_fraction * position.entry_spread {
            return Some(CloseReason::SpreadDecayed);
        }

        let better = ranking
            .top_for(symbol)
            .filter(|top| top.pair() != position.pair() && top.spread > current);
        better.map(|_| CloseReason::BetterPair)
    }

    async fn close_position(
        &mut self,
        symbol: &CanonicalSymbol,
        reason: CloseReason,
        now_ms: i64,
        report: &mut TickReport,
    ) {
        let executor = Arc::clone(&self.executor);
        let Some(position) = self.positions.get_mut(symbol) else {
            return;
        };
        position.status = PositionStatus::PendingClose;
        position.close_reason = Some(reason);
        info!(
            symbol = %symbol,
            reason = %reason,
            long = %position.exchange_long,
            short = %position.exchange_short,
            pnl = %position.pnl().round_dp(4),
            "closing position"
        );

        for (exchange, side) in [
            (position.exchange_long, LegSide::Long),
            (position.exchange_short, LegSide::Short),
        ] {
            let already = match side {
                LegSide::Long => position.long_closed,
                LegSide::Short => position.short_closed,
            };
            if already {
                continue;
            }
            match with_retry("close leg", || executor.close_leg(exchange, symbol)).await {
                Ok(_) => match side {
                    LegSide::Long => position.long_closed = true,
                    LegSide::Short => position.short_closed = true,
                },
                Err(e) => {
                    warn!(symbol = %symbol, exchange = %exchange, error = %e, "close failed, will retry next tick");
                    report.failures.push(ExecutionFailure {
                        symbol: symbol.clone(),
                        exchange,
                        action: FailedAction::Close,
                        error: e,
                    });
                }
            }
        }

        if position.long_closed && position.short_closed {
            if let Some(closed) = self.positions.remove(symbol) {
                info!(
                    symbol = %symbol,
                    pnl = %closed.pnl().round_dp(4),
                    periods = closed.funding_periods,
                    "position closed"
                );
                report.closed.push(ClosedPosition {
                    position: closed,
                    reason,
                    closed_at_ms: now_ms,
                });
            }
        } else {
            position.status = PositionStatus::Open;
        }
    }

    async fn open_phase(&mut self, ranking: &Ranking, now_ms: i64, report: &mut TickReport) {
        let limits = &self.config.limits;
        let (max_positions, min_spread) = (limits.max_positions, limits.min_spread);

        for opportunity in &ranking.opportunities {
            if self.positions.len() >= max_positions {
                debug!(max_positions, "position limit reached");
                break;
            }
            if self.positions.contains_key(&opportunity.symbol) || opportunity.spread < min_spread {
                continue;
            }
            self.open_position(opportunity, now_ms, report).await;
        }
    }

    async fn open_position(&mut self, opp: &Opportunity, now_ms: i64, report: &mut TickReport) {
        let symbol = &opp.symbol;
        debug_assert!(!self.positions.contains_key(symbol));
        self.positions.insert(
            symbol.clone(),
            Position {
                symbol: symbol.clone(),
                exchange_long: opp.exchange_long,
                exchange_short: opp.exchange_short,
                notional_usd: opp.notional_usd,
                entry_time_ms: now_ms,
                entry_spread: opp.spread,
                status: PositionStatus::PendingOpen,
                entry_costs: opp.fees,
                accrued_funding: Decimal::ZERO,
                funding_periods: 0,
                peak_pnl: opp.expected_profit_per_period,
                next_funding_time_ms: opp.next_funding_time_ms,
                long_closed: false,
                short_closed: false,
                close_reason: None,
            },
        );
        info!(
            symbol = %symbol,
            long = %opp.exchange_long,
            short = %opp.exchange_short,
            spread = %opp.spread,
            profit = %opp.expected_profit_per_period.round_dp(4),
            "opening position"
        );

        let executor = Arc::clone(&self.executor);
        let notional = opp.notional_usd;

        let long = with_retry("open long", || {
            executor.open_leg(opp.exchange_long, symbol, LegSide::Long, notional)
        })
        .await;
        if let Err(e) = long {
            self.abandon_open(symbol, opp.exchange_long, e, report);
            return;
        }

        let short = with_retry("open short", || {
            executor.open_leg(opp.exchange_short, symbol, LegSide::Short, notional)
        })
        .await;
        if let Err(e) = short {
            self.abandon_open(symbol, opp.exchange_short, e, report);
            if let Err(e) = with_retry("unwind long", || executor.close_leg(opp.exchange_long, symbol)).await {
                error!(
                    symbol = %symbol,
                    exchange = %opp.exchange_long,
                    error = %e,
                    "unwind failed, leg left open"
                );
                report.failures.push(ExecutionFailure {
                    symbol: symbol.clone(),
                    exchange: opp.exchange_long,
                    action: FailedAction::Unwind,
                    error: e,
                });
            }
            return;
        }

        if let Some(position) = self.positions.get_mut(symbol) {
            position.status = PositionStatus::Open;
        }
        report.opened.push(symbol.clone());
    }

    fn abandon_open(
        &mut self,
        symbol: &CanonicalSymbol,
        exchange: Exchange,
        error: ExecutionError,
        report: &mut TickReport,
    ) {
        self.positions.remove(symbol);
        warn!(symbol = %symbol, exchange = %exchange, error = %error, "open failed, position abandoned");
        report.failures.push(ExecutionFailure {
            symbol: symbol.clone(),
            exchange,
            action: FailedAction::Open,
            error,
        });
    }
}
