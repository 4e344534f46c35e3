//! Pairwise funding spreads and the profitability model.

use crate::error::EngineError;
use market_data::{MarketSnapshot, SymbolMapper};
use model::{CanonicalSymbol, Exchange, FundingRate, RateSource};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::BTreeMap;

const HOURS_PER_YEAR: i64 = 365 * 24;
const MS_PER_HOUR: i64 = 3_600_000;

/// Maximum age of a rate, per source, before it stops counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub stale_after_ms: i64,
    pub fallback_stale_after_ms: i64,
}

impl Freshness {
    pub fn is_fresh(&self, rate: &FundingRate, now_ms: i64) -> bool {
        let limit = match rate.source {
            RateSource::Stream => self.stale_after_ms,
            RateSource::Fallback => self.fallback_stale_after_ms,
        };
        rate.age_ms(now_ms) <= limit
    }
}

/// Cost and sizing inputs for ranking.
#[derive(Debug, Clone)]
pub struct EvaluationParams {
    /// Taker fee per exchange, as a fraction of notional per leg.
    pub fees: BTreeMap<Exchange, Decimal>,
    /// Round-trip slippage estimate, as a fraction of notional.
    pub slippage: Decimal,
    /// Size of each leg in USD.
    pub notional_usd: Decimal,
    pub freshness: Freshness,
    /// Hours between funding payments; must divide 24.
    pub funding_interval_hours: u32,
}

impl EvaluationParams {
    pub fn validate(&self, exchanges: &[Exchange]) -> Result<(), EngineError> {
        for exchange in exchanges {
            match self.fees.get(exchange) {
                None => return Err(EngineError::MissingFee(*exchange)),
                Some(fee) if fee.is_sign_negative() => {
                    return Err(EngineError::OutOfRange {
                        name: "fee rate",
                        expected: "non-negative",
                        value: *fee,
                    })
                }
                Some(_) => {}
            }
        }
        if self.slippage.is_sign_negative() {
            return Err(EngineError::OutOfRange {
                name: "slippage",
                expected: "non-negative",
                value: self.slippage,
            });
        }
        if self.notional_usd <= Decimal::ZERO {
            return Err(EngineError::OutOfRange {
                name: "position_size_usd",
                expected: "positive",
                value: self.notional_usd,
            });
        }
        let hours = self.funding_interval_hours;
        if hours == 0 || 24 % hours != 0 {
            return Err(EngineError::FundingInterval(hours));
        }
        Ok(())
    }

    /// Funding events per year; 1095 for the usual 8h interval.
    pub fn periods_per_year(&self) -> Decimal {
        Decimal::from(HOURS_PER_YEAR / i64::from(self.funding_interval_hours.max(1)))
    }

    pub fn funding_interval_ms(&self) -> i64 {
        i64::from(self.funding_interval_hours) * MS_PER_HOUR
    }
}

/// The best pair for one symbol at one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Opportunity {
    pub symbol: CanonicalSymbol,
    /// Exchange with the lower rate; the long leg collects there.
    pub exchange_long: Exchange,
    /// Exchange with the higher rate.
    pub exchange_short: Exchange,
    pub rate_long: Decimal,
    pub rate_short: Decimal,
    /// `rate_short - rate_long`, never negative.
    pub spread: Decimal,
    pub notional_usd: Decimal,
    /// USD earned per funding period after fees and slippage; always positive.
    pub expected_profit_per_period: Decimal,
    /// Both legs' taker fees plus slippage, in USD.
    pub fees: Decimal,
    /// Periods of profit needed to earn back `fees`.
    pub break_even_periods: Decimal,
    /// Annualized return on notional as a fraction.
    pub apr: Decimal,
    /// Earliest next funding time of the two legs, or one interval from now
    /// when neither reported it.
    pub next_funding_time_ms: i64,
}

impl Opportunity {
    /// Exchange pair in lexical order, independent of direction.
    pub fn pair(&self) -> (Exchange, Exchange) {
        sorted_pair(self.exchange_long, self.exchange_short)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExclusionReason {
    /// Listed on fewer than two exchanges.
    SingleExchange,
    /// Listed on enough exchanges but fewer than two fresh rates.
    StaleRates,
    /// Best pair does not beat fees and slippage.
    Unprofitable,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    /// Descending by expected profit, ties by symbol.
    pub opportunities: Vec<Opportunity>,
    pub exclusions: BTreeMap<ExclusionReason, usize>,
    pub evaluated_at_ms: i64,
}

impl Ranking {
    pub fn top_for(&self, symbol: &CanonicalSymbol) -> Option<&Opportunity> {
        self.opportunities.iter().find(|o| &o.symbol == symbol)
    }

    pub fn excluded(&self) -> usize {
        self.exclusions.values().sum()
    }

    pub fn excluded_for(&self, reason: ExclusionReason) -> usize {
        self.exclusions.get(&reason).copied().unwrap_or_default()
    }
}

/// A fresh, fee-known rate taking part in pairing.
struct Candidate<'a> {
    exchange: Exchange,
    rate: &'a FundingRate,
    fee: Decimal,
}

/// One evaluated pair before the profitability filter.
struct Pair<'a> {
    long: &'a Candidate<'a>,
    short: &'a Candidate<'a>,
    spread: Decimal,
}

impl Pair<'_> {
    fn fee_sum(&self) -> Decimal {
        self.long.fee + self.short.fee
    }

    fn key(&self) -> (Exchange, Exchange) {
        sorted_pair(self.long.exchange, self.short.exchange)
    }

    /// Larger spread first, then cheaper fees, then lexical pair.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .spread
            .cmp(&self.spread)
            .then_with(|| self.fee_sum().cmp(&other.fee_sum()))
            .then_with(|| self.key().cmp(&other.key()))
    }
}

fn sorted_pair(a: Exchange, b: Exchange) -> (Exchange, Exchange) {
    if a.as_str() <= b.as_str() {
        (a, b)
    } else {
        (b, a)
    }
}

pub struct OpportunityEngine {
    params: EvaluationParams,
}

impl OpportunityEngine {
    pub fn new(params: EvaluationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &EvaluationParams {
        &self.params
    }

    /// Rank the best pair of every eligible symbol in `snapshot`.
    ///
    /// Depends only on its arguments.
    pub fn evaluate(&self, snapshot: &MarketSnapshot, mapper: &SymbolMapper, now_ms: i64) -> Ranking {
        let mut ranking = Ranking {
            evaluated_at_ms: now_ms,
            ..Ranking::default()
        };

        for (symbol, by_exchange) in snapshot.iter() {
            let coverage = mapper.coverage(symbol);
            if coverage.len() < 2 {
                *ranking.exclusions.entry(ExclusionReason::SingleExchange).or_default() += 1;
                continue;
            }

            let candidates: Vec<Candidate<'_>> = by_exchange
                .iter()
                .filter(|(exchange, rate)| {
                    coverage.contains(*exchange) && self.params.freshness.is_fresh(rate, now_ms)
                })
                .filter_map(|(exchange, rate)| {
                    let fee = *self.params.fees.get(exchange)?;
                    Some(Candidate {
                        exchange: *exchange,
                        rate,
                        fee,
                    })
                })
                .collect();

            if candidates.len() < 2 {
                *ranking.exclusions.entry(ExclusionReason::StaleRates).or_default() += 1;
                continue;
            }

            match self.best_opportunity(symbol, &candidates, now_ms) {
                Some(opportunity) => ranking.opportunities.push(opportunity),
                None => {
                    *ranking.exclusions.entry(ExclusionReason::Unprofitable).or_default() += 1;
                }
            }
        }

        ranking.opportunities.sort_by(|a, b| {
            b.expected_profit_per_period
                .cmp(&a.expected_profit_per_period)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        ranking
    }

    fn best_opportunity(
        &self,
        symbol: &CanonicalSymbol,
        candidates: &[Candidate<'_>],
        now_ms: i64,
    ) -> Option<Opportunity> {
        let mut pairs = Vec::with_capacity(candidates.len() * (candidates.len() - 1) / 2);
        for (i, a) in candidates.iter().enumerate() {
            for b in &candidates[i + 1..] {
                let (long, short) = if a.rate.rate <= b.rate.rate { (a, b) } else { (b, a) };
                pairs.push(Pair {
                    long,
                    short,
                    spread: (a.rate.rate - b.rate.rate).abs(),
                });
            }
        }
        let best = pairs.iter().min_by(|x, y| x.rank(y))?;

        let p = &self.params;
        let cost_rate = best.fee_sum() + p.slippage;
        let expected_profit = p.notional_usd * (best.spread - cost_rate);
        if expected_profit <= Decimal::ZERO {
            return None;
        }
        let fees = p.notional_usd * cost_rate;

        Some(Opportunity {
            symbol: symbol.clone(),
            exchange_long: best.long.exchange,
            exchange_short: best.short.exchange,
            rate_long: best.long.rate.rate,
            rate_short: best.short.rate.rate,
            spread: best.spread,
            notional_usd: p.notional_usd,
            expected_profit_per_period: expected_profit,
            fees,
            break_even_periods: fees / expected_profit,
            apr: expected_profit * p.periods_per_year() / p.notional_usd,
            next_funding_time_ms: next_funding(
                best.long.rate.next_funding_time_ms,
                best.short.rate.next_funding_time_ms,
                now_ms + p.funding_interval_ms(),
            ),
        })
    }
}

/// Earliest known funding time of two legs, or `fallback` if neither is known.
fn next_funding(a: i64, b: i64, fallback: i64) -> i64 {
    match (a > 0, b > 0) {
        (true, true) => a.min(b),
        (true, false) => a,
        (false, true) => b,
        (false, false) => fallback,
    }
}
