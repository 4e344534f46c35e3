//! Latest funding rate per (exchange, canonical symbol).

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use model::{CanonicalSymbol, Exchange, FundingRate};
use std::collections::BTreeMap;

/// What [`MarketState::upsert`] did with an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First observation for the key.
    Inserted,
    /// Newer than the stored one, which it replaced.
    Replaced,
    /// The stored observation is as new or newer.
    Rejected,
}

/// Concurrent table written by every feed and read by the evaluation task.
///
/// Writes to one key are serialized by the shard lock; a write only lands
/// when its `observed_at_ms` is strictly newer than the stored one.
#[derive(Debug, Default)]
pub struct MarketState {
    rates: DashMap<(Exchange, CanonicalSymbol), FundingRate>,
}

impl MarketState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `rate` unless an observation at least as new is already held.
    pub fn upsert(&self, rate: FundingRate) -> UpsertOutcome {
        match self.rates.entry((rate.exchange, rate.symbol.clone())) {
            Entry::Occupied(mut entry) => {
                if rate.observed_at_ms > entry.get().observed_at_ms {
                    entry.insert(rate);
                    UpsertOutcome::Replaced
                } else {
                    UpsertOutcome::Rejected
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(rate);
                UpsertOutcome::Inserted
            }
        }
    }

    pub fn get(&self, exchange: Exchange, symbol: &CanonicalSymbol) -> Option<FundingRate> {
        self.rates
            .get(&(exchange, symbol.clone()))
            .map(|r| r.value().clone())
    }

    /// Owned copy of the table grouped by symbol.
    pub fn snapshot(&self) -> MarketSnapshot {
        let mut by_symbol: BTreeMap<CanonicalSymbol, BTreeMap<Exchange, FundingRate>> =
            BTreeMap::new();
        for entry in self.rates.iter() {
            let rate = entry.value().clone();
            by_symbol
                .entry(rate.symbol.clone())
                .or_default()
                .insert(rate.exchange, rate);
        }
        MarketSnapshot { by_symbol }
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

/// Point-in-time copy of [`MarketState`], ordered by symbol then exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketSnapshot {
    by_symbol: BTreeMap<CanonicalSymbol, BTreeMap<Exchange, FundingRate>>,
}

impl MarketSnapshot {
    pub fn from_rates(rates: impl IntoIterator<Item = FundingRate>) -> Self {
        let mut snapshot = Self::default();
        for rate in rates {
            let slot = snapshot
                .by_symbol
                .entry(rate.symbol.clone())
                .or_default();
            match slot.get(&rate.exchange) {
                Some(existing) if existing.observed_at_ms >= rate.observed_at_ms => {}
                _ => {
                    slot.insert(rate.exchange, rate);
                }
            }
        }
        snapshot
    }

    pub fn symbols(&self) -> impl Iterator<Item = &CanonicalSymbol> {
        self.by_symbol.keys()
    }

    pub fn rates_for(&self, symbol: &CanonicalSymbol) -> Option<&BTreeMap<Exchange, FundingRate>> {
        self.by_symbol.get(symbol)
    }

    pub fn get(&self, symbol: &CanonicalSymbol, exchange: Exchange) -> Option<&FundingRate> {
        self.by_symbol.get(symbol).and_then(|m| m.get(&exchange))
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&CanonicalSymbol, &BTreeMap<Exchange, FundingRate>)> {
        self.by_symbol.iter()
    }

    pub fn rate_count(&self) -> usize {
        self.by_symbol.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }
}
