//! Build the symbol table from exchange instrument listings.

use crate::mapper::SymbolTable;
use crate::normalize::parse_loose;
use model::{CanonicalSymbol, Exchange};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

/// Include/exclude lists. Entries may use any spelling `parse_loose` accepts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SymbolFilter {
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub include_only: Vec<String>,
}

impl SymbolFilter {
    pub fn allows(&self, symbol: &CanonicalSymbol) -> bool {
        let matches = |entry: &String| match parse_loose(entry) {
            Some(parsed) => &parsed == symbol,
            None => entry.trim().eq_ignore_ascii_case(symbol.base()),
        };
        if self.exclude.iter().any(matches) {
            return false;
        }
        self.include_only.is_empty() || self.include_only.iter().any(matches)
    }
}

/// Which symbols to track.
#[derive(Debug, Clone, Default)]
pub struct UniverseRequest {
    /// `None` tracks every listed symbol.
    pub symbols: Option<Vec<CanonicalSymbol>>,
    /// Applied to every listing, including explicitly requested symbols.
    pub filter: SymbolFilter,
}

/// Outcome of reconciling listings across exchanges.
#[derive(Debug, Clone, Default)]
pub struct Universe {
    /// Every tracked listing, single-exchange ones included.
    pub table: SymbolTable,
    /// Tracked symbols listed on fewer than two exchanges.
    pub single_coverage: Vec<CanonicalSymbol>,
    /// Requested symbols no exchange lists.
    pub missing: Vec<CanonicalSymbol>,
    /// Listings whose name could not be parsed.
    pub unparsed: usize,
}

/// Reconcile native listings into one canonical table.
pub fn build_universe(
    listings: &BTreeMap<Exchange, Vec<String>>,
    request: &UniverseRequest,
) -> Universe {
    let wanted: Option<BTreeSet<&CanonicalSymbol>> =
        request.symbols.as_ref().map(|s| s.iter().collect());

    let mut universe = Universe::default();
    for (exchange, natives) in listings {
        for native in natives {
            let Some(canonical) = parse_loose(native) else {
                universe.unparsed += 1;
                tracing::debug!(exchange = %exchange, native = %native, "Unparseable listing");
                continue;
            };
            if !request.filter.allows(&canonical) {
                continue;
            }
            if let Some(wanted) = &wanted {
                if !wanted.contains(&canonical) {
                    continue;
                }
            }
            universe.table.insert(*exchange, native.clone(), canonical);
        }
    }

    universe.single_coverage = universe
        .table
        .symbols()
        .filter(|s| universe.table.coverage(s).len() < 2)
        .cloned()
        .collect();

    if let Some(wanted) = &wanted {
        universe.missing = wanted
            .iter()
            .filter(|s| universe.table.coverage(s).is_empty())
            .map(|s| (*s).clone())
            .collect();
    }

    universe
}
