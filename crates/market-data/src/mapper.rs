//! Native → canonical symbol resolution.

use model::{CanonicalSymbol, Exchange};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Immutable mapping built once per universe refresh.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    by_native: HashMap<(Exchange, String), CanonicalSymbol>,
    coverage: BTreeMap<CanonicalSymbol, BTreeSet<Exchange>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `native` on `exchange` as a spelling of `canonical`.
    pub fn insert(&mut self, exchange: Exchange, native: impl Into<String>, canonical: CanonicalSymbol) {
        self.coverage
            .entry(canonical.clone())
            .or_default()
            .insert(exchange);
        self.by_native.insert((exchange, native.into()), canonical);
    }

    pub fn canonicalize(&self, exchange: Exchange, native: &str) -> Option<&CanonicalSymbol> {
        self.by_native.get(&(exchange, native.to_string()))
    }

    pub fn coverage(&self, symbol: &CanonicalSymbol) -> BTreeSet<Exchange> {
        self.coverage.get(symbol).cloned().unwrap_or_default()
    }

    /// Native names registered for one exchange, sorted.
    pub fn natives(&self, exchange: Exchange) -> Vec<String> {
        let mut natives: Vec<String> = self
            .by_native
            .keys()
            .filter(|(ex, _)| *ex == exchange)
            .map(|(_, native)| native.clone())
            .collect();
        natives.sort();
        natives
    }

    pub fn symbols(&self) -> impl Iterator<Item = &CanonicalSymbol> {
        self.coverage.keys()
    }

    pub fn len(&self) -> usize {
        self.coverage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coverage.is_empty()
    }
}

/// Shared handle to the current [`SymbolTable`].
///
/// `refresh` swaps the whole table; readers hold either the old or the new one.
#[derive(Debug, Default)]
pub struct SymbolMapper {
    table: RwLock<Arc<SymbolTable>>,
}

impl SymbolMapper {
    pub fn new(table: SymbolTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    pub fn canonicalize(&self, exchange: Exchange, native: &str) -> Option<CanonicalSymbol> {
        self.table.read().canonicalize(exchange, native).cloned()
    }

    pub fn coverage(&self, symbol: &CanonicalSymbol) -> BTreeSet<Exchange> {
        self.table.read().coverage(symbol)
    }

    pub fn refresh(&self, table: SymbolTable) {
        let symbols = table.len();
        *self.table.write() = Arc::new(table);
        tracing::info!(symbols, "Symbol table refreshed");
    }

    /// The table currently installed.
    pub fn table(&self) -> Arc<SymbolTable> {
        Arc::clone(&self.table.read())
    }
}
