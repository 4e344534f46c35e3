//! Shared funding-rate table and cross-exchange symbol reconciliation.

mod mapper;
mod normalize;
mod state;
mod universe;

pub use mapper::{SymbolMapper, SymbolTable};
pub use normalize::{native_symbol, parse_loose};
pub use state::{MarketSnapshot, MarketState, UpsertOutcome};
pub use universe::{build_universe, SymbolFilter, Universe, UniverseRequest};
