//! Native symbol spellings per exchange.

use model::{CanonicalSymbol, Exchange};

/// Quote assets recognised when a native symbol has no separator.
const QUOTES: [&str; 2] = ["USDT", "USDC"];

/// Parse any common spelling of a perpetual symbol.
///
/// Accepts `BTCUSDT`, `BTC-USDT`, `BTC-USDT-SWAP`, `BTC-USDT-PERP` and
/// `BTC/USDT:USDT`.
pub fn parse_loose(raw: &str) -> Option<CanonicalSymbol> {
    let upper = raw.trim().to_uppercase();
    let head = upper.split(':').next().unwrap_or_default();
    let parts: Vec<&str> = head.split(['-', '/', '_']).collect();

    match parts.as_slice() {
        [joined] => split_joined(joined),
        [base, quote] => CanonicalSymbol::new(base, quote).ok(),
        [base, quote, "SWAP" | "PERP"] => CanonicalSymbol::new(base, quote).ok(),
        _ => None,
    }
}

fn split_joined(joined: &str) -> Option<CanonicalSymbol> {
    QUOTES.iter().find_map(|quote| {
        joined
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .and_then(|base| CanonicalSymbol::new(base, quote).ok())
    })
}

/// The instrument name an exchange uses for `symbol`.
pub fn native_symbol(exchange: Exchange, symbol: &CanonicalSymbol) -> String {
    match exchange {
        Exchange::Binance | Exchange::Bybit => format!("{}{}", symbol.base(), symbol.quote()),
        Exchange::Okx => format!("{}-{}-SWAP", symbol.base(), symbol.quote()),
    }
}
