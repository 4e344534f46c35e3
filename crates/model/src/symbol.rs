//! Canonical cross-exchange symbol identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const PERP_SUFFIX: &str = "PERP";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("invalid canonical symbol '{0}', expected BASE-QUOTE-PERP")]
    Malformed(String),

    #[error("unknown exchange '{0}'")]
    UnknownExchange(String),
}

/// Cross-exchange identity of a perpetual contract, e.g. `BTC-USDT-PERP`.
///
/// Always upper case; base and quote are non-empty alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalSymbol(String);

impl CanonicalSymbol {
    pub fn new(base: &str, quote: &str) -> Result<Self, SymbolError> {
        let base = base.trim().to_uppercase();
        let quote = quote.trim().to_uppercase();
        let valid = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid(&base) || !valid(&quote) {
            return Err(SymbolError::Malformed(format!("{}-{}", base, quote)));
        }
        Ok(Self(format!("{}-{}-{}", base, quote, PERP_SUFFIX)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn base(&self) -> &str {
        self.0.split('-').next().unwrap_or_default()
    }

    pub fn quote(&self) -> &str {
        self.0.split('-').nth(1).unwrap_or_default()
    }
}

impl FromStr for CanonicalSymbol {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('-').collect();
        match parts.as_slice() {
            [base, quote, suffix] if suffix.eq_ignore_ascii_case(PERP_SUFFIX) => {
                Self::new(base, quote)
            }
            _ => Err(SymbolError::Malformed(s.to_string())),
        }
    }
}

impl TryFrom<String> for CanonicalSymbol {
    type Error = SymbolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CanonicalSymbol> for String {
    fn from(symbol: CanonicalSymbol) -> Self {
        symbol.0
    }
}

impl fmt::Display for CanonicalSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes_case() {
        let sym = CanonicalSymbol::new("btc", "usdt").unwrap();
        assert_eq!(sym.as_str(), "BTC-USDT-PERP");
        assert_eq!(sym.base(), "BTC");
        assert_eq!(sym.quote(), "USDT");
    }

    #[test]
    fn test_parse_requires_perp_suffix() {
        assert_eq!(
            "eth-usdt-perp".parse::<CanonicalSymbol>().unwrap().as_str(),
            "ETH-USDT-PERP"
        );
        assert!("ETH-USDT".parse::<CanonicalSymbol>().is_err());
        assert!("ETHUSDT".parse::<CanonicalSymbol>().is_err());
        assert!("ETH-USDT-SWAP".parse::<CanonicalSymbol>().is_err());
    }

    #[test]
    fn test_rejects_non_alphanumeric() {
        assert!(CanonicalSymbol::new("BTC/", "USDT").is_err());
        assert!(CanonicalSymbol::new("", "USDT").is_err());
    }

    #[test]
    fn test_ordering_is_lexical() {
        let a = CanonicalSymbol::new("ADA", "USDT").unwrap();
        let b = CanonicalSymbol::new("BTC", "USDT").unwrap();
        assert!(a < b);
    }
}
