//! Lenient conversions for exchange payloads, which send numbers as strings.

use rust_decimal::Decimal;
use std::str::FromStr;

/// `None` for empty or malformed values.
pub(crate) fn decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

/// Epoch milliseconds, 0 when absent or malformed.
pub(crate) fn millis(raw: &str) -> i64 {
    raw.trim().parse().unwrap_or_default()
}
