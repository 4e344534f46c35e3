use model::Exchange;
use rust_decimal::Decimal;
use thiserror::Error;

/// Invalid engine parameters, detected before the first tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// An enabled exchange has no taker fee.
    #[error("no fee rate configured for {0}")]
    MissingFee(Exchange),

    /// A numeric parameter outside its allowed range.
    #[error("{name} must be {expected}, got {value}")]
    OutOfRange {
        /// Parameter name as it appears in the config.
        name: &'static str,
        /// Human-readable allowed range.
        expected: &'static str,
        value: Decimal,
    },

    /// Funding interval in hours that does not divide 24.
    #[error("funding interval must divide a day, got {0}h")]
    FundingInterval(u32),
}
