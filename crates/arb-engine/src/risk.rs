//! Stateless limit checks for open positions.

use crate::error::EngineError;
use crate::position::{LegRates, Position};
use rust_decimal::Decimal;

/// Limits validated once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    pub max_positions: usize,
    /// Largest fall from a position's peak mark, as a fraction of notional.
    pub max_drawdown: Decimal,
    /// Largest loss on a position's mark, as a fraction of notional.
    pub stop_loss_pct: Decimal,
    /// Smallest spread worth opening.
    pub min_spread: Decimal,
}

impl RiskLimits {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_positions == 0 {
            return Err(EngineError::OutOfRange {
                name: "max_positions",
                expected: "at least 1",
                value: Decimal::ZERO,
            });
        }
        for (name, value) in [
            ("max_drawdown", self.max_drawdown),
            ("stop_loss_pct", self.stop_loss_pct),
        ] {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(EngineError::OutOfRange {
                    name,
                    expected: "in (0, 1]",
                    value,
                });
            }
        }
        if self.min_spread.is_sign_negative() {
            return Err(EngineError::OutOfRange {
                name: "min_spread",
                expected: "non-negative",
                value: self.min_spread,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskVerdict {
    Ok,
    StopLoss,
    DrawdownBreach,
}

pub struct RiskPolicy;

impl RiskPolicy {
    /// Judge `position` at `rates`; unknown rates mark without carry.
    ///
    /// Stop-loss is checked before drawdown.
    pub fn check(position: &Position, rates: Option<&LegRates>, limits: &RiskLimits) -> RiskVerdict {
        let notional = position.notional_usd;
        if notional <= Decimal::ZERO {
            return RiskVerdict::Ok;
        }

        let mark = position.mark(rates);
        if mark / notional <= -limits.stop_loss_pct {
            return RiskVerdict::StopLoss;
        }

        let peak = position.peak_pnl.max(mark);
        if (peak - mark) / notional >= limits.max_drawdown {
            return RiskVerdict::DrawdownBreach;
        }

        RiskVerdict::Ok
    }
}
