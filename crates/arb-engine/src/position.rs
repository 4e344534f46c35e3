use model::{CanonicalSymbol, Exchange};
use rust_decimal::Decimal;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    /// Legs are being placed.
    PendingOpen,
    Open,
    /// Legs are being closed.
    PendingClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Current spread fell below the configured fraction of the entry spread.
    SpreadDecayed,
    StopLoss,
    DrawdownBreach,
    /// Same symbol pays more on another exchange pair.
    BetterPair,
    /// The process is stopping.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::SpreadDecayed => "spread decayed",
            CloseReason::StopLoss => "stop loss",
            CloseReason::DrawdownBreach => "drawdown breach",
            CloseReason::BetterPair => "better pair",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Current funding rates of a position's two legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegRates {
    pub long: Decimal,
    pub short: Decimal,
}

impl LegRates {
    /// Funding earned per period per unit notional.
    pub fn spread(&self) -> Decimal {
        self.short - self.long
    }
}

/// A long/short pair on one symbol across two exchanges.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: CanonicalSymbol,
    /// Exchange holding the long leg; the lower-rate side at entry.
    pub exchange_long: Exchange,
    pub exchange_short: Exchange,
    /// Size of each leg in USD.
    pub notional_usd: Decimal,
    pub entry_time_ms: i64,
    /// Spread when opened; the decay threshold is a fraction of it.
    pub entry_spread: Decimal,
    pub status: PositionStatus,
    /// Fees and slippage paid to open and close both legs.
    pub entry_costs: Decimal,
    /// Funding credited so far, in USD.
    pub accrued_funding: Decimal,
    /// Funding timestamps credited.
    pub funding_periods: u32,
    /// Highest mark seen while open.
    pub peak_pnl: Decimal,
    /// 0 until known.
    pub next_funding_time_ms: i64,
    /// Set once the long leg's close is confirmed.
    pub long_closed: bool,
    /// Set once the short leg's close is confirmed.
    pub short_closed: bool,
    /// Set by the first close attempt; a failed close is retried with it.
    pub close_reason: Option<CloseReason>,
}

impl Position {
    /// Realized result so far: funding collected minus costs.
    pub fn pnl(&self) -> Decimal {
        self.accrued_funding - self.entry_costs
    }

    /// Realized result plus the funding the next period would pay at `rates`.
    pub fn mark(&self, rates: Option<&LegRates>) -> Decimal {
        let carry = rates
            .map(|r| self.notional_usd * r.spread())
            .unwrap_or_default();
        self.pnl() + carry
    }

    pub fn pair(&self) -> (Exchange, Exchange) {
        if self.exchange_long.as_str() <= self.exchange_short.as_str() {
            (self.exchange_long, self.exchange_short)
        } else {
            (self.exchange_short, self.exchange_long)
        }
    }

    pub fn duration_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.entry_time_ms).max(0)
    }
}
