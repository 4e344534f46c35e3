//! Plain-text tables for the terminal.

use arb_engine::{Opportunity, Position, Presenter, TickView};
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use std::fmt::Write;

pub const DEFAULT_ROWS: usize = 15;

/// Prints the ranking and the open positions after every tick.
pub struct TerminalPresenter {
    rows: usize,
}

impl TerminalPresenter {
    pub fn new(rows: usize) -> Self {
        Self { rows }
    }

    pub fn render(&self, view: &TickView<'_>) -> String {
        let mut out = String::new();
        let ranking = view.ranking;

        let _ = writeln!(
            out,
            "\n=== Funding arbitrage | {} | {} opportunities | {} excluded | {} positions ===",
            timestamp(view.now_ms),
            ranking.opportunities.len(),
            ranking.excluded(),
            view.positions.len(),
        );

        if ranking.opportunities.is_empty() {
            let _ = writeln!(out, "No profitable opportunities.");
        } else {
            let _ = writeln!(
                out,
                "{:<16} {:>9} {:<8} {:>9} {:<8} {:>9} {:>9} {:>9} {:>7} {:>8}  ",
                "SYMBOL", "SPREAD", "LONG", "RATE", "SHORT", "RATE", "FUNDING", "PROFIT", "BE", "APR"
            );
            for opp in ranking.opportunities.iter().take(self.rows) {
                let active = view
                    .positions
                    .iter()
                    .any(|p| p.symbol == opp.symbol && p.pair() == opp.pair());
                let _ = writeln!(out, "{}", opportunity_row(opp, view.now_ms, active));
            }
        }

        if !view.positions.is_empty() {
            let _ = writeln!(
                out,
                "\n{:<16} {:<8} {:<8} {:>10} {:<20} {:>10} {:>8} {:>10} {:>10}",
                "POSITION", "LONG", "SHORT", "NOTIONAL", "ENTERED", "HELD", "PERIODS", "FUNDING", "PNL"
            );
            for position in &view.positions {
                let _ = writeln!(out, "{}", position_row(position, view.now_ms));
            }
        }

        for closed in &view.report.closed {
            let _ = writeln!(
                out,
                "closed {} ({}): pnl {}",
                closed.position.symbol,
                closed.reason,
                closed.position.pnl().round_dp(2)
            );
        }
        out
    }
}

impl Default for TerminalPresenter {
    fn default() -> Self {
        Self::new(DEFAULT_ROWS)
    }
}

impl Presenter for TerminalPresenter {
    fn present(&mut self, view: &TickView<'_>) {
        print!("{}", self.render(view));
    }
}

fn opportunity_row(opp: &Opportunity, now_ms: i64, active: bool) -> String {
    format!(
        "{:<16} {:>8}% {:<8} {:>8}% {:<8} {:>8}% {:>9} {:>9} {:>7} {:>7}% {}",
        opp.symbol.as_str(),
        percent(opp.spread),
        opp.exchange_long.as_str(),
        percent(opp.rate_long),
        opp.exchange_short.as_str(),
        percent(opp.rate_short),
        countdown(opp.next_funding_time_ms - now_ms),
        opp.expected_profit_per_period.round_dp(2),
        opp.break_even_periods.round_dp(2),
        (opp.apr * Decimal::ONE_HUNDRED).round_dp(1),
        if active { "*" } else { "" },
    )
}

fn position_row(position: &Position, now_ms: i64) -> String {
    format!(
        "{:<16} {:<8} {:<8} {:>10} {:<20} {:>10} {:>8} {:>10} {:>10}",
        position.symbol.as_str(),
        position.exchange_long.as_str(),
        position.exchange_short.as_str(),
        position.notional_usd.round_dp(2),
        timestamp(position.entry_time_ms),
        countdown(position.duration_ms(now_ms)),
        position.funding_periods,
        position.accrued_funding.round_dp(4),
        position.pnl().round_dp(4),
    )
}

fn percent(rate: Decimal) -> Decimal {
    (rate * Decimal::ONE_HUNDRED).round_dp(4)
}

fn timestamp(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// `HH:MM:SS`; negative spans render as `00:00:00`.
fn countdown(ms: i64) -> String {
    let secs = ms.max(0) / 1_000;
    format!("{:02}:{:02}:{:02}", secs / 3_600, secs % 3_600 / 60, secs % 60)
}
