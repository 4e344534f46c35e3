//! Order placement seam and the dry-run executor.

use async_trait::async_trait;
use model::{CanonicalSymbol, Exchange, LegSide};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{info, warn};

static SIMULATED_FILL_ID: AtomicU64 = AtomicU64::new(1_000_000);

/// Why a leg could not be opened or closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The exchange refused the order.
    #[error("{exchange} rejected {symbol}: {reason}")]
    Rejected {
        exchange: Exchange,
        symbol: CanonicalSymbol,
        reason: String,
    },

    /// The exchange could not be reached.
    #[error("{0} unavailable")]
    Unavailable(Exchange),

    /// No confirmation arrived in time.
    #[error("execution timed out")]
    Timeout,
}

/// Confirmation of one opened leg.
#[derive(Debug, Clone, PartialEq)]
pub struct LegFill {
    /// Executor-assigned id; simulated ids start at 1,000,000.
    pub fill_id: u64,
    pub exchange: Exchange,
    pub symbol: CanonicalSymbol,
    pub side: LegSide,
    pub notional_usd: Decimal,
    pub filled_at_ms: i64,
}

/// Confirmation of one closed leg.
#[derive(Debug, Clone, PartialEq)]
pub struct LegClose {
    pub fill_id: u64,
    pub exchange: Exchange,
    pub symbol: CanonicalSymbol,
    pub closed_at_ms: i64,
}

/// Places and closes the single-exchange legs of a position.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Open `side` of `symbol` on `exchange` for `notional_usd`.
    async fn open_leg(
        &self,
        exchange: Exchange,
        symbol: &CanonicalSymbol,
        side: LegSide,
        notional_usd: Decimal,
    ) -> Result<LegFill, ExecutionError>;

    /// Close whatever is held of `symbol` on `exchange`.
    async fn close_leg(
        &self,
        exchange: Exchange,
        symbol: &CanonicalSymbol,
    ) -> Result<LegClose, ExecutionError>;
}

/// Run `op` and, if it fails, once more. The second error is returned.
pub async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T, ExecutionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExecutionError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!(action = %what, error = %e, "execution failed, retrying once");
            op().await
        }
    }
}

/// Fills every request immediately.
#[derive(Debug, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl ExecutionClient for DryRunExecutor {
    async fn open_leg(
        &self,
        exchange: Exchange,
        symbol: &CanonicalSymbol,
        side: LegSide,
        notional_usd: Decimal,
    ) -> Result<LegFill, ExecutionError> {
        let fill = LegFill {
            fill_id: SIMULATED_FILL_ID.fetch_add(1, Ordering::Relaxed),
            exchange,
            symbol: symbol.clone(),
            side,
            notional_usd,
            filled_at_ms: common::now_ms(),
        };
        info!(
            fill_id = fill.fill_id,
            exchange = %exchange,
            symbol = %symbol,
            side = %side,
            notional = %notional_usd,
            "dry run: leg opened"
        );
        Ok(fill)
    }

    async fn close_leg(
        &self,
        exchange: Exchange,
        symbol: &CanonicalSymbol,
    ) -> Result<LegClose, ExecutionError> {
        let close = LegClose {
            fill_id: SIMULATED_FILL_ID.fetch_add(1, Ordering::Relaxed),
            exchange,
            symbol: symbol.clone(),
            closed_at_ms: common::now_ms(),
        };
        info!(
            fill_id = close.fill_id,
            exchange = %exchange,
            symbol = %symbol,
            "dry run: leg closed"
        );
        Ok(close)
    }
}
