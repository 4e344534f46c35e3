//! Funding-spread ranking and the market-neutral position lifecycle.

mod error;
mod execution;
mod manager;
mod opportunity;
mod position;
mod risk;
mod runner;

pub use error::EngineError;
pub use execution::{with_retry, DryRunExecutor, ExecutionClient, ExecutionError, LegClose, LegFill};
pub use manager::{
    ClosedPosition, ExecutionFailure, FailedAction, ManagerConfig, PositionManager, TickReport,
};
pub use opportunity::{
    EvaluationParams, ExclusionReason, Freshness, Opportunity, OpportunityEngine, Ranking,
};
pub use position::{CloseReason, LegRates, Position, PositionStatus};
pub use risk::{RiskLimits, RiskPolicy, RiskVerdict};
pub use runner::{EvaluationLoop, Presenter, TickView};
