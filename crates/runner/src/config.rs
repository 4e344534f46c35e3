//! Startup configuration.
//!
//! Read once from JSON, validated, then frozen into [`ValidatedConfig`].

use arb_engine::{EngineError, EvaluationParams, Freshness, ManagerConfig, RiskLimits};
use common::{Environment, ParseEnvironmentError};
use connector_core::FeedConfig;
use market_data::{parse_loose, SymbolFilter, UniverseRequest};
use model::{CanonicalSymbol, Exchange};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Variable naming the config file.
pub const CONFIG_PATH_VAR: &str = "FUNDING_ARB_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Environment(#[from] ParseEnvironmentError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unrecognised symbol '{0}'")]
    Symbol(String),

    #[error("{0}")]
    Invalid(&'static str),
}

/// Position limits. Every field is required.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskManagement {
    /// Cap on positions in any state.
    pub max_positions: usize,
    /// Largest fall from a position's peak mark, as a fraction of notional.
    pub max_drawdown: Decimal,
    /// Largest loss on a position's mark, as a fraction of notional.
    pub stop_loss_pct: Decimal,
    /// Smallest spread worth opening.
    pub min_spread: Decimal,
}

/// The file as written.
///
/// Exchanges, fees, sizing, cadence and risk limits must be present; a
/// missing one is a parse error. The remaining knobs have defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Exchanges to track; at least two.
    pub exchanges: Vec<Exchange>,
    #[serde(default)]
    pub environment: Environment,
    /// Symbols to track when `use_all_symbols` is false. Any spelling
    /// `parse_loose` accepts.
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_use_all_symbols")]
    pub use_all_symbols: bool,
    #[serde(default = "default_symbol_filters")]
    pub symbol_filters: SymbolFilter,
    /// Taker fee per exchange, as a fraction of notional per leg.
    pub fee_rates: BTreeMap<Exchange, Decimal>,
    /// Estimated slippage for a full round trip, as a fraction of notional.
    pub slippage: Decimal,
    pub position_size_usd: Decimal,
    pub check_interval_secs: u64,
    #[serde(default = "default_funding_interval_hours")]
    pub funding_interval_hours: u32,
    /// Age at which a streamed rate stops counting.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Age at which a polled rate stops counting.
    #[serde(default = "default_fallback_stale_after_secs")]
    pub fallback_stale_after_secs: u64,
    /// Close once the spread falls below this fraction of the entry spread.
    #[serde(default = "default_close_spread_fraction")]
    pub close_spread_fraction: Decimal,
    #[serde(default)]
    pub feed: FeedConfig,
    pub risk_management: RiskManagement,
}

fn default_use_all_symbols() -> bool {
    true
}

fn default_symbol_filters() -> SymbolFilter {
    SymbolFilter {
        exclude: vec!["BTCDOMUSDT".to_string(), "DEFIUSDT".to_string()],
        include_only: Vec::new(),
    }
}

fn default_funding_interval_hours() -> u32 {
    8
}

// OKX pushes funding every 30-90s
fn default_stale_after_secs() -> u64 {
    180
}

fn default_fallback_stale_after_secs() -> u64 {
    120
}

fn default_close_spread_fraction() -> Decimal {
    Decimal::new(5, 1)
}

/// Immutable, checked settings the rest of the process runs on.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub exchanges: Vec<Exchange>,
    pub environment: Environment,
    pub universe: UniverseRequest,
    pub evaluation: EvaluationParams,
    pub manager: ManagerConfig,
    pub feed: FeedConfig,
    pub check_interval: Duration,
}

impl AppConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Check every field. `environment` overrides the file when set.
    pub fn validate(self, environment: Option<Environment>) -> Result<ValidatedConfig, ConfigError> {
        let mut exchanges = self.exchanges;
        exchanges.sort();
        exchanges.dedup();
        if exchanges.len() < 2 {
            return Err(ConfigError::Invalid("at least two exchanges must be enabled"));
        }

        let symbols = if self.use_all_symbols {
            None
        } else {
            if self.symbols.is_empty() {
                return Err(ConfigError::Invalid(
                    "symbols must be listed when use_all_symbols is false",
                ));
            }
            let parsed = self
                .symbols
                .iter()
                .map(|raw| parse_loose(raw).ok_or_else(|| ConfigError::Symbol(raw.clone())))
                .collect::<Result<Vec<CanonicalSymbol>, _>>()?;
            Some(parsed)
        };

        if self.check_interval_secs == 0 {
            return Err(ConfigError::Invalid("check_interval_secs must be positive"));
        }
        if self.stale_after_secs == 0 || self.fallback_stale_after_secs == 0 {
            return Err(ConfigError::Invalid("staleness thresholds must be positive"));
        }

        let freshness = Freshness {
            stale_after_ms: secs_to_ms(self.stale_after_secs),
            fallback_stale_after_ms: secs_to_ms(self.fallback_stale_after_secs),
        };
        let evaluation = EvaluationParams {
            fees: self
                .fee_rates
                .into_iter()
                .filter(|(exchange, _)| exchanges.contains(exchange))
                .collect(),
            slippage: self.slippage,
            notional_usd: self.position_size_usd,
            freshness,
            funding_interval_hours: self.funding_interval_hours,
        };
        evaluation.validate(&exchanges)?;

        let risk = self.risk_management;
        let manager = ManagerConfig {
            limits: RiskLimits {
                max_positions: risk.max_positions,
                max_drawdown: risk.max_drawdown,
                stop_loss_pct: risk.stop_loss_pct,
                min_spread: risk.min_spread,
            },
            close_spread_fraction: self.close_spread_fraction,
            freshness,
            funding_interval_ms: evaluation.funding_interval_ms(),
        };
        manager.validate()?;

        if self.feed.max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid("feed.max_reconnect_attempts must be positive"));
        }
        if self.feed.poll_interval.is_zero() || self.feed.fallback_retry_interval.is_zero() {
            return Err(ConfigError::Invalid("feed intervals must be positive"));
        }
        if !(0.0..=1.0).contains(&self.feed.backoff.jitter_factor) {
            return Err(ConfigError::Invalid("feed.backoff.jitter_factor must be in [0, 1]"));
        }
        if self.feed.backoff.base.is_zero() || self.feed.backoff.cap < self.feed.backoff.base {
            return Err(ConfigError::Invalid("feed.backoff needs 0 < base <= cap"));
        }

        Ok(ValidatedConfig {
            exchanges,
            environment: environment.unwrap_or(self.environment),
            universe: UniverseRequest {
                symbols,
                filter: self.symbol_filters,
            },
            evaluation,
            manager,
            feed: self.feed,
            check_interval: Duration::from_secs(self.check_interval_secs),
        })
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

/// Load and validate the file named by `FUNDING_ARB_CONFIG`.
pub fn load() -> Result<ValidatedConfig, ConfigError> {
    let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::from_file(Path::new(&path))?;
    config.validate(Environment::from_env()?)
}
