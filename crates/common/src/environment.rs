//! Production or sandbox endpoints.
//!
//! All three venues run a testnet; each adapter maps this value to its own URLs.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Overrides the `environment` field of the config file.
pub const ENVIRONMENT_VAR: &str = "FUNDING_ARB_ENVIRONMENT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Testnet,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown environment '{0}' (use production or testnet)")]
pub struct ParseEnvironmentError(String);

impl Environment {
    pub fn is_testnet(self) -> bool {
        self == Self::Testnet
    }

    /// `Ok(None)` when `FUNDING_ARB_ENVIRONMENT` is unset. A value that does
    /// not parse is an error rather than a silent fall back to production.
    pub fn from_env() -> Result<Option<Self>, ParseEnvironmentError> {
        std::env::var(ENVIRONMENT_VAR)
            .ok()
            .map(|raw| raw.parse())
            .transpose()
    }
}

impl FromStr for Environment {
    type Err = ParseEnvironmentError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "production" | "prod" | "mainnet" => Ok(Self::Production),
            "testnet" | "test" | "sandbox" | "demo" => Ok(Self::Testnet),
            _ => Err(ParseEnvironmentError(raw.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Production => "production",
            Self::Testnet => "testnet",
        })
    }
}
