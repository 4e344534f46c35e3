use common::BackoffPolicy;
use serde::Deserialize;
use std::time::Duration;

/// Timing parameters shared by every feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub backoff: BackoffPolicy,
    /// Consecutive failed connects before switching to REST polling.
    pub max_reconnect_attempts: u32,
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// How often a polling feed tries the websocket again.
    #[serde(with = "secs")]
    pub fallback_retry_interval: Duration,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    #[serde(with = "secs")]
    pub poll_timeout: Duration,
    /// A session that lasted this long resets the backoff sequence.
    #[serde(with = "secs")]
    pub stable_after: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_reconnect_attempts: 5,
            poll_interval: Duration::from_secs(30),
            fallback_retry_interval: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(10),
            stable_after: Duration::from_secs(30),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        f64::deserialize(deserializer).and_then(|s| {
            Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: FeedConfig =
            serde_json::from_str(r#"{"max_reconnect_attempts": 3, "poll_interval": 1.5}"#).unwrap();

        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(1_500));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.backoff, BackoffPolicy::default());
    }

    #[test]
    fn test_negative_seconds_rejected() {
        let result: Result<FeedConfig, _> = serde_json::from_str(r#"{"poll_timeout": -1}"#);
        assert!(result.is_err());
    }
}
