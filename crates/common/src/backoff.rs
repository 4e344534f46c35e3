use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Reconnect delay parameters for a feed.
///
/// Delays double from `base` on every consecutive failure until they reach
/// `cap`; a random jitter of `±jitter_factor` of the delay is then applied.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BackoffPolicy {
    #[serde(with = "millis")]
    pub base: Duration,
    #[serde(with = "millis")]
    pub cap: Duration,
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Start a fresh backoff sequence with this policy.
    pub fn start(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base, self.cap, self.jitter_factor)
    }
}

/// Exponential backoff with jitter.
///
/// Formula: min(cap, base * 2^attempt) +/- jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Negative jitter is clamped to zero.
    pub fn new(base: Duration, cap: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            cap,
            jitter_factor: jitter_factor.max(0.0),
            attempt: 0,
        }
    }

    /// Delay before the next attempt, without jitter and without advancing.
    pub fn peek(&self) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap)
    }

    /// Calculate the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek();

        let jitter_range = delay.as_secs_f64() * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        self.attempt = self.attempt.saturating_add(1);

        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
