mod engine;

pub use engine::{EngineMetrics, EngineSnapshot};

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Seconds without a rate before a feed is considered degraded.
pub const DEGRADED_AFTER_SECS: f64 = 30.0;
/// Seconds without a rate before a feed is considered unhealthy.
pub const UNHEALTHY_AFTER_SECS: f64 = 60.0;

/// Thread-safe counters for one exchange funding feed.
#[derive(Debug)]
pub struct FeedMetrics {
    messages_received: AtomicU64,
    rates_received: AtomicU64,
    parse_errors: AtomicU64,
    unmapped_symbols: AtomicU64,
    websocket_errors: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,
    fallback_polls: AtomicU64,
    fallback_failures: AtomicU64,
    event_lag_ms: AtomicU64,

    inner: RwLock<FeedTimes>,
}

#[derive(Debug)]
struct FeedTimes {
    start_time: Instant,
    last_rate_time: Option<Instant>,
    last_error_time: Option<Instant>,
}

impl Default for FeedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            rates_received: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            unmapped_symbols: AtomicU64::new(0),
            websocket_errors: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            reconnect_successes: AtomicU64::new(0),
            fallback_polls: AtomicU64::new(0),
            fallback_failures: AtomicU64::new(0),
            event_lag_ms: AtomicU64::new(0),
            inner: RwLock::new(FeedTimes {
                start_time: Instant::now(),
                last_rate_time: None,
                last_error_time: None,
            }),
        }
    }

    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `n` rates written into market state.
    pub fn add_rates_received(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.rates_received.fetch_add(n, Ordering::Relaxed);
        self.inner.write().last_rate_time = Some(Instant::now());
    }

    pub fn inc_parse_errors(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
        self.inner.write().last_error_time = Some(Instant::now());
    }

    pub fn inc_unmapped_symbols(&self) {
        self.unmapped_symbols.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_websocket_errors(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
        self.inner.write().last_error_time = Some(Instant::now());
    }

    pub fn inc_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnect_successes(&self) {
        self.reconnect_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fallback_polls(&self) {
        self.fallback_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fallback_failures(&self) {
        self.fallback_failures.fetch_add(1, Ordering::Relaxed);
        self.inner.write().last_error_time = Some(Instant::now());
    }

    /// Record how long the latest rate took from the exchange's event
    /// timestamp to our receipt.
    pub fn record_event_lag_ms(&self, lag_ms: u64) {
        self.event_lag_ms.store(lag_ms, Ordering::Relaxed);
    }

    /// Frames read off the websocket, parsed or not.
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Rates accepted into market state.
    pub fn rates_received(&self) -> u64 {
        self.rates_received.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Rates dropped because their native symbol is not in the table.
    pub fn unmapped_symbols(&self) -> u64 {
        self.unmapped_symbols.load(Ordering::Relaxed)
    }

    pub fn websocket_errors(&self) -> u64 {
        self.websocket_errors.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn reconnect_successes(&self) -> u64 {
        self.reconnect_successes.load(Ordering::Relaxed)
    }

    /// REST polls made while the websocket was down, including failed ones.
    pub fn fallback_polls(&self) -> u64 {
        self.fallback_polls.load(Ordering::Relaxed)
    }

    pub fn fallback_failures(&self) -> u64 {
        self.fallback_failures.load(Ordering::Relaxed)
    }

    /// Lag of the most recent timestamped rate; 0 until one arrives.
    pub fn event_lag_ms(&self) -> u64 {
        self.event_lag_ms.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.inner.read().start_time.elapsed().as_secs_f64()
    }

    /// `None` until the first rate is accepted.
    pub fn secs_since_last_rate(&self) -> Option<f64> {
        self.inner
            .read()
            .last_rate_time
            .map(|t| t.elapsed().as_secs_f64())
    }

    pub fn secs_since_last_error(&self) -> Option<f64> {
        self.inner
            .read()
            .last_error_time
            .map(|t| t.elapsed().as_secs_f64())
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            messages_received: self.messages_received(),
            rates_received: self.rates_received(),
            parse_errors: self.parse_errors(),
            unmapped_symbols: self.unmapped_symbols(),
            websocket_errors: self.websocket_errors(),
            reconnect_attempts: self.reconnect_attempts(),
            reconnect_successes: self.reconnect_successes(),
            fallback_polls: self.fallback_polls(),
            fallback_failures: self.fallback_failures(),
            event_lag_ms: self.event_lag_ms(),
            uptime_secs: self.uptime_secs(),
            secs_since_last_rate: self.secs_since_last_rate(),
            secs_since_last_error: self.secs_since_last_error(),
        }
    }
}

/// A point-in-time copy of [`FeedMetrics`].
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub messages_received: u64,
    pub rates_received: u64,
    pub parse_errors: u64,
    pub unmapped_symbols: u64,
    pub websocket_errors: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub fallback_polls: u64,
    pub fallback_failures: u64,
    pub event_lag_ms: u64,
    pub uptime_secs: f64,
    pub secs_since_last_rate: Option<f64>,
    pub secs_since_last_error: Option<f64>,
}

impl FeedSnapshot {
    /// Health derived from the freshness of the last accepted rate.
    ///
    /// A feed that never delivered is judged by its uptime instead.
    pub fn health_status(&self) -> HealthStatus {
        let silent_for = self.secs_since_last_rate.unwrap_or(self.uptime_secs);
        if silent_for > UNHEALTHY_AFTER_SECS {
            HealthStatus::Unhealthy
        } else if silent_for > DEGRADED_AFTER_SECS {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(uptime_secs: f64, secs_since_last_rate: Option<f64>) -> FeedSnapshot {
        FeedSnapshot {
            messages_received: 0,
            rates_received: 0,
            parse_errors: 0,
            unmapped_symbols: 0,
            websocket_errors: 0,
            reconnect_attempts: 0,
            reconnect_successes: 0,
            fallback_polls: 0,
            fallback_failures: 0,
            event_lag_ms: 0,
            uptime_secs,
            secs_since_last_rate,
            secs_since_last_error: None,
        }
    }

    #[test]
    fn test_counters() {
        let metrics = FeedMetrics::new();
        metrics.inc_messages_received();
        metrics.inc_messages_received();
        metrics.add_rates_received(5);
        metrics.inc_parse_errors();
        metrics.inc_unmapped_symbols();
        metrics.inc_fallback_polls();
        metrics.inc_fallback_failures();
        metrics.record_event_lag_ms(250);
        metrics.record_event_lag_ms(40);

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.rates_received, 5);
        assert_eq!(snap.parse_errors, 1);
        assert_eq!(snap.unmapped_symbols, 1);
        assert_eq!(snap.fallback_polls, 1);
        assert_eq!(snap.fallback_failures, 1);
        assert_eq!(snap.event_lag_ms, 40);
        assert!(snap.secs_since_last_rate.is_some());
        assert!(snap.secs_since_last_error.is_some());
    }

    #[test]
    fn test_zero_rates_does_not_touch_timestamp() {
        let metrics = FeedMetrics::new();
        metrics.add_rates_received(0);
        assert!(metrics.secs_since_last_rate().is_none());
    }

    #[test]
    fn test_health_fresh_rate() {
        assert_eq!(snapshot(500.0, Some(1.0)).health_status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_health_startup_grace() {
        assert_eq!(snapshot(10.0, None).health_status(), HealthStatus::Healthy);
        assert_eq!(snapshot(45.0, None).health_status(), HealthStatus::Degraded);
        assert_eq!(snapshot(120.0, None).health_status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_boundaries() {
        assert_eq!(snapshot(120.0, Some(30.0)).health_status(), HealthStatus::Healthy);
        assert_eq!(snapshot(120.0, Some(60.0)).health_status(), HealthStatus::Degraded);
        assert_eq!(snapshot(120.0, Some(60.5)).health_status(), HealthStatus::Unhealthy);
    }
}
