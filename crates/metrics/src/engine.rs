use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the evaluation loop and position lifecycle.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    ticks: AtomicU64,
    opportunities_found: AtomicU64,
    symbols_excluded: AtomicU64,
    positions_opened: AtomicU64,
    positions_closed: AtomicU64,
    execution_failures: AtomicU64,
    funding_events: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed evaluation tick.
    pub fn record_tick(&self, opportunities: usize, excluded: usize) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.opportunities_found
            .fetch_add(opportunities as u64, Ordering::Relaxed);
        self.symbols_excluded
            .fetch_add(excluded as u64, Ordering::Relaxed);
    }

    pub fn inc_positions_opened(&self) {
        self.positions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_positions_closed(&self) {
        self.positions_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// One per leg call that still failed after its retry.
    pub fn inc_execution_failures(&self) {
        self.execution_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Funding timestamps credited across all positions.
    pub fn add_funding_events(&self, n: u64) {
        self.funding_events.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            opportunities_found: self.opportunities_found.load(Ordering::Relaxed),
            symbols_excluded: self.symbols_excluded.load(Ordering::Relaxed),
            positions_opened: self.positions_opened.load(Ordering::Relaxed),
            positions_closed: self.positions_closed.load(Ordering::Relaxed),
            execution_failures: self.execution_failures.load(Ordering::Relaxed),
            funding_events: self.funding_events.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub ticks: u64,
    pub opportunities_found: u64,
    pub symbols_excluded: u64,
    pub positions_opened: u64,
    pub positions_closed: u64,
    pub execution_failures: u64,
    pub funding_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_tick_accumulates() {
        let metrics = EngineMetrics::new();
        metrics.record_tick(3, 1);
        metrics.record_tick(2, 0);
        metrics.inc_positions_opened();
        metrics.add_funding_events(2);

        let snap = metrics.snapshot();
        assert_eq!(snap.ticks, 2);
        assert_eq!(snap.opportunities_found, 5);
        assert_eq!(snap.symbols_excluded, 1);
        assert_eq!(snap.positions_opened, 1);
        assert_eq!(snap.funding_events, 2);
    }
}
