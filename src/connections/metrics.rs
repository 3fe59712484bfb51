//! Per-connection counters.
//!
//! Shared between the supervisor actor and the client worker; a closed
//! connection answers metric queries with an all-zero snapshot without
//! ever starting a live session.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    consumed: AtomicU64,
    mapped_inbound: AtomicU64,
    dropped_inbound: AtomicU64,
    enforcement_failures: AtomicU64,
    mapping_failures: AtomicU64,
    published: AtomicU64,
    dropped_outbound: AtomicU64,
    failed_publishes: AtomicU64,
    acknowledgements: AtomicU64,
}

/// Point-in-time copy for `RetrieveConnectionMetrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetricsSnapshot {
    pub consumed: u64,
    pub mapped_inbound: u64,
    pub dropped_inbound: u64,
    pub enforcement_failures: u64,
    pub mapping_failures: u64,
    pub published: u64,
    pub dropped_outbound: u64,
    pub failed_publishes: u64,
    pub acknowledgements: u64,
}

impl ConnectionMetricsSnapshot {
    pub fn is_zero(&self) -> bool {
        self == &Self::default()
    }
}

impl ConnectionMetrics {
    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mapped_inbound(&self) {
        self.mapped_inbound.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_inbound(&self) {
        self.dropped_inbound.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enforcement_failure(&self) {
        self.enforcement_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mapping_failure(&self) {
        self.mapping_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_outbound(&self) {
        self.dropped_outbound.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_publish(&self) {
        self.failed_publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledgement(&self) {
        self.acknowledgements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        ConnectionMetricsSnapshot {
            consumed: self.consumed.load(Ordering::Relaxed),
            mapped_inbound: self.mapped_inbound.load(Ordering::Relaxed),
            dropped_inbound: self.dropped_inbound.load(Ordering::Relaxed),
            enforcement_failures: self.enforcement_failures.load(Ordering::Relaxed),
            mapping_failures: self.mapping_failures.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            dropped_outbound: self.dropped_outbound.load(Ordering::Relaxed),
            failed_publishes: self.failed_publishes.load(Ordering::Relaxed),
            acknowledgements: self.acknowledgements.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.consumed.store(0, Ordering::Relaxed);
        self.mapped_inbound.store(0, Ordering::Relaxed);
        self.dropped_inbound.store(0, Ordering::Relaxed);
        self.enforcement_failures.store(0, Ordering::Relaxed);
        self.mapping_failures.store(0, Ordering::Relaxed);
        self.published.store(0, Ordering::Relaxed);
        self.dropped_outbound.store(0, Ordering::Relaxed);
        self.failed_publishes.store(0, Ordering::Relaxed);
        self.acknowledgements.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = ConnectionMetrics::default();
        assert!(metrics.snapshot().is_zero());

        metrics.record_consumed();
        metrics.record_published();
        metrics.record_published();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.consumed, 1);
        assert_eq!(snapshot.published, 2);
        assert!(!snapshot.is_zero());

        metrics.reset();
        assert!(metrics.snapshot().is_zero());
    }
}
