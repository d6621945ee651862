//! Health counters shared by the sampler and the publisher.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FailureKind;

/// Point-in-time copy of the agent's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Readings obtained from the source and appended to the log
    pub samples_taken: u64,

    /// Sampling cycles that produced no entry
    pub cycles_skipped: u64,

    /// Entries acknowledged by the transport
    pub deliveries: u64,

    pub read_failures: u64,

    /// Publish attempts that failed (the retry counter)
    pub transport_failures: u64,

    pub connectivity_losses: u64,

    /// Capacity-exceeded events (each may evict several entries)
    pub capacity_exceeded_events: u64,

    /// Unacknowledged entries dropped by the retention ceiling
    pub entries_evicted: u64,
}

/// Lock-free counters updated by the agent tasks.
#[derive(Debug, Default)]
pub struct Health {
    samples_taken: AtomicU64,
    cycles_skipped: AtomicU64,
    deliveries: AtomicU64,
    read_failures: AtomicU64,
    transport_failures: AtomicU64,
    connectivity_losses: AtomicU64,
    capacity_exceeded_events: AtomicU64,
    entries_evicted: AtomicU64,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sample(&self) {
        self.samples_taken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_cycle(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, evicted: usize) {
        self.record_failure(FailureKind::LogCapacityExceeded);
        self.entries_evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
    }

    /// Count one failure of the given kind.
    pub fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::ReadFailure => &self.read_failures,
            FailureKind::TransportFailure => &self.transport_failures,
            FailureKind::ConnectivityLoss => {
                // a connectivity loss is also a failed attempt
                self.transport_failures.fetch_add(1, Ordering::Relaxed);
                &self.connectivity_losses
            }
            FailureKind::LogCapacityExceeded => &self.capacity_exceeded_events,
            FailureKind::ConfigurationError => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            samples_taken: self.samples_taken.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            connectivity_losses: self.connectivity_losses.load(Ordering::Relaxed),
            capacity_exceeded_events: self.capacity_exceeded_events.load(Ordering::Relaxed),
            entries_evicted: self.entries_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_default_is_zero() {
        assert_eq!(Health::new().snapshot(), HealthSnapshot::default());
    }

    #[test]
    fn test_health_counts_failures_by_kind() {
        let health = Health::new();
        health.record_failure(FailureKind::ReadFailure);
        health.record_failure(FailureKind::TransportFailure);
        health.record_failure(FailureKind::ConnectivityLoss);
        health.record_failure(FailureKind::ConfigurationError);

        let snap = health.snapshot();
        assert_eq!(snap.read_failures, 1);
        assert_eq!(snap.transport_failures, 2);
        assert_eq!(snap.connectivity_losses, 1);
    }

    #[test]
    fn test_health_eviction() {
        let health = Health::new();
        health.record_eviction(2);
        health.record_eviction(1);

        let snap = health.snapshot();
        assert_eq!(snap.capacity_exceeded_events, 2);
        assert_eq!(snap.entries_evicted, 3);
    }

    #[test]
    fn test_health_samples_and_deliveries() {
        let health = Health::new();
        health.record_sample();
        health.record_sample();
        health.record_skipped_cycle();
        health.record_delivery();

        let snap = health.snapshot();
        assert_eq!(snap.samples_taken, 2);
        assert_eq!(snap.cycles_skipped, 1);
        assert_eq!(snap.deliveries, 1);
    }
}
