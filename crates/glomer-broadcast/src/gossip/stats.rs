//! Counters for propagation waves and delivery attempts.

use std::sync::atomic::{AtomicU64, Ordering};

use super::delivery::{DeliveryOutcome, Propagation};

/// Lock-free counters shared by the engine and its delivery tasks.
#[derive(Debug, Default)]
pub struct DisseminationStats {
    origin_waves: AtomicU64,
    relay_waves: AtomicU64,
    attempts: AtomicU64,
    delivered: AtomicU64,
    abandoned: AtomicU64,
    cancelled: AtomicU64,
}

impl DisseminationStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of a propagation wave.
    pub fn record_wave(&self, propagation: Propagation) {
        let counter = match propagation {
            Propagation::Origin => &self.origin_waves,
            Propagation::Relay => &self.relay_waves,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one delivery attempt against one neighbor.
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records how a delivery task ended.
    pub fn record_outcome(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Delivered { .. } => &self.delivered,
            DeliveryOutcome::Abandoned { .. } => &self.abandoned,
            DeliveryOutcome::Cancelled { .. } => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a copy of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            origin_waves: self.origin_waves.load(Ordering::Relaxed),
            relay_waves: self.relay_waves.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            stored_values: 0,
        }
    }
}

/// Statistics about engine state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Origin waves started (values first accepted from clients).
    pub origin_waves: u64,
    /// Relay waves started (values first accepted from peers).
    pub relay_waves: u64,
    /// Delivery attempts made, including retries.
    pub attempts: u64,
    /// Deliveries acknowledged (or handed off, for fire-and-forget relays).
    pub delivered: u64,
    /// Relay deliveries dropped after their single failed attempt.
    pub abandoned: u64,
    /// Deliveries stopped by shutdown.
    pub cancelled: u64,
    /// Values in the message store.
    pub stored_values: usize,
}

impl StatsSnapshot {
    /// Total waves of either policy.
    #[must_use]
    pub const fn waves(&self) -> u64 {
        self.origin_waves + self.relay_waves
    }
}
