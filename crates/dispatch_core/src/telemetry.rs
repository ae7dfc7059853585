//! Dispatch counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters shared by every matching task.
#[derive(Debug, Default)]
pub struct DispatchTelemetry {
    pub trips_requested: AtomicU64,
    pub trips_assigned: AtomicU64,
    pub trips_no_match: AtomicU64,
    pub trips_cancelled: AtomicU64,
    pub trips_completed: AtomicU64,
    pub trips_expired: AtomicU64,
    pub offers_sent: AtomicU64,
    pub offers_expired: AtomicU64,
    pub lease_contentions: AtomicU64,
    pub transport_failures: AtomicU64,
    pub storage_failures: AtomicU64,
    /// Sum of request → assignment latency over all assigned trips.
    pub match_latency_ms_total: AtomicU64,
}

/// Point-in-time copy of [`DispatchTelemetry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub trips_requested: u64,
    pub trips_assigned: u64,
    pub trips_no_match: u64,
    pub trips_cancelled: u64,
    pub trips_completed: u64,
    pub trips_expired: u64,
    pub offers_sent: u64,
    pub offers_expired: u64,
    pub lease_contentions: u64,
    pub transport_failures: u64,
    pub storage_failures: u64,
    pub match_latency_ms_total: u64,
}

impl TelemetrySnapshot {
    /// Share of requested trips that ended with a driver, 0 when nothing was requested.
    pub fn match_rate(&self) -> f64 {
        if self.trips_requested == 0 {
            return 0.0;
        }
        self.trips_assigned as f64 / self.trips_requested as f64
    }

    pub fn mean_match_latency_ms(&self) -> Option<u64> {
        (self.trips_assigned > 0).then(|| self.match_latency_ms_total / self.trips_assigned)
    }
}

impl DispatchTelemetry {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TelemetrySnapshot {
            trips_requested: load(&self.trips_requested),
            trips_assigned: load(&self.trips_assigned),
            trips_no_match: load(&self.trips_no_match),
            trips_cancelled: load(&self.trips_cancelled),
            trips_completed: load(&self.trips_completed),
            trips_expired: load(&self.trips_expired),
            offers_sent: load(&self.offers_sent),
            offers_expired: load(&self.offers_expired),
            lease_contentions: load(&self.lease_contentions),
            transport_failures: load(&self.transport_failures),
            storage_failures: load(&self.storage_failures),
            match_latency_ms_total: load(&self.match_latency_ms_total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let telemetry = DispatchTelemetry::default();
        DispatchTelemetry::incr(&telemetry.trips_requested);
        DispatchTelemetry::incr(&telemetry.trips_requested);
        DispatchTelemetry::incr(&telemetry.trips_assigned);
        DispatchTelemetry::add(&telemetry.match_latency_ms_total, 1_500);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.trips_requested, 2);
        assert_eq!(snapshot.match_rate(), 0.5);
        assert_eq!(snapshot.mean_match_latency_ms(), Some(1_500));
        assert_eq!(TelemetrySnapshot::default().mean_match_latency_ms(), None);
    }
}
