//! Transfer counters.
//!
//! `TransferMetrics` is owned by whoever builds the transfer service and
//! handed to it as an `Arc`; there is no process-wide instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct TransferMetrics {
    transfers_total: AtomicU64,
    transfers_succeeded: AtomicU64,
    transfers_failed: AtomicU64,
    conflicts_retried: AtomicU64,
    latency_micros_total: AtomicU64,
}

impl TransferMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished transfer call, including its retries.
    pub fn record_outcome(&self, succeeded: bool, latency: Duration) {
        self.transfers_total.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.transfers_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transfers_failed.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros_total.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.conflicts_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_total: self.transfers_total.load(Ordering::Relaxed),
            transfers_succeeded: self.transfers_succeeded.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            conflicts_retried: self.conflicts_retried.load(Ordering::Relaxed),
            latency_micros_total: self.latency_micros_total.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub transfers_total: u64,
    pub transfers_succeeded: u64,
    pub transfers_failed: u64,
    pub conflicts_retried: u64,
    pub latency_micros_total: u64,
}

impl MetricsSnapshot {
    /// Percentage of transfer calls that committed, 0 when none ran.
    pub fn success_rate(&self) -> f64 {
        if self.transfers_total == 0 {
            return 0.0;
        }
        self.transfers_succeeded as f64 / self.transfers_total as f64 * 100.0
    }

    pub fn average_latency(&self) -> Duration {
        if self.transfers_total == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency_micros_total / self.transfers_total)
    }
}
