use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// Counters for one throttled listener.
#[derive(Debug, Default)]
pub struct AcceptStats {
    pub accepted: AtomicU64,
    pub canceled: AtomicU64,
    pub listener_errors: AtomicU64,

    // Gauge of the most recent permit wait
    pub last_permit_wait_us: AtomicU64,
}

impl AcceptStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self, waited: Duration) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.update_permit_wait(waited);
    }

    pub fn record_canceled(&self, waited: Duration) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
        self.update_permit_wait(waited);
    }

    pub fn record_listener_error(&self) {
        self.listener_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn update_permit_wait(&self, waited: Duration) {
        let us = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        self.last_permit_wait_us.store(us, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn canceled(&self) -> u64 {
        self.canceled.load(Ordering::Relaxed)
    }

    pub fn listener_errors(&self) -> u64 {
        self.listener_errors.load(Ordering::Relaxed)
    }

    pub fn log_stats(&self) {
        let accepted = self.accepted();
        let canceled = self.canceled();
        let failed = self.listener_errors();
        let wait_us = self.last_permit_wait_us.load(Ordering::Relaxed);

        info!(
            "STATS: Accepted: {} | Canceled waits: {} | Listener errors: {} | Last permit wait: {}us",
            accepted, canceled, failed, wait_us
        );
    }
}
