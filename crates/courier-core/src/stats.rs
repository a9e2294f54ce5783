use chrono::{DateTime, Utc};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Traffic counters for one endpoint.  Increments are atomic; `reset` zeroes
/// the counters and restarts the clock.
#[derive(Debug)]
pub struct Statistics {
    started_at: RwLock<DateTime<Utc>>,
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
    received_messages: AtomicU64,
    received_bytes: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub started_at: DateTime<Utc>,
    pub sent_messages: u64,
    pub sent_bytes: u64,
    pub received_messages: u64,
    pub received_bytes: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Statistics {
            started_at: RwLock::new(Utc::now()),
            sent_messages: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            received_messages: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_sent(&self, bytes: u64) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: u64) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let started_at = *self.started_at.read().unwrap_or_else(|e| e.into_inner());
        StatisticsSnapshot {
            started_at,
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_messages: self.received_messages.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
        }
    }

    /// Time since construction or the last `reset`.
    pub fn uptime(&self) -> chrono::TimeDelta {
        let started_at = *self.started_at.read().unwrap_or_else(|e| e.into_inner());
        Utc::now() - started_at
    }

    pub fn reset(&self) {
        *self.started_at.write().unwrap_or_else(|e| e.into_inner()) = Utc::now();
        self.sent_messages.store(0, Ordering::Relaxed);
        self.sent_bytes.store(0, Ordering::Relaxed);
        self.received_messages.store(0, Ordering::Relaxed);
        self.received_bytes.store(0, Ordering::Relaxed);
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Statistics::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_message() {
        let stats = Statistics::new();
        stats.record_sent(100);
        stats.record_sent(50);
        stats.record_received(7);

        let snap = stats.snapshot();
        assert_eq!(snap.sent_messages, 2);
        assert_eq!(snap.sent_bytes, 150);
        assert_eq!(snap.received_messages, 1);
        assert_eq!(snap.received_bytes, 7);
    }

    #[test]
    fn reset_zeroes_counters_and_restarts_the_clock() {
        let stats = Statistics::new();
        stats.record_sent(100);
        let before = stats.snapshot().started_at;

        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.sent_messages, 0);
        assert_eq!(snap.sent_bytes, 0);
        assert!(snap.started_at >= before);
        assert!(stats.uptime() >= chrono::TimeDelta::zero());
    }
}
