use std::sync::atomic::{AtomicU64, Ordering};

use crate::shaper::LossStats;

/// Read-only snapshot of a running router's counters. The core does not
/// own a UI that displays this; it only guarantees the numbers are
/// accurate and cheap to read.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub sent_bytes: u64,
    pub sent_packets: u64,
    pub received_bytes: u64,
    pub received_packets: u64,
    pub outbound_queue_size: u64,
    pub inbound_queue_size: u64,
    pub total_dropped: u64,
    pub outbound_loss: LossStats,
    pub inbound_loss: LossStats,
    pub bandwidth_up_kbps: Option<u32>,
    pub bandwidth_down_kbps: Option<u32>,
    pub errors: u64,
}

/// The live, mutable counters backing a [`StatsSnapshot`]. All fields are
/// plain atomics with relaxed ordering rather than a mutex-guarded
/// struct, since every update is an independent increment.
#[derive(Default)]
pub struct Statistics {
    sent_bytes: AtomicU64,
    sent_packets: AtomicU64,
    received_bytes: AtomicU64,
    received_packets: AtomicU64,
    errors: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.received_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.received_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a [`crate::error::DtcError`] surfaced anywhere in the
    /// pipeline. Callers log the error themselves; this only tracks the
    /// count for visibility in a [`StatsSnapshot`].
    pub fn record_error(&self, _err: &crate::error::DtcError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn snapshot(
        &self,
        outbound_queue_size: usize,
        inbound_queue_size: usize,
        outbound_loss: LossStats,
        inbound_loss: LossStats,
        bandwidth_up_kbps: Option<u32>,
        bandwidth_down_kbps: Option<u32>,
    ) -> StatsSnapshot {
        StatsSnapshot {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            received_packets: self.received_packets.load(Ordering::Relaxed),
            outbound_queue_size: outbound_queue_size as u64,
            inbound_queue_size: inbound_queue_size as u64,
            total_dropped: outbound_loss.dropped + inbound_loss.dropped,
            outbound_loss,
            inbound_loss,
            bandwidth_up_kbps,
            bandwidth_down_kbps,
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_traffic() {
        let stats = Statistics::new();
        stats.record_sent(100);
        stats.record_received(50);
        let snap = stats.snapshot(1, 2, LossStats::default(), LossStats::default(), None, None);
        assert_eq!(snap.sent_bytes, 100);
        assert_eq!(snap.sent_packets, 1);
        assert_eq!(snap.received_bytes, 50);
        assert_eq!(snap.received_packets, 1);
        assert_eq!(snap.outbound_queue_size, 1);
        assert_eq!(snap.inbound_queue_size, 2);
        assert_eq!(snap.errors, 0);
    }

    #[test]
    fn record_error_increments_the_error_counter() {
        let stats = Statistics::new();
        stats.record_error(&crate::error::DtcError::BufferFull);
        stats.record_error(&crate::error::DtcError::TunIoClosed);
        let snap = stats.snapshot(0, 0, LossStats::default(), LossStats::default(), None, None);
        assert_eq!(snap.errors, 2);
    }
}
