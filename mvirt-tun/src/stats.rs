//! Per-adapter traffic counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Interface statistics, updated lock-free from every data-plane path.
#[derive(Debug, Default)]
pub struct Statistics {
    out_octets: AtomicU64,
    out_packets: AtomicU64,
    out_errors: AtomicU64,
    out_discards: AtomicU64,
    in_octets: AtomicU64,
    in_packets: AtomicU64,
    in_errors: AtomicU64,
}

/// Point-in-time copy of [`Statistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub out_octets: u64,
    pub out_packets: u64,
    pub out_errors: u64,
    pub out_discards: u64,
    pub in_octets: u64,
    pub in_packets: u64,
    pub in_errors: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A packet was copied into a consumer read buffer
    pub fn packet_delivered(&self, len: usize) {
        self.out_octets.fetch_add(len as u64, Ordering::Relaxed);
        self.out_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// A packet could not be copied into a consumer read buffer
    pub fn delivery_failed(&self) {
        self.out_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// An outbound packet was dropped as oversized
    pub fn packet_discarded(&self) {
        self.out_discards.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one decoded write buffer
    pub fn packets_received(&self, octets: u64, ok: u64, errors: u64) {
        self.in_octets.fetch_add(octets, Ordering::Relaxed);
        self.in_packets.fetch_add(ok, Ordering::Relaxed);
        self.in_errors.fetch_add(errors, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            out_octets: self.out_octets.load(Ordering::Relaxed),
            out_packets: self.out_packets.load(Ordering::Relaxed),
            out_errors: self.out_errors.load(Ordering::Relaxed),
            out_discards: self.out_discards.load(Ordering::Relaxed),
            in_octets: self.in_octets.load(Ordering::Relaxed),
            in_packets: self.in_packets.load(Ordering::Relaxed),
            in_errors: self.in_errors.load(Ordering::Relaxed),
        }
    }
}
