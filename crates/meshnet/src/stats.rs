//! Per-node drop and delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct NodeStats {
    delivered: AtomicU64,
    forwarded: AtomicU64,
    unreachable: AtomicU64,
    unknown_node: AtomicU64,
    hop_limit_exceeded: AtomicU64,
    malformed: AtomicU64,
    queue_full: AtomicU64,
}

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub forwarded: u64,
    pub unreachable: u64,
    pub unknown_node: u64,
    pub hop_limit_exceeded: u64,
    pub malformed: u64,
    pub queue_full: u64,
}

impl NodeStats {
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unreachable(&self) {
        self.unreachable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unknown_node(&self) {
        self.unknown_node.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hop_limit(&self) {
        self.hop_limit_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
            unknown_node: self.unknown_node.load(Ordering::Relaxed),
            hop_limit_exceeded: self.hop_limit_exceeded.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
        }
    }
}
