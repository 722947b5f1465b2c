// Traffic counters, for observability only.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::Core::Transport::Link;

/// Live counters. Padded so progress threads and app threads bumping
/// different counters do not share cache lines.
#[derive(Default)]
pub struct ShuffleStats {
    local_sends: CachePadded<AtomicU64>,
    local_recvs: CachePadded<AtomicU64>,
    remote_sends: CachePadded<AtomicU64>,
    remote_recvs: CachePadded<AtomicU64>,
    enqueued: CachePadded<AtomicU64>,
    relayed: CachePadded<AtomicU64>,
    delivered: CachePadded<AtomicU64>,
}

/// RPC counts on one kind of link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    /// RPCs sent.
    pub sends: u64,
    /// RPCs received.
    pub recvs: u64,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub local: TrafficCounters,
    pub remote: TrafficCounters,
    /// Messages accepted from the application (broadcast branches count once each).
    pub enqueued: u64,
    /// Messages forwarded on behalf of another process.
    pub relayed: u64,
    /// Messages handed to the delivery callback.
    pub delivered: u64,
}

impl StatsSnapshot {
    /// Counter growth since an earlier snapshot.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            local: TrafficCounters {
                sends: self.local.sends.saturating_sub(earlier.local.sends),
                recvs: self.local.recvs.saturating_sub(earlier.local.recvs),
            },
            remote: TrafficCounters {
                sends: self.remote.sends.saturating_sub(earlier.remote.sends),
                recvs: self.remote.recvs.saturating_sub(earlier.remote.recvs),
            },
            enqueued: self.enqueued.saturating_sub(earlier.enqueued),
            relayed: self.relayed.saturating_sub(earlier.relayed),
            delivered: self.delivered.saturating_sub(earlier.delivered),
        }
    }
}

impl ShuffleStats {
    pub(crate) fn record_send(&self, link: Link) {
        match link {
            Link::Local => self.local_sends.fetch_add(1, Ordering::Relaxed),
            Link::Network => self.remote_sends.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_recv(&self, link: Link) {
        match link {
            Link::Local => self.local_recvs.fetch_add(1, Ordering::Relaxed),
            Link::Network => self.remote_recvs.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relayed(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            local: TrafficCounters {
                sends: self.local_sends.load(Ordering::Relaxed),
                recvs: self.local_recvs.load(Ordering::Relaxed),
            },
            remote: TrafficCounters {
                sends: self.remote_sends.load(Ordering::Relaxed),
                recvs: self.remote_recvs.load(Ordering::Relaxed),
            },
            enqueued: self.enqueued.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}
