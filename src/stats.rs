use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for an endpoint's RPC traffic
#[derive(Default)]
pub struct RpcStats {
    requests: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    invalid: AtomicU64,
    unexpected: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcStatsSnapshot {
    pub requests: u64,
    /// retransmissions, whether by the timer or after a reconnect
    pub retries: u64,
    /// requests that ran into their retry ceiling
    pub timeouts: u64,
    /// received messages that could not be decoded or were not replies
    pub invalid: u64,
    /// replies that matched no live request
    pub unexpected: u64,
    pub reconnects: u64,
}

impl RpcStats {
    pub fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unexpected(&self) {
        self.unexpected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RpcStatsSnapshot {
        RpcStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            unexpected: self.unexpected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
