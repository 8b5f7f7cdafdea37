//! Protocol counters.
//!
//! endpoint ごとに atomics で数えて、`snapshot()` で値のコピーを返す。

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCounts {
    pub notifications_sent: u64,
    pub calls_sent: u64,
    pub replies_received: u64,
    pub handlers_invoked: u64,
    pub streams_opened: u64,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub pulls_sent: u64,
    pub cancels_sent: u64,
    pub ignored_envelopes: u64,
    pub protocol_violations: u64,
}

#[derive(Debug, Default)]
pub(crate) struct EndpointCounters {
    pub notifications_sent: AtomicU64,
    pub calls_sent: AtomicU64,
    pub replies_received: AtomicU64,
    pub handlers_invoked: AtomicU64,
    pub streams_opened: AtomicU64,
    pub chunks_sent: AtomicU64,
    pub chunks_received: AtomicU64,
    pub pulls_sent: AtomicU64,
    pub cancels_sent: AtomicU64,
    pub ignored_envelopes: AtomicU64,
    pub protocol_violations: AtomicU64,
}

impl EndpointCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EndpointCounts {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EndpointCounts {
            notifications_sent: load(&self.notifications_sent),
            calls_sent: load(&self.calls_sent),
            replies_received: load(&self.replies_received),
            handlers_invoked: load(&self.handlers_invoked),
            streams_opened: load(&self.streams_opened),
            chunks_sent: load(&self.chunks_sent),
            chunks_received: load(&self.chunks_received),
            pulls_sent: load(&self.pulls_sent),
            cancels_sent: load(&self.cancels_sent),
            ignored_envelopes: load(&self.ignored_envelopes),
            protocol_violations: load(&self.protocol_violations),
        }
    }
}
