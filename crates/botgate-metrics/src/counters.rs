use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-wide gauges shared by reference between the transport layer, the workers and the
/// router. The router only reads them.
#[derive(Debug, Default)]
pub struct ServerCounters {
    pending_queries: AtomicU64,
    pending_requests: AtomicU64,
    buffer_memory_bytes: AtomicU64,
    active_network_queries: AtomicU64,
    active_webhook_connections: AtomicU64,
}

macro_rules! gauge {
    ($field:ident, $inc:ident, $dec:ident) => {
        pub fn $inc(&self, amount: u64) {
            self.$field.fetch_add(amount, Ordering::Relaxed);
        }

        pub fn $dec(&self, amount: u64) {
            // Saturate instead of wrapping if a producer double-decrements.
            let _ = self
                .$field
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                    Some(value.saturating_sub(amount))
                });
        }
    };
}

impl ServerCounters {
    gauge!(pending_queries, add_pending_queries, sub_pending_queries);
    gauge!(pending_requests, add_pending_requests, sub_pending_requests);
    gauge!(buffer_memory_bytes, add_buffer_memory, sub_buffer_memory);
    gauge!(
        active_network_queries,
        add_active_network_queries,
        sub_active_network_queries
    );
    gauge!(
        active_webhook_connections,
        add_active_webhook_connections,
        sub_active_webhook_connections
    );

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            pending_queries: self.pending_queries.load(Ordering::Relaxed),
            pending_requests: self.pending_requests.load(Ordering::Relaxed),
            buffer_memory_bytes: self.buffer_memory_bytes.load(Ordering::Relaxed),
            active_network_queries: self.active_network_queries.load(Ordering::Relaxed),
            active_webhook_connections: self.active_webhook_connections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub pending_queries: u64,
    pub pending_requests: u64,
    pub buffer_memory_bytes: u64,
    pub active_network_queries: u64,
    pub active_webhook_connections: u64,
}
