use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the protocol engine. They are updated with relaxed atomics and are
///  meant for monitoring, not for synchronization.
#[derive(Default, Debug)]
pub struct GatewayStats {
    datagrams_delivered: AtomicU64,
    datagrams_dropped: AtomicU64,
    malformed_messages: AtomicU64,
    reports_sent: AtomicU64,
    handshake_restarts: AtomicU64,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStatsSnapshot {
    /// decapsulated datagrams accepted by the sink
    pub datagrams_delivered: u64,
    /// decapsulated datagrams the sink could not accept
    pub datagrams_dropped: u64,
    /// inbound datagrams that failed to parse as AMT messages or encapsulated packets
    pub malformed_messages: u64,
    pub reports_sent: u64,
    pub handshake_restarts: u64,
}

impl GatewayStats {
    pub fn on_datagram_delivered(&self) {
        self.datagrams_delivered.fetch_add(1, Ordering::Relaxed);
    }
    pub fn on_datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn on_malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }
    pub fn on_report_sent(&self) {
        self.reports_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn on_handshake_restart(&self) {
        self.handshake_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            datagrams_delivered: self.datagrams_delivered.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            reports_sent: self.reports_sent.load(Ordering::Relaxed),
            handshake_restarts: self.handshake_restarts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = GatewayStats::default();
        stats.on_datagram_delivered();
        stats.on_datagram_delivered();
        stats.on_malformed_message();
        stats.on_report_sent();

        assert_eq!(stats.snapshot(), GatewayStatsSnapshot {
            datagrams_delivered: 2,
            malformed_messages: 1,
            reports_sent: 1,
            ..Default::default()
        });
    }
}
