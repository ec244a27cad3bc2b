//! # Statistics
//!
//! Serializable counter snapshots, queried by tests and callers — not a
//! live metrics surface (the spec's Non-goals exclude network coding and
//! flow control, but ambient observability is still carried per the
//! teacher's convention of `#[derive(Serialize)]` stats structs).

use serde::Serialize;

/// Per-sender receiver counters (§4.B).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Reliable packets accepted into the cache.
    pub packets_received: u64,
    /// Packets seen again below `first` — already released.
    pub duplicates: u64,
    /// Packets whose id fell outside the window and were dropped.
    pub out_of_range: u64,
    /// REPAIR_REQUESTs emitted for gaps detected in this sender's stream.
    pub repairs_requested: u64,
    /// REPAIR_REQUESTs satisfied by re-emitting a held packet.
    pub repairs_served: u64,
    /// Packets (or reassembled messages) released upward.
    pub delivered: u64,
    /// Distinct gaps detected (repair timers armed).
    pub gaps_detected: u64,
}

/// Aggregate transport-level counters (§4.D).
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Datagrams that failed to decode at the wire layer and were
    /// dropped before dispatch (never attributable to a sender, since
    /// decode failed before `sender_id` could be read).
    pub packets_malformed: u64,
    pub join_attempts: u64,
    pub join_restarts: u64,
    pub joins_failed: u64,
    pub senders_known: u64,
    pub senders_failed: u64,
    pub session_announces_sent: u64,
    pub keepalives_sent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiver_stats_serializes() {
        let stats = ReceiverStats {
            packets_received: 10,
            delivered: 8,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"packets_received\":10"));
        assert!(json.contains("\"delivered\":8"));
    }

    #[test]
    fn transport_stats_default_is_zero() {
        let stats = TransportStats::default();
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(stats.joins_failed, 0);
    }
}
