//! Tunable defaults for every subsystem, mirroring the teacher crate's
//! `SenderConfig`/`ReceiverConfig` pattern: one struct per concern, a
//! `Default` impl carrying the literal constants named in the design.

/// Per-sender receiver tunables (§4.B).
#[derive(Debug, Clone, Copy)]
pub struct ReceiverConfig {
    /// Sliding-window packet cache capacity.
    pub cache_capacity: usize,
    /// Uniform jitter range, in ms, for repair-request (NACK) timers.
    pub repair_request_jitter_ms: (u64, u64),
    /// Uniform jitter range, in ms, for do-repair (NAK-suppression) timers.
    pub do_repair_jitter_ms: (u64, u64),
    /// How long a sender may remain `NEW` before it is marked `UNKNOWN_FAILED`.
    pub name_discovery_timeout_ms: u64,
    /// Uniform jitter range, in ms, for whois-reply delay (storm suppression).
    pub whois_reply_jitter_ms: (u64, u64),
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            cache_capacity: 256,
            repair_request_jitter_ms: (150, 250),
            do_repair_jitter_ms: (50, 100),
            name_discovery_timeout_ms: 10_000,
            whois_reply_jitter_ms: (50, 200),
        }
    }
}

/// Identifier-acquisition (join) tunables (§4.D).
#[derive(Debug, Clone, Copy)]
pub struct JoinConfig {
    pub passive_join_time_ms: u64,
    pub active_join_interval_ms: u64,
    pub nr_join_requests_to_send: u32,
    /// Give up and surface `JoinFailed` after this many consecutive
    /// collision-driven restarts, rather than retrying forever (§7).
    pub max_join_restarts: u32,
}

impl Default for JoinConfig {
    fn default() -> Self {
        JoinConfig {
            passive_join_time_ms: 500,
            active_join_interval_ms: 250,
            nr_join_requests_to_send: 3,
            max_join_restarts: 10,
        }
    }
}

/// Session-announce and keepalive tunables (§4.D).
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Uniform jitter range, in ms, for the periodic SESSION announce.
    pub announce_period_ms: (u64, u64),
    /// Idle time, in ms, before a NO_DATA keepalive is sent.
    pub keepalive_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            announce_period_ms: (1_500, 3_000),
            keepalive_timeout_ms: 180_000,
        }
    }
}

/// Graceful-shutdown tunables (§4.D).
#[derive(Debug, Clone, Copy)]
pub struct DisconnectConfig {
    pub nr_bye_to_send: u32,
    pub bye_interval_ms: u64,
}

impl Default for DisconnectConfig {
    fn default() -> Self {
        DisconnectConfig {
            nr_bye_to_send: 3,
            bye_interval_ms: 500,
        }
    }
}

/// Aggregate configuration for a [`crate::transport::CausalTransport`].
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub receiver: ReceiverConfig,
    pub join: JoinConfig,
    pub session: SessionConfig,
    pub disconnect: DisconnectConfig,
    /// Maximum datagram size accepted by the substrate; constrains the codec.
    /// Overridable for tests (the teacher's own MTU default is 1200).
    pub max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            receiver: ReceiverConfig::default(),
            join: JoinConfig::default(),
            session: SessionConfig::default(),
            disconnect: DisconnectConfig::default(),
            max_packet_size: 1200,
        }
    }
}
