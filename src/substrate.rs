//! # Substrate transport interface (§4.F)
//!
//! The datagram substrate itself (IP multicast, or anything else capable
//! of group delivery) is explicitly out of scope for this crate — it is
//! an external collaborator named only by the interface it must expose.
//! Modeled on the teacher workspace's `LinkSender` trait
//! (`strata-bonding::net::interface`): one required method per real
//! responsibility, with sensible no-op defaults for what most
//! implementations won't need to override.

use std::fmt;

/// Connection lifecycle of the underlying substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Abstraction for the unreliable, possibly duplicating/reordering (but
/// not corrupting) datagram substrate this crate's protocol engine sits
/// on top of.
pub trait Transport: Send {
    /// Best-effort, non-blocking datagram send. Errors are surfaced to
    /// the `CausalTransport::send` caller (§7) but never tear the group
    /// down — the packet remains cached and will be re-emitted on repair.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Maximum datagram size this substrate will carry; constrains the
    /// codec's `max_size` budget (§4.A, §6.1).
    fn max_packet_size(&self) -> usize;

    /// Current lifecycle state. Implementations that are always "just a
    /// socket" may simply report `Connected` once opened.
    fn state(&self) -> ConnectionState {
        ConnectionState::Connected
    }
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state())
            .field("max_packet_size", &self.max_packet_size())
            .finish()
    }
}

/// An in-memory loopback substrate, exposed unconditionally (not just
/// under `cfg(test)`): both the integration tests and the
/// `causalcast-harness` binary need a `Transport` impl that doesn't
/// open a real socket, since the socket itself is out of scope (§1).
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory loopback substrate: every send is appended to an
    /// outbound queue a test can drain and feed to peers, instead of a
    /// real socket. Used by integration tests and the stdio harness.
    #[derive(Default)]
    pub struct LoopbackSubstrate {
        pub outbound: VecDeque<Vec<u8>>,
        pub max_size: usize,
        pub state: ConnectionState,
    }

    impl LoopbackSubstrate {
        pub fn new(max_size: usize) -> Self {
            LoopbackSubstrate {
                outbound: VecDeque::new(),
                max_size,
                state: ConnectionState::Connected,
            }
        }
    }

    impl Transport for LoopbackSubstrate {
        fn send(
            &mut self,
            bytes: &[u8],
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.outbound.push_back(bytes.to_vec());
            Ok(())
        }

        fn max_packet_size(&self) -> usize {
            self.max_size
        }

        fn state(&self) -> ConnectionState {
            self.state
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::LoopbackSubstrate;
    use super::Transport;

    #[test]
    fn loopback_records_sends() {
        let mut sub = LoopbackSubstrate::new(1200);
        sub.send(b"hello").unwrap();
        assert_eq!(sub.outbound.pop_front().unwrap(), b"hello");
    }
}
