//! # Stream multiplexer (§4.E)
//!
//! A thin layer above [`crate::transport::CausalTransport`]: the causal
//! transport already tags every `DATA` packet with a `stream_id`, so this
//! module is mostly bookkeeping — it maps the raw `(sender_id, stream_id,
//! bytes)` triples the transport delivers onto friendlier
//! `(sender_name, sender_id, stream_id, payload)` tuples for callers who
//! want logical channels instead of one flat inbox.

use crate::error::Result;
use crate::substrate::Transport;
use crate::transport::{CausalTransport, TransportEvent};
use crate::wire::SenderId;
use bytes::Bytes;

/// Default stream used when a caller doesn't care about multiplexing.
pub const DEFAULT_STREAM: u16 = 0;

/// One delivered message, resolved against whatever name we currently
/// know for its sender (`None` until WHOIS resolves it).
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub sender_id: SenderId,
    pub sender_name: Option<String>,
    pub stream_id: u16,
    pub payload: Bytes,
}

/// Wraps a [`CausalTransport`] and resolves delivered payloads against
/// the sender's discovered name, without otherwise changing the wire
/// format — `stream_id` already lives in every `DATA` packet (§4.A).
pub struct StreamMux<T: Transport> {
    inner: CausalTransport<T>,
}

impl<T: Transport> StreamMux<T> {
    pub fn new(inner: CausalTransport<T>) -> Self {
        StreamMux { inner }
    }

    pub fn inner(&self) -> &CausalTransport<T> {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut CausalTransport<T> {
        &mut self.inner
    }

    pub fn connect(&mut self) -> Result<()> {
        self.inner.connect()
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.inner.disconnect()
    }

    /// Send `payload` on the default stream.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.send_on(DEFAULT_STREAM, payload)
    }

    /// Send `payload` on a specific logical stream.
    pub fn send_on(&mut self, stream_id: u16, payload: &[u8]) -> Result<()> {
        self.inner.send(stream_id, payload)
    }

    pub fn on_datagram(&mut self, bytes: &[u8]) {
        self.inner.on_datagram(bytes)
    }

    pub fn poll_timers(&mut self) {
        self.inner.poll_timers()
    }

    /// Drain transport events, resolving `Received` deliveries into
    /// [`StreamMessage`]s and passing every other event through
    /// unchanged via the returned pair's second element.
    pub fn drain_messages(&mut self) -> (Vec<StreamMessage>, Vec<TransportEvent>) {
        let mut messages = Vec::new();
        let mut other = Vec::new();
        for event in self.inner.drain_events() {
            match event {
                TransportEvent::Received {
                    from,
                    stream_id,
                    bytes,
                } => {
                    let sender_name = self
                        .inner
                        .group_name(from)
                        .map(|s| s.to_owned());
                    messages.push(StreamMessage {
                        sender_id: from,
                        sender_name,
                        stream_id,
                        payload: bytes,
                    });
                }
                other_event => other.push(other_event),
            }
        }
        (messages, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::substrate::test_support::LoopbackSubstrate;
    use std::time::Duration;

    fn mux() -> StreamMux<LoopbackSubstrate> {
        StreamMux::new(CausalTransport::new(
            LoopbackSubstrate::new(1200),
            "carol",
            TransportConfig::default(),
        ))
    }

    /// Paired with a mocked clock so `poll_timers` can fast-forward the
    /// join protocol without sleeping.
    fn mocked_mux() -> (StreamMux<LoopbackSubstrate>, quanta::Mock) {
        let (inner, mock) = CausalTransport::new_with_mock_clock(
            LoopbackSubstrate::new(1200),
            "carol",
            TransportConfig::default(),
        );
        (StreamMux::new(inner), mock)
    }

    #[test]
    fn default_stream_constant_is_zero() {
        assert_eq!(DEFAULT_STREAM, 0);
    }

    #[test]
    fn send_before_connect_propagates_error() {
        let mut m = mux();
        assert!(m.send(b"hi").is_err());
    }

    #[test]
    fn drain_messages_splits_received_from_other_events() {
        let (mut m, mock) = mocked_mux();
        m.connect().unwrap();
        mock.increment(Duration::from_millis(m.inner().config_passive_join_ms() + 1));
        m.poll_timers(); // passive window -> probing, sends probe 1
        for _ in 0..m.inner().config_join_requests() {
            mock.increment(Duration::from_millis(
                m.inner().config_active_join_interval_ms() + 1,
            ));
            m.poll_timers();
        }
        let (messages, other) = m.drain_messages();
        assert!(messages.is_empty());
        assert!(other
            .iter()
            .any(|e| matches!(e, TransportEvent::Connected)));
    }
}
