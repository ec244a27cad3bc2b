//! # Per-sender receiver state machine (§4.B)
//!
//! One `PeerReceiver` exists per known sender-id — including the
//! distinguished `self` receiver the causal transport uses to number its
//! own outbound stream (§3 "Ownership"). Pure logic: no timers are armed
//! directly here (the [`crate::group::SenderGroup`]/[`crate::transport::CausalTransport`]
//! own the shared [`crate::timer::Scheduler`]); instead this module emits
//! [`ReceiverEvent`]s describing what the caller should arm, cancel, or
//! deliver, draining them the same way the teacher's `receiver::Receiver`
//! drains its own `events: Vec<ReceiverEvent>`.

use crate::cache::PacketCache;
use crate::config::ReceiverConfig;
use crate::stats::ReceiverStats;
use crate::timer::TimerHandle;
use crate::wire::{diff, Body, Packet, PacketId, SenderId};
use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    New,
    Preparing,
    Running,
    DataRunning,
    Failed,
    UnknownFailed,
    Stopped,
    PendingRemoval,
}

/// Events a `PeerReceiver` cannot act on itself (they need a shared
/// scheduler or the substrate) — the caller arms/sends/delivers and, for
/// the `Arm*` variants, calls back in (`on_repair_timer_fired`, etc.)
/// with the resulting [`TimerHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// A name was resolved via WHOIS_REPLY.
    NameDiscovered { name: String },
    /// The sender is now dead (either `FAILED` or `UNKNOWN_FAILED`).
    Failed,
    /// A complete, in-range message was released upward.
    Delivered { stream_id: u16, payload: Bytes },
    /// Arm a repair-request timer for a newly detected gap.
    ArmRepairRequest { packet_id: PacketId, delay: Duration },
    /// A repair-request timer fired — emit the packet onto the wire.
    SendRepairRequest {
        original_sender_id: SenderId,
        packet_id: PacketId,
    },
    /// Arm a do-repair (NAK-suppression) timer: we hold the requested
    /// packet and will re-emit it after the jittered delay.
    ArmDoRepair { packet_id: PacketId, delay: Duration },
    /// A do-repair timer fired — re-emit this cached packet.
    SendRepair { packet: Packet },
    /// Arm the whois-reply delay (storm suppression).
    ArmWhoisReply { delay: Duration },
    /// The whois-reply timer fired — announce our name.
    SendWhoisReply { name: String },
    /// Arm (or re-arm) the name-discovery timeout.
    ArmNameDiscoveryTimeout { delay: Duration },
    /// A timer handle returned by the cache/window logic is no longer
    /// needed (its packet arrived, or its slot was evicted) — cancel it
    /// on the shared scheduler.
    CancelTimer { handle: TimerHandle },
}

/// Release/pop pointer and cache for one sender's stream. See §3 and
/// §4.B for the full state machine and cache-window contract.
pub struct PeerReceiver {
    pub id: SenderId,
    pub is_self: bool,
    pub name: Option<String>,
    pub state: ReceiverState,
    config: ReceiverConfig,

    cache: PacketCache,
    /// Causal release ("pop") pointer — equals `cache.first()` at all
    /// times; packets below it have already been released.
    next_output_packet: PacketId,
    /// High-water mark of packet-ids known to exist from this sender,
    /// whether directly observed or inferred via `seen()` (SESSION
    /// gossip). Always `>= next_output_packet`.
    next_input_packet: PacketId,
    /// First DATA packet-id that may be delivered upward.
    data_start: Option<PacketId>,
    /// Terminal release bound once `FAILED`.
    end: Option<PacketId>,
    /// While `Some(id)`, DATA releases at or beyond `id` are not
    /// delivered upward (bookkeeping/pop still advances).
    data_hold: Option<PacketId>,

    /// In-flight fragment reassembly buffer (at most one in flight per
    /// sender — packet-ids are contiguous within one message, §3).
    reassembly: Option<Reassembly>,

    name_discovery_armed: bool,

    pub stats: ReceiverStats,
    events: Vec<ReceiverEvent>,
}

struct Reassembly {
    stream_id: u16,
    total: u32,
    next_part: u32,
    buf: Vec<u8>,
}

impl PeerReceiver {
    pub fn new(id: SenderId, is_self: bool, config: ReceiverConfig) -> Self {
        PeerReceiver {
            id,
            is_self,
            name: None,
            state: ReceiverState::New,
            config,
            cache: PacketCache::new(config.cache_capacity, 0),
            next_output_packet: 0,
            next_input_packet: 0,
            data_start: None,
            end: None,
            data_hold: None,
            reassembly: None,
            name_discovery_armed: false,
            stats: ReceiverStats::default(),
            events: Vec::new(),
        }
    }

    pub fn drain_events(&mut self) -> Vec<ReceiverEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn next_output_packet(&self) -> PacketId {
        self.next_output_packet
    }

    pub fn next_input_packet(&self) -> PacketId {
        self.next_input_packet
    }

    /// Should the caller arm a name-discovery timeout for this receiver?
    /// True exactly once, the first time we learn of a brand-new sender.
    pub fn needs_name_discovery_timer(&mut self) -> bool {
        if self.state == ReceiverState::New && !self.name_discovery_armed {
            self.name_discovery_armed = true;
            self.events.push(ReceiverEvent::ArmNameDiscoveryTimeout {
                delay: Duration::from_millis(self.config.name_discovery_timeout_ms),
            });
            true
        } else {
            false
        }
    }

    /// The name-discovery timer fired without a name ever arriving.
    pub fn on_name_discovery_timeout(&mut self) {
        if self.name.is_none() {
            self.set_failed();
        }
    }

    // ── §4.B public contract ────────────────────────────────────────────

    /// Define the first legal packet-id for this sender; `NEW -> PREPARING`.
    pub fn update_start(&mut self, id: PacketId) {
        if self.state == ReceiverState::New {
            self.state = ReceiverState::Preparing;
        }
        // Slide the window forward if the new start is ahead of what we
        // already track, cancelling any gap timers left behind.
        if diff(self.next_output_packet, id) > 0 {
            for handle in self.cache.advance_to(id) {
                self.cancel_handle_hint(handle);
            }
            self.next_output_packet = id;
            if diff(self.next_input_packet, id) < 0 {
                self.next_input_packet = id;
            }
        } else if self.next_output_packet == 0 && self.next_input_packet == 0 {
            self.next_output_packet = id;
            self.next_input_packet = id;
            self.cache = PacketCache::new(self.config.cache_capacity, id);
        }
    }

    /// Convenience for the transport's inbound dispatch: set the window
    /// start from the first packet-id we ever observe from a brand-new
    /// sender, otherwise a no-op.
    pub fn update_start_if_new(&mut self, id: PacketId) {
        if self.state == ReceiverState::New {
            self.update_start(id);
        }
    }

    pub fn set_data_start(&mut self, id: PacketId) {
        self.data_start = Some(id);
    }

    pub fn update_end(&mut self, id: PacketId) {
        self.end = match self.end {
            Some(existing) if diff(existing, id) <= 0 => Some(existing),
            _ => Some(id),
        };
    }

    /// Extend this sender's terminal endpoint at least to `id` — called
    /// by the group/transport's dependency check when a dependency names
    /// a `FAILED` sender beyond its currently known endpoint (§4.B causal
    /// release: "if it names a FAILED sender, extend that sender's
    /// endpoint to p so it completes").
    pub fn extend_failed_endpoint(&mut self, id: PacketId) {
        if self.state == ReceiverState::Failed {
            self.update_end(id);
        }
    }

    pub fn set_failed(&mut self) {
        if matches!(
            self.state,
            ReceiverState::Failed | ReceiverState::UnknownFailed | ReceiverState::Stopped
        ) {
            return;
        }
        self.state = if self.state == ReceiverState::New {
            ReceiverState::UnknownFailed
        } else {
            ReceiverState::Failed
        };
        self.events.push(ReceiverEvent::Failed);
    }

    pub fn stop(&mut self) {
        self.state = ReceiverState::Stopped;
    }

    pub fn hold_data(&mut self, id: PacketId) {
        self.data_hold = Some(id);
    }

    pub fn release_data(&mut self) {
        self.data_hold = None;
    }

    /// Ingest a reliable packet from this sender (§4.B `push`).
    pub fn push(&mut self, packet: Packet) {
        let id = match packet.packet_id {
            Some(id) => id,
            None => return,
        };
        match self.cache.placement(id) {
            crate::cache::Placement::Duplicate => {
                self.stats.duplicates += 1;
            }
            crate::cache::Placement::OutOfRange => {
                self.stats.out_of_range += 1;
            }
            crate::cache::Placement::InWindow => {
                let was_gap = self.cache.is_gap(id);
                if let Some(handle) = self.cache.repair_timer(id) {
                    self.cancel_handle_hint(handle);
                    self.cache.clear_repair_timer(id);
                }
                self.cache.insert(id, packet);
                self.stats.packets_received += 1;
                if was_gap {
                    // filled a previously-detected gap
                }
                self.observe_high_water(id);
            }
        }
    }

    /// Record that a packet-id is now known to exist (observed directly
    /// via `push`, or reported via `seen`), arming repair timers for any
    /// gap between our current high-water mark and `id`.
    fn observe_high_water(&mut self, id: PacketId) {
        if diff(self.next_input_packet, id) <= 0 {
            return;
        }
        let mut cursor = self.next_input_packet;
        while diff(cursor, id) > 0 {
            if self.cache.placement(cursor) == crate::cache::Placement::InWindow
                && self.cache.is_gap(cursor)
                && self.cache.repair_timer(cursor).is_none()
            {
                self.arm_gap_timer(cursor);
            }
            cursor = cursor.wrapping_add(1);
        }
        self.next_input_packet = id.wrapping_add(1);
    }

    fn arm_gap_timer(&mut self, id: PacketId) {
        self.stats.gaps_detected += 1;
        self.events.push(ReceiverEvent::ArmRepairRequest {
            packet_id: id,
            delay: crate::timer::jitter_ms(self.config.repair_request_jitter_ms),
        });
    }

    /// The caller armed a repair-request timer for `id` — store the
    /// handle so a later arrival or a narrower `seen()` can cancel it.
    pub fn set_repair_timer(&mut self, id: PacketId, handle: TimerHandle) {
        self.cache.mark_gap(id, handle);
    }

    /// A repair-request timer fired: still a gap, so emit the request and
    /// re-arm (caller is expected to call `set_repair_timer` again).
    pub fn on_repair_timer_fired(&mut self, id: PacketId) -> bool {
        if self.cache.placement(id) != crate::cache::Placement::InWindow || !self.cache.is_gap(id)
        {
            return false;
        }
        self.stats.repairs_requested += 1;
        self.events.push(ReceiverEvent::SendRepairRequest {
            original_sender_id: self.id,
            packet_id: id,
        });
        self.arm_gap_timer(id);
        true
    }

    /// Another sender reports having received up to `id` from us (§4.B
    /// `seen`, driven by inbound SESSION packets).
    pub fn seen(&mut self, id: PacketId) {
        self.observe_high_water(id);
    }

    /// A peer is missing `id` and asks us to resend it (§4.B
    /// `repair_request`). We don't resend immediately: schedule a
    /// NAK-suppression delay and let [`Self::on_do_repair_timer_fired`]
    /// do the actual resend once it fires.
    pub fn repair_request(&mut self, id: PacketId) {
        if self.cache.get(id).is_some() {
            self.stats.repairs_served += 1;
            self.events.push(ReceiverEvent::ArmDoRepair {
                packet_id: id,
                delay: crate::timer::jitter_ms(self.config.do_repair_jitter_ms),
            });
        } else if self.cache.placement(id) == crate::cache::Placement::InWindow
            && self.cache.is_gap(id)
        {
            // We're missing it too — someone else wants it badly, bump our
            // own request sooner.
            if let Some(handle) = self.cache.repair_timer(id) {
                self.cancel_handle_hint(handle);
            }
            self.events.push(ReceiverEvent::ArmRepairRequest {
                packet_id: id,
                delay: crate::timer::jitter_ms(self.config.do_repair_jitter_ms),
            });
        }
    }

    /// A do-repair timer armed by [`Self::repair_request`] fired:
    /// re-emit the cached packet now, if it's still there.
    pub fn on_do_repair_timer_fired(&mut self, id: PacketId) {
        if let Some(packet) = self.cache.get(id).cloned() {
            self.events.push(ReceiverEvent::SendRepair { packet });
        }
    }

    /// Whois traffic targeting (or from) this sender (§4.B `whois_push`).
    pub fn whois_push(&mut self, packet: &Packet) {
        match &packet.body {
            Body::WhoisRequest { queried_sender_id } if *queried_sender_id == self.id => {
                if self.is_self {
                    self.events.push(ReceiverEvent::ArmWhoisReply {
                        delay: crate::timer::jitter_ms(self.config.whois_reply_jitter_ms),
                    });
                }
            }
            Body::WhoisReply { name } if packet.sender_id == self.id => {
                self.set_name(name.clone());
            }
            _ => {}
        }
    }

    fn set_name(&mut self, name: String) {
        if self.name.as_deref() != Some(name.as_str()) {
            self.name = Some(name.clone());
            self.events.push(ReceiverEvent::NameDiscovered { name });
        }
    }

    /// Local construction path for the `self` receiver: we always know
    /// our own name immediately, no whois round-trip needed.
    pub fn set_own_name(&mut self, name: String) {
        self.name = Some(name);
    }

    pub fn on_whois_reply_timer_fired(&mut self) -> Option<String> {
        self.name.clone()
    }

    // ── causal release ("pop") ──────────────────────────────────────────

    /// The packet waiting to be released next, if we have it.
    pub fn peek_pending(&self) -> Option<&Packet> {
        self.cache.get(self.next_output_packet)
    }

    /// Release the packet at `next_output_packet`. Caller must have
    /// already verified its dependency vector is satisfied (§4.B).
    pub fn release_next(&mut self) {
        let id = self.next_output_packet;
        let Some(packet) = self.cache.get(id).cloned() else {
            return;
        };

        if matches!(self.state, ReceiverState::Preparing) {
            self.state = ReceiverState::Running;
        }

        if let Body::Data {
            part,
            total,
            stream_id,
            payload,
        } = &packet.body
        {
            let in_range = self
                .data_start
                .map(|ds| diff(ds, id) >= 0)
                .unwrap_or(false);
            if in_range {
                self.release_data_fragment(*part, *total, *stream_id, payload, id);
            }
        }

        self.next_output_packet = id.wrapping_add(1);
        for handle in self.cache.advance_to(self.next_output_packet) {
            self.cancel_handle_hint(handle);
        }
    }

    fn release_data_fragment(
        &mut self,
        part: u32,
        total: u32,
        stream_id: u16,
        payload: &Bytes,
        id: PacketId,
    ) {
        if part == 0 {
            self.reassembly = Some(Reassembly {
                stream_id,
                total,
                next_part: 0,
                buf: Vec::with_capacity(payload.len() * total.max(1) as usize),
            });
        }
        let Some(asm) = self.reassembly.as_mut() else {
            // A non-zero part arrived without ever seeing part 0 (e.g. we
            // joined mid-message) — nothing sane to reassemble into.
            return;
        };
        if asm.stream_id != stream_id || asm.next_part != part {
            // Out-of-sequence fragment for an in-progress message; drop
            // the partial reassembly rather than emit corrupt data.
            self.reassembly = None;
            return;
        }
        asm.buf.extend_from_slice(payload);
        asm.next_part += 1;

        if part == total - 1 {
            let asm = self.reassembly.take().unwrap();
            self.state = ReceiverState::DataRunning;
            let held = self
                .data_hold
                .map(|h| diff(h, id) <= 0)
                .unwrap_or(false);
            if !held {
                self.stats.delivered += 1;
                self.events.push(ReceiverEvent::Delivered {
                    stream_id: asm.stream_id,
                    payload: Bytes::from(asm.buf),
                });
            }
        }
    }

    /// A cache slot's armed timer is no longer needed — emit a cancel
    /// event so the caller can cancel it on the shared
    /// [`crate::timer::Scheduler`] it owns (`PeerReceiver` itself never
    /// touches timers directly).
    fn cancel_handle_hint(&mut self, handle: TimerHandle) {
        self.events.push(ReceiverEvent::CancelTimer { handle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::DepVec;

    fn data_packet(sender: SenderId, id: PacketId, part: u32, total: u32, payload: &[u8]) -> Packet {
        Packet {
            sender_id: sender,
            packet_id: Some(id),
            deps: DepVec::new(),
            body: Body::Data {
                part,
                total,
                stream_id: 7,
                payload: Bytes::copy_from_slice(payload),
            },
        }
    }

    fn no_data_packet(sender: SenderId, id: PacketId) -> Packet {
        Packet {
            sender_id: sender,
            packet_id: Some(id),
            deps: DepVec::new(),
            body: Body::NoData,
        }
    }

    #[test]
    fn update_start_transitions_new_to_preparing() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        assert_eq!(r.state, ReceiverState::New);
        r.update_start(100);
        assert_eq!(r.state, ReceiverState::Preparing);
        assert_eq!(r.next_output_packet(), 100);
    }

    #[test]
    fn push_and_release_single_control_packet() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        r.update_start(0);
        r.push(no_data_packet(1, 0));
        assert!(r.peek_pending().is_some());
        r.release_next();
        assert_eq!(r.state, ReceiverState::Running);
        assert_eq!(r.next_output_packet(), 1);
    }

    #[test]
    fn fragmented_data_delivers_once_on_last_part() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        r.update_start(0);
        r.set_data_start(0);
        r.push(data_packet(1, 0, 0, 3, b"aaa"));
        r.push(data_packet(1, 1, 1, 3, b"bbb"));
        r.push(data_packet(1, 2, 2, 3, b"ccc"));

        r.release_next();
        assert!(r.drain_events().is_empty());
        r.release_next();
        assert!(r.drain_events().is_empty());
        r.release_next();
        let events = r.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ReceiverEvent::Delivered { payload, stream_id } => {
                assert_eq!(*stream_id, 7);
                assert_eq!(&payload[..], b"aaabbbccc");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(r.state, ReceiverState::DataRunning);
    }

    #[test]
    fn data_before_data_start_is_not_delivered() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        r.update_start(0);
        r.set_data_start(5);
        r.push(data_packet(1, 0, 0, 1, b"x"));
        r.release_next();
        assert!(r.drain_events().is_empty());
        assert_ne!(r.state, ReceiverState::DataRunning);
    }

    #[test]
    fn gap_arms_repair_request() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        r.update_start(0);
        r.push(no_data_packet(1, 0));
        r.push(no_data_packet(1, 2)); // gap at 1
        let events = r.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ReceiverEvent::ArmRepairRequest { packet_id: 1, .. })));
    }

    #[test]
    fn out_of_range_packet_is_dropped() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        r.update_start(0);
        r.push(no_data_packet(1, 1000));
        assert_eq!(r.stats.out_of_range, 1);
        assert!(r.peek_pending().is_none());
    }

    #[test]
    fn whois_reply_sets_name_and_emits_event() {
        let mut r = PeerReceiver::new(5, false, ReceiverConfig::default());
        let reply = Packet {
            sender_id: 5,
            packet_id: None,
            deps: DepVec::new(),
            body: Body::WhoisReply {
                name: "bob".into(),
            },
        };
        r.whois_push(&reply);
        assert_eq!(r.name.as_deref(), Some("bob"));
        let events = r.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ReceiverEvent::NameDiscovered { name } if name == "bob")));
    }

    #[test]
    fn self_receiver_arms_whois_reply_on_matching_request() {
        let mut r = PeerReceiver::new(9, true, ReceiverConfig::default());
        let req = Packet {
            sender_id: 0,
            packet_id: None,
            deps: DepVec::new(),
            body: Body::WhoisRequest {
                queried_sender_id: 9,
            },
        };
        r.whois_push(&req);
        let events = r.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ReceiverEvent::ArmWhoisReply { .. })));
    }

    #[test]
    fn set_failed_from_new_is_unknown_failed() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        r.set_failed();
        assert_eq!(r.state, ReceiverState::UnknownFailed);
    }

    #[test]
    fn set_failed_from_running_is_failed() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        r.update_start(0);
        r.push(no_data_packet(1, 0));
        r.release_next();
        r.set_failed();
        assert_eq!(r.state, ReceiverState::Failed);
    }

    #[test]
    fn name_discovery_timer_arms_once() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        assert!(r.needs_name_discovery_timer());
        assert!(!r.needs_name_discovery_timer());
    }

    #[test]
    fn name_discovery_timeout_marks_unknown_failed() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        r.needs_name_discovery_timer();
        r.on_name_discovery_timeout();
        assert_eq!(r.state, ReceiverState::UnknownFailed);
    }

    #[test]
    fn repair_request_arms_do_repair_timer() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        r.update_start(0);
        r.push(no_data_packet(1, 0));
        r.drain_events();
        r.repair_request(0);
        let events = r.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ReceiverEvent::ArmDoRepair { packet_id: 0, .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ReceiverEvent::SendRepair { .. })));
    }

    #[test]
    fn do_repair_timer_fired_emits_send_repair() {
        let mut r = PeerReceiver::new(1, false, ReceiverConfig::default());
        r.update_start(0);
        r.push(no_data_packet(1, 0));
        r.drain_events();
        r.on_do_repair_timer_fired(0);
        let events = r.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ReceiverEvent::SendRepair { .. })));
    }
}
