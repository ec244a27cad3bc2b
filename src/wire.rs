//! # Wire format
//!
//! The on-the-wire packet layout (§4.A / §6.1):
//!
//! ```text
//! u8  tag
//! u8  version
//! u32 sender_id
//! (if reliable)
//!   u32 packet_id
//! (if carries deps)
//!   u8  n_deps
//!   [{ u32 sender_id; u32 packet_id } × n_deps]
//! (kind-specific body)
//! ```
//!
//! All integers are network byte order. `version` MUST be 0; decoders
//! reject anything else. Reliability and dependency-carrying are
//! independent per kind — `SESSION` carries a dependency vector without
//! being individually reliable/cached, while `REPAIR_REQUEST` carries
//! neither.

use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use std::fmt;

pub const PROTOCOL_VERSION: u8 = 0;

/// Non-zero 32-bit sender identifier. `0` is reserved for a node that has
/// not yet acquired an id (§3).
pub type SenderId = u32;

/// Per-sender 32-bit packet counter (§3).
pub type PacketId = u32;

/// 24-bit unsigned value, as used by DATA's `part`/`total` fields.
pub const MAX_U24: u32 = (1 << 24) - 1;

const MAX_NAME_LEN: usize = 255;
const MAX_DEPS: usize = 255;
const MAX_IDS: usize = 255;

/// `diff(from, to)`: circular 32-bit distance (§3). Treats the 32-bit
/// packet-id space as a ring; the wrapping subtraction reinterpreted as
/// signed gives "forward" distances as positive and "backward" (or
/// far-wrapped) distances as negative, exactly the comparison every
/// packet-id ordering decision in this crate relies on.
#[inline]
pub fn diff(from: u32, to: u32) -> i32 {
    to.wrapping_sub(from) as i32
}

/// A single entry of a dependency vector: "the next packet we expect from
/// `sender_id` is `packet_id`" (§3, §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub sender_id: SenderId,
    pub packet_id: PacketId,
}

/// Dependency vectors are small in practice (group size, typically ≤ 10);
/// inline storage for up to 8 avoids a heap allocation per packet (§9).
pub type DepVec = SmallVec<[Dependency; 8]>;

/// A small list of sender-ids, used by ATTEMPT_JOIN/JOIN/FAILURE bodies.
pub type SenderList = SmallVec<[SenderId; 8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    WhoisRequest = 0,
    WhoisReply = 1,
    Data = 2,
    RepairRequest = 3,
    Session = 4,
    Bye = 5,
    NoData = 6,
    AttemptJoin = 7,
    Join = 8,
    Failure = 9,
}

impl PacketKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        use PacketKind::*;
        Some(match tag {
            0 => WhoisRequest,
            1 => WhoisReply,
            2 => Data,
            3 => RepairRequest,
            4 => Session,
            5 => Bye,
            6 => NoData,
            7 => AttemptJoin,
            8 => Join,
            9 => Failure,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Reliable: assigned a `packet_id`, cached, retransmitted on repair.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            PacketKind::Data
                | PacketKind::Bye
                | PacketKind::NoData
                | PacketKind::AttemptJoin
                | PacketKind::Join
                | PacketKind::Failure
        )
    }

    /// Carries a dependency vector on the wire (either the causal deps of
    /// a reliable packet, or SESSION's "what I've received" summary).
    pub fn carries_deps(self) -> bool {
        self.is_reliable() || matches!(self, PacketKind::Session)
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketKind::WhoisRequest => "WHOIS_REQUEST",
            PacketKind::WhoisReply => "WHOIS_REPLY",
            PacketKind::Data => "DATA",
            PacketKind::RepairRequest => "REPAIR_REQUEST",
            PacketKind::Session => "SESSION",
            PacketKind::Bye => "BYE",
            PacketKind::NoData => "NO_DATA",
            PacketKind::AttemptJoin => "ATTEMPT_JOIN",
            PacketKind::Join => "JOIN",
            PacketKind::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

/// Kind-specific packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    WhoisRequest { queried_sender_id: SenderId },
    WhoisReply { name: String },
    Data {
        part: u32,
        total: u32,
        stream_id: u16,
        payload: Bytes,
    },
    RepairRequest {
        original_sender_id: SenderId,
        packet_id: PacketId,
    },
    Session,
    Bye,
    NoData,
    AttemptJoin { senders: SenderList },
    Join { senders: SenderList },
    Failure { senders: SenderList },
}

impl Body {
    pub fn kind(&self) -> PacketKind {
        match self {
            Body::WhoisRequest { .. } => PacketKind::WhoisRequest,
            Body::WhoisReply { .. } => PacketKind::WhoisReply,
            Body::Data { .. } => PacketKind::Data,
            Body::RepairRequest { .. } => PacketKind::RepairRequest,
            Body::Session => PacketKind::Session,
            Body::Bye => PacketKind::Bye,
            Body::NoData => PacketKind::NoData,
            Body::AttemptJoin { .. } => PacketKind::AttemptJoin,
            Body::Join { .. } => PacketKind::Join,
            Body::Failure { .. } => PacketKind::Failure,
        }
    }
}

/// A fully-formed packet: common header fields plus a kind-specific body.
///
/// `packet_id` is `Some` iff `body.kind().is_reliable()`; `deps` is
/// non-empty only when `body.kind().carries_deps()` (an empty dep vector
/// on a deps-carrying kind is legal — e.g. a lone node with no known
/// peers yet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sender_id: SenderId,
    pub packet_id: Option<PacketId>,
    pub deps: DepVec,
    pub body: Body,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        self.body.kind()
    }

    /// Encode this packet, failing with [`TransportError::TooLarge`] if the
    /// result would not fit within `max_size` (the substrate's MTU, §4.F).
    pub fn encode(&self, max_size: usize) -> Result<Bytes, TransportError> {
        let mut out = BytesMut::with_capacity(32);
        out.put_u8(self.kind().tag());
        out.put_u8(PROTOCOL_VERSION);
        out.put_u32(self.sender_id);

        if self.kind().is_reliable() {
            out.put_u32(self.packet_id.expect("reliable packet missing packet_id"));
        }
        if self.kind().carries_deps() {
            out.put_u8(self.deps.len().min(MAX_DEPS) as u8);
            for dep in self.deps.iter().take(MAX_DEPS) {
                out.put_u32(dep.sender_id);
                out.put_u32(dep.packet_id);
            }
        }

        match &self.body {
            Body::WhoisRequest { queried_sender_id } => {
                out.put_u32(*queried_sender_id);
            }
            Body::WhoisReply { name } => {
                let bytes = name.as_bytes();
                let len = bytes.len().min(MAX_NAME_LEN);
                out.put_u8(len as u8);
                out.put_slice(&bytes[..len]);
            }
            Body::Data {
                part,
                total,
                stream_id,
                payload,
            } => {
                put_u24(&mut out, *part);
                put_u24(&mut out, *total);
                out.put_u16(*stream_id);
                out.put_slice(payload);
            }
            Body::RepairRequest {
                original_sender_id,
                packet_id,
            } => {
                out.put_u32(*original_sender_id);
                out.put_u32(*packet_id);
            }
            Body::Session | Body::Bye | Body::NoData => {}
            Body::AttemptJoin { senders }
            | Body::Join { senders }
            | Body::Failure { senders } => {
                out.put_u8(senders.len().min(MAX_IDS) as u8);
                for id in senders.iter().take(MAX_IDS) {
                    out.put_u32(*id);
                }
            }
        }

        if out.len() > max_size {
            return Err(TransportError::TooLarge {
                size: out.len(),
                mtu: max_size,
            });
        }
        Ok(out.freeze())
    }

    /// Decode a packet, returning `None` on truncation, an unknown tag or
    /// version, or any kind-specific malformation (e.g. DATA's `part >=
    /// total`). Malformed input is never a typed error (§7) — the caller
    /// counts and drops it.
    pub fn decode(mut buf: &[u8]) -> Option<Packet> {
        if buf.len() < 6 {
            return None;
        }
        let tag = buf.get_u8();
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return None;
        }
        let kind = PacketKind::from_tag(tag)?;
        let sender_id = buf.get_u32();

        let packet_id = if kind.is_reliable() {
            if buf.remaining() < 4 {
                return None;
            }
            Some(buf.get_u32())
        } else {
            None
        };

        let deps = if kind.carries_deps() {
            decode_deps(&mut buf)?
        } else {
            DepVec::new()
        };

        let body = decode_body(kind, &mut buf)?;

        Some(Packet {
            sender_id,
            packet_id,
            deps,
            body,
        })
    }
}

fn decode_deps(buf: &mut &[u8]) -> Option<DepVec> {
    if buf.remaining() < 1 {
        return None;
    }
    let n = buf.get_u8() as usize;
    if buf.remaining() < n * 8 {
        return None;
    }
    let mut deps = DepVec::with_capacity(n);
    for _ in 0..n {
        let sender_id = buf.get_u32();
        let packet_id = buf.get_u32();
        deps.push(Dependency {
            sender_id,
            packet_id,
        });
    }
    Some(deps)
}

fn decode_senders(buf: &mut &[u8]) -> Option<SenderList> {
    if buf.remaining() < 1 {
        return None;
    }
    let n = buf.get_u8() as usize;
    if buf.remaining() < n * 4 {
        return None;
    }
    let mut senders = SenderList::with_capacity(n);
    for _ in 0..n {
        senders.push(buf.get_u32());
    }
    Some(senders)
}

fn decode_body(kind: PacketKind, buf: &mut &[u8]) -> Option<Body> {
    Some(match kind {
        PacketKind::WhoisRequest => {
            if buf.remaining() < 4 {
                return None;
            }
            Body::WhoisRequest {
                queried_sender_id: buf.get_u32(),
            }
        }
        PacketKind::WhoisReply => {
            if buf.remaining() < 1 {
                return None;
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return None;
            }
            let mut raw = vec![0u8; len];
            buf.copy_to_slice(&mut raw);
            let name = String::from_utf8(raw).ok()?;
            Body::WhoisReply { name }
        }
        PacketKind::Data => {
            if buf.remaining() < 3 + 3 + 2 {
                return None;
            }
            let part = get_u24(buf);
            let total = get_u24(buf);
            let stream_id = buf.get_u16();
            if total == 0 || part >= total {
                return None;
            }
            let payload = Bytes::copy_from_slice(buf);
            buf.advance(buf.remaining());
            Body::Data {
                part,
                total,
                stream_id,
                payload,
            }
        }
        PacketKind::RepairRequest => {
            if buf.remaining() < 8 {
                return None;
            }
            Body::RepairRequest {
                original_sender_id: buf.get_u32(),
                packet_id: buf.get_u32(),
            }
        }
        PacketKind::Session => Body::Session,
        PacketKind::Bye => Body::Bye,
        PacketKind::NoData => Body::NoData,
        PacketKind::AttemptJoin => Body::AttemptJoin {
            senders: decode_senders(buf)?,
        },
        PacketKind::Join => Body::Join {
            senders: decode_senders(buf)?,
        },
        PacketKind::Failure => Body::Failure {
            senders: decode_senders(buf)?,
        },
    })
}

#[inline]
fn put_u24(out: &mut BytesMut, val: u32) {
    debug_assert!(val <= MAX_U24);
    out.put_u8((val >> 16) as u8);
    out.put_u8((val >> 8) as u8);
    out.put_u8(val as u8);
}

#[inline]
fn get_u24(buf: &mut &[u8]) -> u32 {
    let b0 = buf.get_u8() as u32;
    let b1 = buf.get_u8() as u32;
    let b2 = buf.get_u8() as u32;
    (b0 << 16) | (b1 << 8) | b2
}

/// Append as much of `data` as fits within `budget` bytes into `out`,
/// returning the number of bytes consumed. Callers loop this to fragment
/// a user message across DATA packets (§4.A): each iteration reserves
/// `budget` as the MTU minus that packet's header size.
pub fn add_payload(out: &mut BytesMut, data: &[u8], budget: usize) -> usize {
    let n = data.len().min(budget);
    out.put_slice(&data[..n]);
    n
}

/// Fixed header size (tag+version+sender_id) shared by every packet kind.
pub const COMMON_HEADER_LEN: usize = 1 + 1 + 4;

/// Size of a reliable packet's `packet_id` field.
pub const PACKET_ID_LEN: usize = 4;

/// Size of the DATA body's fixed prefix (part+total+stream_id), before
/// the variable-length payload.
pub const DATA_PREFIX_LEN: usize = 3 + 3 + 2;

/// Size, in bytes, of one dependency-vector entry on the wire.
pub const DEP_ENTRY_LEN: usize = 4 + 4;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_packets() -> Vec<Packet> {
        vec![
            Packet {
                sender_id: 0,
                packet_id: None,
                deps: DepVec::new(),
                body: Body::WhoisRequest {
                    queried_sender_id: 42,
                },
            },
            Packet {
                sender_id: 42,
                packet_id: None,
                deps: DepVec::new(),
                body: Body::WhoisReply {
                    name: "alice".into(),
                },
            },
            Packet {
                sender_id: 7,
                packet_id: Some(100),
                deps: DepVec::from_iter([Dependency {
                    sender_id: 9,
                    packet_id: 3,
                }]),
                body: Body::Data {
                    part: 0,
                    total: 3,
                    stream_id: 1,
                    payload: Bytes::from_static(b"hello world"),
                },
            },
            Packet {
                sender_id: 7,
                packet_id: None,
                deps: DepVec::new(),
                body: Body::RepairRequest {
                    original_sender_id: 9,
                    packet_id: 2,
                },
            },
            Packet {
                sender_id: 7,
                packet_id: None,
                deps: DepVec::from_iter([Dependency {
                    sender_id: 9,
                    packet_id: 3,
                }]),
                body: Body::Session,
            },
            Packet {
                sender_id: 7,
                packet_id: Some(5),
                deps: DepVec::new(),
                body: Body::Bye,
            },
            Packet {
                sender_id: 7,
                packet_id: Some(6),
                deps: DepVec::new(),
                body: Body::NoData,
            },
            Packet {
                sender_id: 7,
                packet_id: Some(1),
                deps: DepVec::new(),
                body: Body::AttemptJoin {
                    senders: SenderList::from_iter([1, 2, 3]),
                },
            },
            Packet {
                sender_id: 7,
                packet_id: Some(2),
                deps: DepVec::new(),
                body: Body::Join {
                    senders: SenderList::from_iter([4]),
                },
            },
            Packet {
                sender_id: 7,
                packet_id: Some(3),
                deps: DepVec::new(),
                body: Body::Failure {
                    senders: SenderList::from_iter([5, 6]),
                },
            },
        ]
    }

    #[test]
    fn round_trip_every_kind() {
        for p in sample_packets() {
            let encoded = p.encode(4096).unwrap();
            let decoded = Packet::decode(&encoded).expect("decode");
            assert_eq!(decoded, p);
        }
    }

    #[test]
    fn rejects_unknown_version() {
        let p = Packet {
            sender_id: 1,
            packet_id: None,
            deps: DepVec::new(),
            body: Body::WhoisRequest {
                queried_sender_id: 2,
            },
        };
        let mut encoded = p.encode(4096).unwrap().to_vec();
        encoded[1] = 7;
        assert!(Packet::decode(&encoded).is_none());
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut buf = BytesMut::new();
        buf.put_u8(255);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u32(1);
        assert!(Packet::decode(&buf).is_none());
    }

    #[test]
    fn rejects_truncated_header() {
        let p = Packet {
            sender_id: 1,
            packet_id: Some(1),
            deps: DepVec::new(),
            body: Body::Data {
                part: 0,
                total: 2,
                stream_id: 0,
                payload: Bytes::from_static(b"xy"),
            },
        };
        let encoded = p.encode(4096).unwrap();
        let truncated_header = &encoded[..4];
        assert!(Packet::decode(truncated_header).is_none());
    }

    #[test]
    fn rejects_part_geq_total() {
        let mut out = BytesMut::new();
        out.put_u8(PacketKind::Data.tag());
        out.put_u8(PROTOCOL_VERSION);
        out.put_u32(1);
        out.put_u32(10); // packet_id
        out.put_u8(0); // n_deps
        put_u24(&mut out, 2); // part
        put_u24(&mut out, 2); // total -- part >= total
        out.put_u16(0);
        assert!(Packet::decode(&out).is_none());
    }

    #[test]
    fn encode_too_large_errors() {
        let p = Packet {
            sender_id: 1,
            packet_id: Some(1),
            deps: DepVec::new(),
            body: Body::Data {
                part: 0,
                total: 1,
                stream_id: 0,
                payload: Bytes::from(vec![0u8; 2000]),
            },
        };
        let err = p.encode(64).unwrap_err();
        assert!(matches!(err, TransportError::TooLarge { .. }));
    }

    #[test]
    fn diff_handles_wraparound() {
        assert_eq!(diff(0, 1), 1);
        assert_eq!(diff(1, 0), -1);
        assert_eq!(diff(u32::MAX, 0), 1);
        assert_eq!(diff(0, u32::MAX), -1);
    }

    proptest! {
        #[test]
        fn diff_is_skew_symmetric(a in any::<u32>(), b in any::<u32>()) {
            if a != b {
                // diff(a, b) == -diff(b, a), except at the antipodal point
                // (gap == 0x8000_0000) where both directions agree on i32::MIN.
                let fwd = diff(a, b);
                let back = diff(b, a);
                if fwd != i32::MIN {
                    prop_assert_eq!(fwd, -back);
                }
            }
        }

        #[test]
        fn data_packet_round_trips(
            part in 0u32..1000,
            extra in 1u32..1000,
            stream_id in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..500),
        ) {
            let total = part + extra;
            let p = Packet {
                sender_id: 123,
                packet_id: Some(999),
                deps: DepVec::new(),
                body: Body::Data {
                    part,
                    total,
                    stream_id,
                    payload: Bytes::from(payload),
                },
            };
            let encoded = p.encode(usize::MAX).unwrap();
            let decoded = Packet::decode(&encoded).unwrap();
            prop_assert_eq!(decoded, p);
        }
    }
}
