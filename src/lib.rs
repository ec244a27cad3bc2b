//! # causalcast
//!
//! Reliable, causally-ordered group messaging over an unreliable
//! link-local datagram substrate (e.g. IP multicast). This crate is the
//! protocol engine only: framing, per-sender loss detection and repair,
//! causal delivery ordering, membership/identifier acquisition, and a
//! thin stream multiplexer on top. The datagram substrate itself (the
//! actual socket) is an external collaborator named only by the
//! [`substrate::Transport`] trait.
//!
//! ## Crate structure
//!
//! - [`wire`] — binary packet codec (10 packet kinds, §4.A)
//! - [`cache`] — per-sender sliding-window packet cache (§4.B)
//! - [`receiver`] — per-sender receiver state machine (§4.B)
//! - [`group`] — keyed sender map and causal pop-loop arbitration (§4.C)
//! - [`transport`] — the local node: join, dependency stamping, session/
//!   keepalive timers, graceful shutdown, inbound dispatch (§4.D)
//! - [`stream`] — logical stream multiplexing on top (§4.E)
//! - [`substrate`] — the datagram substrate interface (§4.F)
//! - [`timer`] — one-shot timer scheduler (§4.G)
//! - [`config`] — tunables for every subsystem
//! - [`stats`] — serializable counter snapshots
//! - [`error`] — public API-boundary error type

pub mod cache;
pub mod config;
pub mod error;
pub mod group;
pub mod receiver;
pub mod stats;
pub mod stream;
pub mod substrate;
pub mod timer;
pub mod transport;
pub mod wire;

pub use error::{Result, TransportError};
pub use transport::{CausalTransport, TransportEvent};
