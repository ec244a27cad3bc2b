//! Error taxonomy for the public API boundary.
//!
//! Decode failures at the wire layer are deliberately *not* part of this
//! enum — they are silently dropped and counted (see [`crate::stats`]),
//! matching the teacher crate's own `Option`-based decode convention.
//! Only conditions that must be surfaced to a caller of [`crate::transport`]
//! or [`crate::wire`] get a typed variant here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// `Codec::encode` produced a packet larger than the configured MTU.
    #[error("encoded packet ({size} bytes) exceeds link MTU ({mtu} bytes)")]
    TooLarge { size: usize, mtu: usize },

    /// A user payload is too large to fragment within a sane number of
    /// DATA packets (more than 2^24 fragments would be required).
    #[error("payload ({size} bytes) exceeds the maximum reassembly budget ({max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },

    /// Identifier acquisition did not settle on a unique id before giving
    /// up (exhausted retries without ever completing join).
    #[error("failed to acquire a unique sender id during join")]
    JoinFailed,

    /// An operation that requires an established connection was attempted
    /// before `connect()` completed or after `disconnect()`.
    #[error("transport is not connected")]
    NotConnected,

    /// The substrate rejected an outbound datagram.
    #[error("substrate send failed: {0}")]
    SubstrateSend(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, TransportError>;
