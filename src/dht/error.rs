//! DHT error taxonomy.
//!
//! Validation failures drop the offending packet and surface to the caller;
//! routing failures end a bootstrap attempt but allow the scheduled retry;
//! transport failures on best-effort sends (pings, broadcasts, fan-out) are
//! logged at debug level and never propagate.

use crate::dht::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    // --- validation ---
    #[error("invalid public key hex: {0}")]
    InvalidKeyHex(String),

    #[error("invalid public key length: {0} (expected 64 hex chars)")]
    InvalidKeyLength(usize),

    #[error("truncated packet: {got} bytes, need at least {need}")]
    TruncatedPacket { got: usize, need: usize },

    #[error("invalid announcement: {0}")]
    InvalidAnnouncement(String),

    #[error("invalid node entry: {0}")]
    InvalidNodeEntry(String),

    // --- routing ---
    #[error("no bootstrap nodes configured")]
    NoBootstrapNodes,

    #[error("max bootstrap attempts reached ({0})")]
    MaxAttemptsReached(u32),

    #[error("insufficient connections: {connected} of {required}")]
    InsufficientConnections { connected: usize, required: usize },

    // --- transport ---
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // --- protocol ---
    #[error("unsupported packet type: {0:#04x}")]
    UnsupportedPacketType(u8),

    #[error("unsupported agreed version: {0}")]
    UnsupportedAgreedVersion(u8),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // --- distinguished non-fatal conditions ---
    /// Local-cache miss that triggered network queries. Results arrive
    /// asynchronously via the group response callback.
    #[error("group query pending")]
    QueryPending,

    #[error("operation cancelled")]
    Cancelled,
}

impl DhtError {
    /// True for conditions a caller should treat as in-progress, not failed.
    pub fn is_pending(&self) -> bool {
        matches!(self, DhtError::QueryPending)
    }
}
