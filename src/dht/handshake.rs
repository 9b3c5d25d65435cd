//! Protocol version negotiation.
//!
//! The DHT consumes a [`VersionedHandshake`] capability: something that can
//! agree on a protocol version with a peer before the first GetNodes goes
//! out. Negotiation failure is never fatal: callers fall back to the
//! unversioned path and record the peer as [`ProtocolVersion::Legacy`].
//!
//! [`NegotiatingHandshake`] is the wire-level implementation used when a
//! keypair is available: it exchanges `NoiseHandshake` packets carrying a
//! proposed version byte. The Noise-IK session establishment itself happens
//! outside this crate once a version is agreed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::dht::address::Address;
use crate::dht::error::DhtError;
use crate::dht::packet::{Packet, PacketType};
use crate::dht::transport::Transport;
use crate::types::{PUBLIC_KEY_SIZE, PublicKey};

/// NoiseHandshake payload: `sender_pubkey[32] || flags(u8) || version(u8)`.
pub const HANDSHAKE_PAYLOAD_SIZE: usize = PUBLIC_KEY_SIZE + 2;

/// `flags` value marking a negotiation request.
pub const HANDSHAKE_FLAG_REQUEST: u8 = 0;

/// `flags` value marking a negotiation response.
pub const HANDSHAKE_FLAG_RESPONSE: u8 = 1;

/// Wire protocol spoken with a given peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// Unversioned packets, legacy 50-byte node entries. The default for
    /// any peer that has not negotiated.
    #[default]
    Legacy,
    /// Noise-IK transport encryption, extended node entries.
    NoiseIkV1,
}

impl ProtocolVersion {
    pub fn as_wire(self) -> u8 {
        match self {
            Self::Legacy => 0,
            Self::NoiseIkV1 => 1,
        }
    }

    pub fn from_wire(value: u8) -> Result<Self, DhtError> {
        match value {
            0 => Ok(Self::Legacy),
            1 => Ok(Self::NoiseIkV1),
            other => Err(DhtError::UnsupportedAgreedVersion(other)),
        }
    }
}

/// Newest version this node speaks.
pub const LATEST_VERSION: ProtocolVersion = ProtocolVersion::NoiseIkV1;

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub agreed_version: ProtocolVersion,
}

/// Version negotiation capability.
#[async_trait]
pub trait VersionedHandshake: Send + Sync {
    /// Negotiate with the peer at `addr`. Implementations must time-bound
    /// the exchange; an error here means "fall back to legacy".
    async fn initiate(
        &self,
        peer: &PublicKey,
        transport: &dyn Transport,
        addr: &Address,
    ) -> Result<HandshakeResponse, DhtError>;

    /// Feed an inbound negotiation response for `addr` back to any waiter.
    /// Called by the packet dispatcher; default is a no-op for
    /// implementations that negotiate out-of-band.
    fn on_response(&self, _addr: &str, _version: u8) {}
}

/// Packet-based negotiator.
///
/// `initiate` parks a oneshot keyed by address string, sends the request,
/// and waits for the dispatcher to feed the response back via
/// [`VersionedHandshake::on_response`].
pub struct NegotiatingHandshake {
    self_key: PublicKey,
    timeout: Duration,
    pending: Mutex<HashMap<String, oneshot::Sender<u8>>>,
}

impl NegotiatingHandshake {
    pub fn new(self_key: PublicKey, timeout_secs: u64) -> Self {
        Self {
            self_key,
            timeout: Duration::from_secs(timeout_secs),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Build a negotiation packet.
    pub fn packet(self_key: &PublicKey, flags: u8, version: ProtocolVersion) -> Packet {
        let mut data = Vec::with_capacity(HANDSHAKE_PAYLOAD_SIZE);
        data.extend_from_slice(self_key.as_bytes());
        data.push(flags);
        data.push(version.as_wire());
        Packet::new(PacketType::NoiseHandshake, data)
    }
}

#[async_trait]
impl VersionedHandshake for NegotiatingHandshake {
    async fn initiate(
        &self,
        _peer: &PublicKey,
        transport: &dyn Transport,
        addr: &Address,
    ) -> Result<HandshakeResponse, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(addr.to_string(), tx);

        let request = Self::packet(&self.self_key, HANDSHAKE_FLAG_REQUEST, LATEST_VERSION);
        if let Err(e) = transport.send(&request, addr).await {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&addr.to_string());
            return Err(e.into());
        }

        let version = tokio::time::timeout(self.timeout, rx)
            .await
            .map_err(|_| {
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&addr.to_string());
                DhtError::HandshakeFailed(format!("no response from {addr}"))
            })?
            .map_err(|_| DhtError::HandshakeFailed("negotiator dropped".into()))?;

        Ok(HandshakeResponse { agreed_version: ProtocolVersion::from_wire(version)? })
    }

    fn on_response(&self, addr: &str, version: u8) {
        if let Some(tx) = self.pending.lock().expect("pending lock poisoned").remove(addr) {
            let _ = tx.send(version);
        }
    }
}
