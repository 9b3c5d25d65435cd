//! Crate-wide identity primitives: public keys, node identifiers, XOR distance.

use serde::{Deserialize, Serialize};

use crate::dht::DhtError;

/// Size of a DHT public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of the anti-spam tag appended to user-facing identifiers.
pub const NOSPAM_SIZE: usize = 4;

/// XOR distance between two public keys, compared MSB-first.
pub type Distance = [u8; PUBLIC_KEY_SIZE];

/// Anti-spam tag. All zeros for DHT-internal nodes.
pub type Nospam = [u8; NOSPAM_SIZE];

/// 32-byte node public key.
///
/// The key is the node's identity in the keyspace: bucket placement and
/// lookup ordering both derive from XOR distance over these bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Parse from a byte slice. Length must be exactly 32.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DhtError> {
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| DhtError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        if s.len() != PUBLIC_KEY_SIZE * 2 {
            return Err(DhtError::InvalidKeyLength(s.len()));
        }
        let bytes = hex::decode(s).map_err(|e| DhtError::InvalidKeyHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Bytewise XOR distance to another key.
    pub fn distance(&self, other: &PublicKey) -> Distance {
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Short hex prefix for log lines.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// Strict MSB-first comparison of two distances. Ties return false.
pub fn less_distance(a: &Distance, b: &Distance) -> bool {
    a < b
}

/// Stable node identifier: public key plus anti-spam tag.
///
/// DHT-internal nodes always carry a zero nospam; the tag exists so the
/// same type can name user-facing identities at higher layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub public_key: PublicKey,
    pub nospam: Nospam,
}

impl NodeId {
    /// DHT-internal identifier (zero nospam).
    pub fn from_public_key(public_key: PublicKey) -> Self {
        Self { public_key, nospam: [0u8; NOSPAM_SIZE] }
    }

    /// Stable string form used for equality and map keys.
    pub fn string_form(&self) -> String {
        format!("{}{}", self.public_key.to_hex(), hex::encode(self.nospam))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.public_key.fingerprint())
    }
}
