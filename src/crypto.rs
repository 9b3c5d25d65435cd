//! DHT identity keys.
//!
//! The DHT only needs a curve25519 keypair to identify itself and address
//! peers. Handshake internals (Noise-IK message patterns, session keys)
//! live outside this crate and are consumed through the
//! [`VersionedHandshake`](crate::dht::VersionedHandshake) capability.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::types::PublicKey;

/// Long-lived DHT keypair. The secret never leaves this struct.
pub struct KeyPair {
    public: PublicKey,
    secret: StaticSecret,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(*X25519Public::from(&secret).as_bytes());
        Self { public, secret }
    }

    /// Rebuild from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey(*X25519Public::from(&secret).as_bytes());
        Self { public, secret }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Expose secret bytes for persistence. Callers own the zeroization story.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.to_hex())
            .finish_non_exhaustive()
    }
}
