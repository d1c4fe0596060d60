//! Crypto collaborator interface.
//!
//! The engine treats all handshake cryptography as opaque: it asks the
//! backend for cookies, nonces, key-exchange material, and
//! authentication hashes, and feeds peer material back in for
//! validation. Which algorithms sit behind the trait is a backend
//! concern.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors from the crypto backend.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("peer key-exchange value has invalid length {0}")]
    BadPeerKeyLength(usize),

    #[error("key material not yet derived")]
    MaterialMissing,
}

/// Opaque derived keying material (SKEYID and friends). Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        KeyMaterial { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key bytes.
        write!(f, "KeyMaterial({} bytes)", self.bytes.len())
    }
}

/// An ephemeral key-exchange pair. The secret half is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhKeyPair {
    #[zeroize(skip)]
    public: Vec<u8>,
    secret: Vec<u8>,
}

impl DhKeyPair {
    pub fn from_parts(public: Vec<u8>, secret: Vec<u8>) -> Self {
        DhKeyPair { public, secret }
    }

    pub fn public(&self) -> &[u8] {
        &self.public
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhKeyPair(pub {} bytes)", self.public.len())
    }
}

/// The operations the keying engine needs from its crypto collaborator.
pub trait CryptoBackend: Send {
    /// Fresh 8-byte ISAKMP cookie.
    fn cookie(&self) -> [u8; 8];

    /// Fresh nonce of the given length.
    fn nonce(&self, len: usize) -> Vec<u8>;

    /// Generate an ephemeral key-exchange pair.
    fn dh_generate(&self) -> DhKeyPair;

    /// Combine our pair with the peer's public value.
    fn dh_shared(&self, own: &DhKeyPair, peer_public: &[u8]) -> Result<KeyMaterial, CryptoError>;

    /// Derive the Phase 1 keying material from the pre-shared secret,
    /// both nonces, and the shared key-exchange secret.
    fn derive_skeyid(
        &self,
        psk: &[u8],
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared: &KeyMaterial,
    ) -> KeyMaterial;

    /// Authentication hash over the given message parts, keyed by the
    /// derived material.
    fn auth_hash(&self, material: &KeyMaterial, parts: &[&[u8]]) -> Vec<u8>;

    /// Constant-time comparison of a peer-provided authentication hash.
    fn verify_auth(&self, material: &KeyMaterial, parts: &[&[u8]], peer_hash: &[u8]) -> bool;
}
