//! Software crypto backend: x25519 key exchange, HKDF-SHA256 key
//! derivation, OS randomness.

use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{CryptoBackend, CryptoError, DhKeyPair, KeyMaterial};

/// Length of the derived SKEYID block: authentication, encryption, and
/// derivation segments of 32 bytes each.
const SKEYID_LEN: usize = 96;

pub struct SoftwareBackend;

impl SoftwareBackend {
    pub fn new() -> Self {
        SoftwareBackend
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoBackend for SoftwareBackend {
    fn cookie(&self) -> [u8; 8] {
        let mut c = [0u8; 8];
        OsRng.fill_bytes(&mut c);
        c
    }

    fn nonce(&self, len: usize) -> Vec<u8> {
        let mut n = vec![0u8; len];
        OsRng.fill_bytes(&mut n);
        n
    }

    fn dh_generate(&self) -> DhKeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        DhKeyPair::from_parts(public.as_bytes().to_vec(), secret.to_bytes().to_vec())
    }

    fn dh_shared(&self, own: &DhKeyPair, peer_public: &[u8]) -> Result<KeyMaterial, CryptoError> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| CryptoError::BadPeerKeyLength(peer_public.len()))?;
        let secret: [u8; 32] = own
            .secret()
            .try_into()
            .map_err(|_| CryptoError::BadPeerKeyLength(own.secret().len()))?;
        let shared = StaticSecret::from(secret).diffie_hellman(&PublicKey::from(peer));
        Ok(KeyMaterial::from_bytes(shared.as_bytes().to_vec()))
    }

    fn derive_skeyid(
        &self,
        psk: &[u8],
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared: &KeyMaterial,
    ) -> KeyMaterial {
        let mut salt = Vec::with_capacity(nonce_i.len() + nonce_r.len());
        salt.extend_from_slice(nonce_i);
        salt.extend_from_slice(nonce_r);

        let mut ikm = Vec::with_capacity(psk.len() + shared.as_bytes().len());
        ikm.extend_from_slice(psk);
        ikm.extend_from_slice(shared.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
        let mut okm = vec![0u8; SKEYID_LEN];
        hk.expand(b"ironike skeyid", &mut okm)
            .expect("SKEYID_LEN is a valid HKDF output length");
        KeyMaterial::from_bytes(okm)
    }

    fn auth_hash(&self, material: &KeyMaterial, parts: &[&[u8]]) -> Vec<u8> {
        let mut data = Vec::new();
        for p in parts {
            data.extend_from_slice(p);
        }
        // HKDF-extract is HMAC(salt, ikm); used here as the keyed hash.
        let (prk, _) = Hkdf::<Sha256>::extract(Some(material.as_bytes()), &data);
        prk.to_vec()
    }

    fn verify_auth(&self, material: &KeyMaterial, parts: &[&[u8]], peer_hash: &[u8]) -> bool {
        let expected = self.auth_hash(material, parts);
        if expected.len() != peer_hash.len() {
            return false;
        }
        // Constant-time comparison.
        let mut diff = 0u8;
        for (a, b) in expected.iter().zip(peer_hash.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_agreement() {
        let backend = SoftwareBackend::new();
        let a = backend.dh_generate();
        let b = backend.dh_generate();
        let ab = backend.dh_shared(&a, b.public()).unwrap();
        let ba = backend.dh_shared(&b, a.public()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn bad_peer_key_length_rejected() {
        let backend = SoftwareBackend::new();
        let a = backend.dh_generate();
        assert!(matches!(
            backend.dh_shared(&a, &[0u8; 16]),
            Err(CryptoError::BadPeerKeyLength(16))
        ));
    }

    #[test]
    fn skeyid_depends_on_all_inputs() {
        let backend = SoftwareBackend::new();
        let shared = KeyMaterial::from_bytes(vec![7u8; 32]);
        let base = backend.derive_skeyid(b"psk", b"ni", b"nr", &shared);
        let other_psk = backend.derive_skeyid(b"other", b"ni", b"nr", &shared);
        let other_nonce = backend.derive_skeyid(b"psk", b"nx", b"nr", &shared);
        assert_ne!(base.as_bytes(), other_psk.as_bytes());
        assert_ne!(base.as_bytes(), other_nonce.as_bytes());
        assert_eq!(base.as_bytes().len(), SKEYID_LEN);
    }

    #[test]
    fn auth_hash_verifies_and_rejects() {
        let backend = SoftwareBackend::new();
        let material = KeyMaterial::from_bytes(vec![3u8; 96]);
        let hash = backend.auth_hash(&material, &[b"cookie", b"id"]);
        assert!(backend.verify_auth(&material, &[b"cookie", b"id"], &hash));
        assert!(!backend.verify_auth(&material, &[b"cookie", b"other"], &hash));
        assert!(!backend.verify_auth(&material, &[b"cookie", b"id"], &hash[..16]));
    }

    #[test]
    fn cookies_are_distinct() {
        let backend = SoftwareBackend::new();
        assert_ne!(backend.cookie(), backend.cookie());
    }
}
