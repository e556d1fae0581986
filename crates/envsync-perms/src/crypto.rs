//! Symmetric and key-agreement primitives.
//!
//! X25519 static-static agreement, Blake3 key derivation, and
//! ChaCha20-Poly1305 authenticated encryption. Higher layers only see these
//! through [`CryptoProvider`](crate::provider::CryptoProvider).

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use envsync_core::X25519PublicKey;

use crate::error::{PermsError, Result};

/// Context string for wrapping keys derived from an X25519 agreement.
const WRAP_KEY_CONTEXT: &str = "envsync-sealed-box-v0 wrap key";

fn random<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// A keyholder's X25519 secret.
#[derive(Clone)]
pub struct X25519StaticSecret(StaticSecret);

impl X25519StaticSecret {
    pub fn generate() -> Self {
        Self::from_bytes(random())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey(PublicKey::from(&self.0).to_bytes())
    }

    pub fn diffie_hellman(&self, peer: &X25519PublicKey) -> SharedKey {
        SharedKey(self.0.diffie_hellman(&PublicKey::from(peer.0)).to_bytes())
    }
}

impl std::fmt::Debug for X25519StaticSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("X25519StaticSecret").field(&self.public_key()).finish()
    }
}

/// Raw output of a key agreement. Only ever used through [`SharedKey::wrap_key`].
pub struct SharedKey([u8; 32]);

impl SharedKey {
    /// Derive the key that wraps data keys between two parties. `context`
    /// binds it to their identities.
    pub fn wrap_key(&self, context: &[u8]) -> EncryptionKey {
        let mut hasher = blake3::Hasher::new_derive_key(WRAP_KEY_CONTEXT);
        hasher.update(&self.0);
        hasher.update(context);
        EncryptionKey(*hasher.finalize().as_bytes())
    }
}

/// A ChaCha20-Poly1305 key: a per-(scope, part) data key or a derived
/// wrapping key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn generate() -> Self {
        Self(random())
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>> {
        self.cipher()
            .encrypt(Nonce::from_slice(&nonce.0), plaintext)
            .map_err(|e| PermsError::EncryptionError(e.to_string()))
    }

    /// Fails on any tampering or wrong key.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>> {
        self.cipher()
            .decrypt(Nonce::from_slice(&nonce.0), ciphertext)
            .map_err(|e| PermsError::DecryptionError(e.to_string()))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionNonce(pub [u8; 12]);

impl EncryptionNonce {
    pub fn generate() -> Self {
        Self(random())
    }

    pub const fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// Cipher suite of an [`EncryptedPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EncryptionFormat {
    ChaCha20Poly1305 = 1,
}

/// An encrypted blob as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub format: EncryptionFormat,
    pub nonce: EncryptionNonce,
    /// Ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Encrypt under a fresh nonce.
    pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<Self> {
        let nonce = EncryptionNonce::generate();
        Ok(Self {
            format: EncryptionFormat::ChaCha20Poly1305,
            ciphertext: key.encrypt(plaintext, &nonce)?,
            nonce,
        })
    }

    pub fn decrypt(&self, key: &EncryptionKey) -> Result<Vec<u8>> {
        match self.format {
            EncryptionFormat::ChaCha20Poly1305 => key.decrypt(&self.ciphertext, &self.nonce),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = X25519StaticSecret::generate();
        let bob = X25519StaticSecret::generate();

        let a = alice.diffie_hellman(&bob.public_key()).wrap_key(b"ctx");
        let b = bob.diffie_hellman(&alice.public_key()).wrap_key(b"ctx");
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrap_key_depends_on_context() {
        let shared = SharedKey([0x42; 32]);
        assert_ne!(shared.wrap_key(b"sender-a"), shared.wrap_key(b"sender-b"));
        assert_eq!(shared.wrap_key(b"sender-a"), shared.wrap_key(b"sender-a"));
    }

    #[test]
    fn test_payload_opens_only_with_its_key() {
        let key = EncryptionKey::generate();
        let payload = EncryptedPayload::encrypt(b"STRIPE_KEY=sk_live", &key).unwrap();
        assert_ne!(payload.ciphertext, b"STRIPE_KEY=sk_live");
        assert_eq!(payload.decrypt(&key).unwrap(), b"STRIPE_KEY=sk_live");
        assert!(matches!(
            payload.decrypt(&EncryptionKey::generate()),
            Err(PermsError::DecryptionError(_))
        ));
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = EncryptionKey::generate();
        let a = EncryptedPayload::encrypt(b"same", &key).unwrap();
        let b = EncryptedPayload::encrypt(b"same", &key).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn any_flipped_bit_is_rejected(
                plaintext in prop::collection::vec(any::<u8>(), 0..256),
                index in any::<prop::sample::Index>(),
                bit in 0..8u8,
            ) {
                let key = EncryptionKey::generate();
                let mut payload = EncryptedPayload::encrypt(&plaintext, &key).unwrap();
                let i = index.index(payload.ciphertext.len());
                payload.ciphertext[i] ^= 1 << bit;
                prop_assert!(payload.decrypt(&key).is_err());
            }
        }
    }
}
