//! Public key material and signatures.
//!
//! Every keyholder publishes a [`PublicKeyBundle`]: an Ed25519 key that signs
//! trust-chain links and envelopes, and an X25519 key that data keys are
//! wrapped to. Secret halves other than the signing key live in
//! `envsync-perms`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::CoreError;
use crate::types::ObjectId;

fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..8.min(bytes.len())])
}

// ─────────────────────────────────────────────────────────────────────────────
// Hashes
// ─────────────────────────────────────────────────────────────────────────────

/// A Blake3 digest, used for convergence state hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    pub fn hash(data: &[u8]) -> Self {
        blake3::hash(data).into()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<blake3::Hash> for Blake3Hash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3Hash({})", short_hex(&self.0))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public keys
// ─────────────────────────────────────────────────────────────────────────────

/// An Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ed25519PublicKey(pub [u8; 32]);

impl Ed25519PublicKey {
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check `signature` over `message`. A key that is not a valid curve
    /// point never verifies anything.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), CoreError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        key.verify(message, &Signature::from_bytes(&signature.0))
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519PublicKey({})", short_hex(&self.0))
    }
}

/// An X25519 key-agreement public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct X25519PublicKey(pub [u8; 32]);

impl X25519PublicKey {
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X25519PublicKey({})", short_hex(&self.0))
    }
}

/// The public key material a keyholder publishes in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    pub signing: Ed25519PublicKey,
    pub encryption: X25519PublicKey,
}

// ─────────────────────────────────────────────────────────────────────────────
// Signatures
// ─────────────────────────────────────────────────────────────────────────────

/// An Ed25519 signature. Serialized as hex.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature(pub [u8; 64]);

impl Ed25519Signature {
    /// All zeroes. Never verifies.
    pub const ZERO: Self = Self([0u8; 64]);
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Signature({}..)", short_hex(&self.0))
    }
}

impl Serialize for Ed25519Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Ed25519Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 64];
        hex::decode_to_slice(&text, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// The signing half of a keyholder's key material.
#[derive(Clone)]
pub struct SigningKeypair(SigningKey);

impl SigningKeypair {
    pub fn generate() -> Self {
        Self(SigningKey::generate(&mut rand::thread_rng()))
    }

    /// Deterministic keys from a 32-byte seed, as handed over in invites.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(seed))
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature(self.0.sign(message).to_bytes())
    }
}

impl fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SigningKeypair").field(&self.public_key()).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trusted roots
// ─────────────────────────────────────────────────────────────────────────────

/// Keyholders a session pins as trust-chain roots.
///
/// A root is only trusted while the graph's copy of its bundle matches the
/// pinned one exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedRoots {
    roots: BTreeMap<ObjectId, PublicKeyBundle>,
}

impl TrustedRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ObjectId, pubkey: PublicKeyBundle) {
        self.roots.insert(id, pubkey);
    }

    pub fn with_root(mut self, id: ObjectId, pubkey: PublicKeyBundle) -> Self {
        self.insert(id, pubkey);
        self
    }

    pub fn get(&self, id: &ObjectId) -> Option<&PublicKeyBundle> {
        self.roots.get(id)
    }

    /// Whether `id` is pinned with exactly `pubkey`.
    pub fn is_trusted(&self, id: &ObjectId, pubkey: &PublicKeyBundle) -> bool {
        self.roots.get(id) == Some(pubkey)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &PublicKeyBundle)> {
        self.roots.iter()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(signing: u8, encryption: u8) -> PublicKeyBundle {
        PublicKeyBundle {
            signing: Ed25519PublicKey([signing; 32]),
            encryption: X25519PublicKey([encryption; 32]),
        }
    }

    #[test]
    fn test_signature_binds_message_and_key() {
        let keys = SigningKeypair::from_seed(&[3u8; 32]);
        let signature = keys.sign(b"device-1");

        assert!(keys.public_key().verify(b"device-1", &signature).is_ok());
        assert!(keys.public_key().verify(b"device-2", &signature).is_err());
        let other = SigningKeypair::from_seed(&[4u8; 32]);
        assert!(other.public_key().verify(b"device-1", &signature).is_err());
        assert!(keys.public_key().verify(b"device-1", &Ed25519Signature::ZERO).is_err());
    }

    #[test]
    fn test_seeded_keys_are_stable() {
        let a = SigningKeypair::from_seed(&[0x42; 32]);
        let b = SigningKeypair::from_seed(&[0x42; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), SigningKeypair::generate().public_key());
    }

    #[test]
    fn test_signature_json_is_hex() {
        let signature = SigningKeypair::from_seed(&[7u8; 32]).sign(b"payload");
        let json = serde_json::to_string(&signature).unwrap();
        assert_eq!(json.len(), 128 + 2);
        assert_eq!(serde_json::from_str::<Ed25519Signature>(&json).unwrap(), signature);
        assert!(serde_json::from_str::<Ed25519Signature>(r#""abcd""#).is_err());
    }

    #[test]
    fn test_hash_display() {
        let hash = Blake3Hash::hash(b"envsync");
        assert_eq!(hash.to_string().len(), 64);
        assert_eq!(hash, Blake3Hash::hash(b"envsync"));
    }

    #[test]
    fn test_trusted_roots_require_exact_key() {
        let roots = TrustedRoots::new().with_root(ObjectId::new("owner-device"), bundle(1, 2));

        assert!(roots.is_trusted(&ObjectId::new("owner-device"), &bundle(1, 2)));
        assert!(!roots.is_trusted(&ObjectId::new("owner-device"), &bundle(1, 3)));
        assert!(!roots.is_trusted(&ObjectId::new("other"), &bundle(1, 2)));
    }
}
