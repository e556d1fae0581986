//! The crypto provider capability.
//!
//! Everything above this module treats encryption as an opaque capability:
//! keypair generation, signatures, asymmetric "sealed box" wrapping of data
//! keys, and symmetric payload encryption. [`NativeProvider`] composes the
//! workspace's audited primitives into that interface.
//!
//! All methods are pure functions of their arguments, so a provider can be
//! shared across worker threads without locking.

use serde::{Deserialize, Serialize};

use envsync_core::{Ed25519PublicKey, Ed25519Signature, PublicKeyBundle, SigningKeypair};

use crate::crypto::{EncryptedPayload, EncryptionKey, EncryptionNonce, X25519StaticSecret};
use crate::error::{PermsError, Result};

/// Domain tag for sealed box signatures.
const SEALED_BOX_DOMAIN: &[u8] = b"envsync-sealed-box-v0:";

/// A keyholder's private key material.
#[derive(Clone, Debug)]
pub struct PrivateKeyBundle {
    pub signing: SigningKeypair,
    pub encryption: X25519StaticSecret,
}

impl PrivateKeyBundle {
    /// Derive both keys deterministically from one seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let encryption_seed = blake3::derive_key("envsync-x25519-seed-v0", seed);
        Self {
            signing: SigningKeypair::from_seed(seed),
            encryption: X25519StaticSecret::from_bytes(encryption_seed),
        }
    }

    /// The public half.
    pub fn public_bundle(&self) -> PublicKeyBundle {
        PublicKeyBundle {
            signing: self.signing.public_key(),
            encryption: self.encryption.public_key(),
        }
    }
}

/// Asymmetrically encrypted data, authenticated by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    pub nonce: EncryptionNonce,
    pub ciphertext: Vec<u8>,
    /// Sender's Ed25519 signature over the domain tag, nonce, and ciphertext.
    pub signature: Ed25519Signature,
}

impl SealedBox {
    fn signed_bytes(nonce: &EncryptionNonce, ciphertext: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SEALED_BOX_DOMAIN.len() + 12 + ciphertext.len());
        buf.extend_from_slice(SEALED_BOX_DOMAIN);
        buf.extend_from_slice(nonce.as_bytes());
        buf.extend_from_slice(ciphertext);
        buf
    }
}

/// Cipher-suite-agnostic crypto capability.
pub trait CryptoProvider: Send + Sync + 'static {
    /// Generate fresh private key material.
    fn generate_keypair(&self) -> PrivateKeyBundle;

    /// Sign `data` with the signing half of `key`.
    fn sign(&self, data: &[u8], key: &PrivateKeyBundle) -> Ed25519Signature;

    /// Verify a signature made by `pubkey`.
    fn verify(&self, data: &[u8], signature: &Ed25519Signature, pubkey: &Ed25519PublicKey)
        -> Result<()>;

    /// Encrypt `data` so only `recipient` can read it, authenticated as `sender`.
    fn encrypt_asymmetric(
        &self,
        data: &[u8],
        recipient: &PublicKeyBundle,
        sender: &PrivateKeyBundle,
    ) -> Result<SealedBox>;

    /// Open a sealed box from `sender` with the recipient's private keys.
    fn decrypt_asymmetric(
        &self,
        sealed: &SealedBox,
        sender: &PublicKeyBundle,
        recipient: &PrivateKeyBundle,
    ) -> Result<Vec<u8>>;

    /// Encrypt `data` under a symmetric key.
    fn encrypt_symmetric(&self, data: &[u8], key: &EncryptionKey) -> Result<EncryptedPayload>;

    /// Decrypt a symmetric payload.
    fn decrypt_symmetric(&self, payload: &EncryptedPayload, key: &EncryptionKey) -> Result<Vec<u8>>;
}

/// The default provider: Ed25519, X25519, Blake3, ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeProvider;

impl NativeProvider {
    pub fn new() -> Self {
        Self
    }

    /// Wrapping key context: both signing keys, sender first.
    fn wrap_context(sender: &Ed25519PublicKey, recipient: &Ed25519PublicKey) -> [u8; 64] {
        let mut context = [0u8; 64];
        context[..32].copy_from_slice(sender.as_bytes());
        context[32..].copy_from_slice(recipient.as_bytes());
        context
    }
}

impl CryptoProvider for NativeProvider {
    fn generate_keypair(&self) -> PrivateKeyBundle {
        PrivateKeyBundle {
            signing: SigningKeypair::generate(),
            encryption: X25519StaticSecret::generate(),
        }
    }

    fn sign(&self, data: &[u8], key: &PrivateKeyBundle) -> Ed25519Signature {
        key.signing.sign(data)
    }

    fn verify(
        &self,
        data: &[u8],
        signature: &Ed25519Signature,
        pubkey: &Ed25519PublicKey,
    ) -> Result<()> {
        Ok(pubkey.verify(data, signature)?)
    }

    fn encrypt_asymmetric(
        &self,
        data: &[u8],
        recipient: &PublicKeyBundle,
        sender: &PrivateKeyBundle,
    ) -> Result<SealedBox> {
        let shared = sender.encryption.diffie_hellman(&recipient.encryption);
        let context = Self::wrap_context(&sender.signing.public_key(), &recipient.signing);
        let wrap_key = shared.wrap_key(&context);

        let nonce = EncryptionNonce::generate();
        let ciphertext = wrap_key.encrypt(data, &nonce)?;
        let signature = sender
            .signing
            .sign(&SealedBox::signed_bytes(&nonce, &ciphertext));

        Ok(SealedBox {
            nonce,
            ciphertext,
            signature,
        })
    }

    fn decrypt_asymmetric(
        &self,
        sealed: &SealedBox,
        sender: &PublicKeyBundle,
        recipient: &PrivateKeyBundle,
    ) -> Result<Vec<u8>> {
        sender
            .signing
            .verify(
                &SealedBox::signed_bytes(&sealed.nonce, &sealed.ciphertext),
                &sealed.signature,
            )
            .map_err(|_| PermsError::DecryptionError("sealed box signature mismatch".into()))?;

        let shared = recipient.encryption.diffie_hellman(&sender.encryption);
        let context = Self::wrap_context(&sender.signing, &recipient.signing.public_key());
        let wrap_key = shared.wrap_key(&context);
        wrap_key.decrypt(&sealed.ciphertext, &sealed.nonce)
    }

    fn encrypt_symmetric(&self, data: &[u8], key: &EncryptionKey) -> Result<EncryptedPayload> {
        EncryptedPayload::encrypt(data, key)
    }

    fn decrypt_symmetric(&self, payload: &EncryptedPayload, key: &EncryptionKey) -> Result<Vec<u8>> {
        payload.decrypt(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sealed_box_roundtrip() {
        let provider = NativeProvider::new();
        let alice = provider.generate_keypair();
        let bob = provider.generate_keypair();

        let sealed = provider
            .encrypt_asymmetric(b"data key", &bob.public_bundle(), &alice)
            .unwrap();
        let opened = provider
            .decrypt_asymmetric(&sealed, &alice.public_bundle(), &bob)
            .unwrap();
        assert_eq!(opened, b"data key");
    }

    #[test]
    fn test_sealed_box_rejects_wrong_sender() {
        let provider = NativeProvider::new();
        let alice = provider.generate_keypair();
        let bob = provider.generate_keypair();
        let mallory = provider.generate_keypair();

        let sealed = provider
            .encrypt_asymmetric(b"data key", &bob.public_bundle(), &alice)
            .unwrap();
        assert!(provider
            .decrypt_asymmetric(&sealed, &mallory.public_bundle(), &bob)
            .is_err());
    }

    #[test]
    fn test_sealed_box_rejects_tampering() {
        let provider = NativeProvider::new();
        let alice = provider.generate_keypair();
        let bob = provider.generate_keypair();

        let mut sealed = provider
            .encrypt_asymmetric(b"data key", &bob.public_bundle(), &alice)
            .unwrap();
        sealed.ciphertext[0] ^= 0x01;
        assert!(provider
            .decrypt_asymmetric(&sealed, &alice.public_bundle(), &bob)
            .is_err());
    }

    #[test]
    fn test_only_recipient_can_open() {
        let provider = NativeProvider::new();
        let alice = provider.generate_keypair();
        let bob = provider.generate_keypair();
        let eve = provider.generate_keypair();

        let sealed = provider
            .encrypt_asymmetric(b"data key", &bob.public_bundle(), &alice)
            .unwrap();
        assert!(provider
            .decrypt_asymmetric(&sealed, &alice.public_bundle(), &eve)
            .is_err());
    }

    #[test]
    fn test_seeded_bundle_is_deterministic() {
        let a = PrivateKeyBundle::from_seed(&[9u8; 32]);
        let b = PrivateKeyBundle::from_seed(&[9u8; 32]);
        assert_eq!(a.public_bundle(), b.public_bundle());
    }

    #[test]
    fn test_sign_verify() {
        let provider = NativeProvider::new();
        let key = provider.generate_keypair();
        let sig = provider.sign(b"msg", &key);
        provider
            .verify(b"msg", &sig, &key.public_bundle().signing)
            .unwrap();
        assert!(provider
            .verify(b"msg2", &sig, &key.public_bundle().signing)
            .is_err());
    }
}
