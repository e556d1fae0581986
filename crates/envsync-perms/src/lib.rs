//! # envsync perms
//!
//! Who may see what, and the cryptography that enforces it.
//!
//! ## Overview
//!
//! - [`PermissionResolver`] turns the org graph into exact permission sets
//!   for org, app/block, environment, and locals scopes.
//! - [`TrustVerifier`] checks that a keyholder's pubkey chains back to a
//!   pinned root before anything is encrypted for it (or accepted from it).
//! - [`EnvelopeEncryptor`] / [`EnvelopeDecryptor`] wrap and unwrap the
//!   per-(scope, part) data keys.
//!
//! ## Encryption Model
//!
//! Encrypted content uses a two-layer key model:
//!
//! 1. **Data key**: a ChaCha20-Poly1305 key per (scope, part) encrypting one blob
//! 2. **Envelopes**: the data key sealed for each permitted keyholder with
//!    static X25519 agreement, signed by the sender
//!
//! Granting access means sealing existing data keys for a new recipient;
//! revoking means deleting envelopes and rotating keys on the next write.
//!
//! All cipher work goes through the [`CryptoProvider`] capability and runs on
//! a bounded [`CryptoPool`].

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod provider;
pub mod resolver;
pub mod roles;
pub mod trust;

pub use crypto::{EncryptedPayload, EncryptionFormat, EncryptionKey, EncryptionNonce, X25519StaticSecret};
pub use envelope::{
    seal_blob, Blobs, DataKeyring, DecryptedEnvs, Envelope, EnvelopeDecryptor, EnvelopeEncryptor,
};
pub use error::{PermsError, Result, TrustFailure};
pub use pool::{CryptoPool, PoolConfig};
pub use provider::{CryptoProvider, NativeProvider, PrivateKeyBundle, SealedBox};
pub use resolver::PermissionResolver;
pub use roles::RoleResolver;
pub use trust::TrustVerifier;
