//! Envelope Encryptor/Decryptor.
//!
//! Every (scope, part) has its own symmetric data key that encrypts one
//! blob. An [`Envelope`] wraps that data key for one recipient in a
//! [`SealedBox`]. Recipients are trust-verified before any key is wrapped
//! for them, and senders are trust-verified before any envelope is opened.
//!
//! Batches are all-or-nothing: one trust or integrity failure aborts the
//! whole batch and nothing is returned.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use envsync_core::{
    EnvMap, InheritsMap, KeySet, KeyTriple, MetaMap, ObjectId, Part, PublicKeyBundle, Scope,
};

use crate::crypto::{EncryptedPayload, EncryptionKey};
use crate::error::{PermsError, Result};
use crate::provider::{CryptoProvider, PrivateKeyBundle, SealedBox};
use crate::pool::CryptoPool;
use crate::trust::TrustVerifier;

/// Encrypted blobs addressed by (scope, part).
pub type Blobs = BTreeMap<(Scope, Part), EncryptedPayload>;

/// A data key wrapped for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub recipient_id: ObjectId,
    pub scope: Scope,
    pub part: Part,
    pub encrypted_by_id: ObjectId,
    pub sealed: SealedBox,
}

impl Envelope {
    pub fn triple(&self) -> KeyTriple {
        KeyTriple::new(self.recipient_id.clone(), self.scope.clone(), self.part.clone())
    }

    /// CBOR wire form.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| PermsError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| PermsError::SerializationError(e.to_string()))
    }
}

/// Plaintext inside a sealed box. Binds the key to its address so an
/// envelope cannot be replayed under another (scope, part).
#[derive(Serialize, Deserialize)]
struct WrappedKey {
    scope: Scope,
    part: Part,
    key: EncryptionKey,
}

/// Locally held plaintext data keys.
#[derive(Debug, Clone, Default)]
pub struct DataKeyring {
    keys: BTreeMap<(Scope, Part), EncryptionKey>,
}

impl DataKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scope: Scope, part: Part, key: EncryptionKey) {
        self.keys.insert((scope, part), key);
    }

    /// Generate and store a fresh key, replacing any existing one.
    pub fn rotate(&mut self, scope: &Scope, part: &Part) -> EncryptionKey {
        let key = EncryptionKey::generate();
        self.keys.insert((scope.clone(), part.clone()), key.clone());
        key
    }

    pub fn get(&self, scope: &Scope, part: &Part) -> Option<&EncryptionKey> {
        self.keys.get(&(scope.clone(), part.clone()))
    }

    pub fn contains(&self, scope: &Scope, part: &Part) -> bool {
        self.get(scope, part).is_some()
    }

    pub fn remove(&mut self, scope: &Scope, part: &Part) -> Option<EncryptionKey> {
        self.keys.remove(&(scope.clone(), part.clone()))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Merge `other` into this keyring; `other` wins on collisions.
    pub fn extend(&mut self, other: DataKeyring) {
        self.keys.extend(other.keys);
    }
}

/// Decrypted, parsed contents of one fetch.
#[derive(Debug, Clone, Default)]
pub struct DecryptedEnvs {
    pub keyring: DataKeyring,
    pub envs: BTreeMap<Scope, EnvMap>,
    pub metas: BTreeMap<Scope, MetaMap>,
    pub inherits: BTreeMap<Scope, InheritsMap>,
    /// Inherited values, keyed by (owning scope, source environment).
    pub overrides: BTreeMap<(Scope, ObjectId), EnvMap>,
    /// Raw changeset documents, keyed by (scope, changeset id).
    pub changesets: BTreeMap<(Scope, ObjectId), Bytes>,
}

/// Encrypt a JSON document under a data key.
pub fn seal_blob<P: CryptoProvider, T: Serialize>(
    provider: &P,
    key: &EncryptionKey,
    value: &T,
) -> Result<EncryptedPayload> {
    let plaintext =
        serde_json::to_vec(value).map_err(|e| PermsError::SerializationError(e.to_string()))?;
    provider.encrypt_symmetric(&plaintext, key)
}

fn parse_json<T: DeserializeOwned>(scope: &Scope, part: &Part, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| PermsError::Integrity(format!("unparseable {} blob for {}: {}", part, scope, e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Encryptor
// ─────────────────────────────────────────────────────────────────────────────

/// Wraps data keys for verified recipients, as the acting keyholder.
pub struct EnvelopeEncryptor<'a, P: CryptoProvider> {
    pool: &'a CryptoPool<P>,
    sender_id: ObjectId,
    sender_keys: Arc<PrivateKeyBundle>,
}

struct EncryptJob {
    triple: KeyTriple,
    recipient: PublicKeyBundle,
    key: EncryptionKey,
}

impl<'a, P: CryptoProvider> EnvelopeEncryptor<'a, P> {
    pub fn new(pool: &'a CryptoPool<P>, sender_id: ObjectId, sender_keys: Arc<PrivateKeyBundle>) -> Self {
        Self {
            pool,
            sender_id,
            sender_keys,
        }
    }

    /// Wrap the data key for one requirement.
    ///
    /// Returns `None` for an inheritance-override requirement whose key is
    /// not held locally.
    pub async fn encrypt(
        &self,
        verifier: &mut TrustVerifier<'_, P>,
        keyring: &DataKeyring,
        triple: &KeyTriple,
    ) -> Result<Option<Envelope>> {
        let single: KeySet = std::iter::once(triple.clone()).collect();
        let mut envelopes = self.encrypt_keyset(verifier, keyring, &single).await?;
        Ok(envelopes.pop())
    }

    /// Wrap data keys for every triple in `required`.
    pub async fn encrypt_keyset(
        &self,
        verifier: &mut TrustVerifier<'_, P>,
        keyring: &DataKeyring,
        required: &KeySet,
    ) -> Result<Vec<Envelope>> {
        let mut pending = Vec::new();
        for triple in required.triples() {
            match keyring.get(&triple.scope, &triple.part) {
                Some(key) => pending.push((triple, key.clone())),
                None if triple.part.is_inheritance_override() => {
                    tracing::debug!(%triple, "no local key for inheritance override, skipping");
                }
                None => {
                    return Err(PermsError::Integrity(format!(
                        "no data key for {} {}",
                        triple.scope, triple.part
                    )))
                }
            }
        }
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let recipients: Vec<ObjectId> = pending
            .iter()
            .map(|(t, _)| t.recipient_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        verifier.verify_many(&recipients).await?;

        let mut jobs = Vec::with_capacity(pending.len());
        for (triple, key) in pending {
            let recipient = verifier
                .graph()
                .keyholder(&triple.recipient_id)
                .and_then(|k| k.pubkey)
                .ok_or_else(|| {
                    PermsError::Integrity(format!("recipient {} has no pubkey", triple.recipient_id))
                })?;
            jobs.push(EncryptJob {
                triple,
                recipient,
                key,
            });
        }

        tracing::debug!(
            envelopes = jobs.len(),
            recipients = recipients.len(),
            "encrypting envelopes"
        );

        let sender = self.sender_keys.clone();
        let sender_id = self.sender_id.clone();
        let results = self
            .pool
            .run_all(jobs, move |provider, job| -> Result<Envelope> {
                let wrapped = WrappedKey {
                    scope: job.triple.scope.clone(),
                    part: job.triple.part.clone(),
                    key: job.key,
                };
                let mut plaintext = Vec::new();
                ciborium::into_writer(&wrapped, &mut plaintext)
                    .map_err(|e| PermsError::SerializationError(e.to_string()))?;
                let sealed = provider.encrypt_asymmetric(&plaintext, &job.recipient, &sender)?;
                Ok(Envelope {
                    recipient_id: job.triple.recipient_id,
                    scope: job.triple.scope,
                    part: job.triple.part,
                    encrypted_by_id: sender_id.clone(),
                    sealed,
                })
            })
            .await?;

        results.into_iter().collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decryptor
// ─────────────────────────────────────────────────────────────────────────────

/// Opens envelopes and blobs addressed to the acting keyholder.
pub struct EnvelopeDecryptor<'a, P: CryptoProvider> {
    pool: &'a CryptoPool<P>,
    recipient_id: ObjectId,
    recipient_keys: Arc<PrivateKeyBundle>,
}

struct UnwrapJob {
    scope: Scope,
    part: Part,
    sender: PublicKeyBundle,
    sealed: SealedBox,
}

impl<'a, P: CryptoProvider> EnvelopeDecryptor<'a, P> {
    pub fn new(
        pool: &'a CryptoPool<P>,
        recipient_id: ObjectId,
        recipient_keys: Arc<PrivateKeyBundle>,
    ) -> Self {
        Self {
            pool,
            recipient_id,
            recipient_keys,
        }
    }

    /// Verify senders, unwrap keys, decrypt and parse blobs.
    ///
    /// Every envelope must have a blob and every blob an envelope.
    pub async fn decrypt_fetched(
        &self,
        verifier: &mut TrustVerifier<'_, P>,
        envelopes: &[Envelope],
        blobs: &Blobs,
    ) -> Result<DecryptedEnvs> {
        let mut addressed = BTreeSet::new();
        for envelope in envelopes {
            if envelope.recipient_id != self.recipient_id {
                return Err(PermsError::Integrity(format!(
                    "envelope for {} delivered to {}",
                    envelope.recipient_id, self.recipient_id
                )));
            }
            let address = (envelope.scope.clone(), envelope.part.clone());
            if !blobs.contains_key(&address) {
                return Err(PermsError::Integrity(format!(
                    "envelope for {} {} has no blob",
                    envelope.scope, envelope.part
                )));
            }
            if !addressed.insert(address) {
                return Err(PermsError::Integrity(format!(
                    "duplicate envelope for {} {}",
                    envelope.scope, envelope.part
                )));
            }
        }
        if let Some((scope, part)) = blobs.keys().find(|k| !addressed.contains(*k)) {
            return Err(PermsError::Integrity(format!(
                "blob for {} {} has no envelope",
                scope, part
            )));
        }

        let senders: Vec<ObjectId> = envelopes
            .iter()
            .map(|e| e.encrypted_by_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        verifier.verify_many(&senders).await?;

        let mut unwrap_jobs = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let sender = verifier
                .graph()
                .keyholder(&envelope.encrypted_by_id)
                .and_then(|k| k.pubkey)
                .ok_or_else(|| {
                    PermsError::Integrity(format!("sender {} has no pubkey", envelope.encrypted_by_id))
                })?;
            unwrap_jobs.push(UnwrapJob {
                scope: envelope.scope.clone(),
                part: envelope.part.clone(),
                sender,
                sealed: envelope.sealed.clone(),
            });
        }

        let recipient = self.recipient_keys.clone();
        let unwrapped = self
            .pool
            .run_all(unwrap_jobs, move |provider, job| -> Result<(Scope, Part, EncryptionKey)> {
                let plaintext = provider.decrypt_asymmetric(&job.sealed, &job.sender, &recipient)?;
                let wrapped: WrappedKey = ciborium::from_reader(plaintext.as_slice())
                    .map_err(|e| PermsError::Integrity(format!("malformed wrapped key: {}", e)))?;
                if wrapped.scope != job.scope || wrapped.part != job.part {
                    return Err(PermsError::Integrity(format!(
                        "envelope for {} {} wraps key for {} {}",
                        job.scope, job.part, wrapped.scope, wrapped.part
                    )));
                }
                Ok((job.scope, job.part, wrapped.key))
            })
            .await?;

        let mut keyring = DataKeyring::new();
        for result in unwrapped {
            let (scope, part, key) = result?;
            keyring.insert(scope, part, key);
        }

        let mut blob_jobs = Vec::with_capacity(blobs.len());
        for ((scope, part), payload) in blobs {
            let key = keyring
                .get(scope, part)
                .cloned()
                .ok_or_else(|| PermsError::Integrity(format!("no key for {} {}", scope, part)))?;
            blob_jobs.push((scope.clone(), part.clone(), payload.clone(), key));
        }
        let plaintexts = self
            .pool
            .run_all(blob_jobs, |provider, (scope, part, payload, key)| {
                provider
                    .decrypt_symmetric(&payload, &key)
                    .map(|bytes| (scope, part, bytes))
            })
            .await?;

        let mut out = DecryptedEnvs {
            keyring,
            ..Default::default()
        };
        for result in plaintexts {
            let (scope, part, bytes) = result?;
            match &part {
                Part::Env => {
                    let env: EnvMap = parse_json(&scope, &part, &bytes)?;
                    out.envs.insert(scope, env);
                }
                Part::Meta => {
                    let meta: MetaMap = parse_json(&scope, &part, &bytes)?;
                    out.metas.insert(scope, meta);
                }
                Part::Inherits => {
                    let inherits: InheritsMap = parse_json(&scope, &part, &bytes)?;
                    out.inherits.insert(scope, inherits);
                }
                Part::InheritanceOverride(source) => {
                    let env: EnvMap = parse_json(&scope, &part, &bytes)?;
                    out.overrides.insert((scope, source.clone()), env);
                }
                Part::Changeset(id) => {
                    out.changesets.insert((scope, id.clone()), Bytes::from(bytes));
                }
            }
        }

        tracing::debug!(
            envelopes = envelopes.len(),
            blobs = blobs.len(),
            "decrypted fetched envs"
        );
        Ok(out)
    }
}
