//! Trust Chain Verifier.
//!
//! A keyholder's pubkey is trusted when a chain of `signed_by_id` links,
//! each carrying a valid signature over the child's canonical pubkey bytes,
//! ends at a root pinned in the session's [`TrustedRoots`]. Any broken link
//! fails the keyholder and everything signed beneath it.
//!
//! Verified keyholders are remembered for the life of the verifier, so one
//! verifier should cover exactly one resolution pass over one snapshot.

use std::collections::{BTreeMap, HashSet};

use envsync_core::{
    pubkey_signing_bytes, Ed25519PublicKey, Ed25519Signature, ObjectId, OrgGraph,
    PublicKeyBundle, TrustedRoots,
};

use crate::error::{PermsError, Result, TrustFailure};
use crate::pool::CryptoPool;
use crate::provider::CryptoProvider;

/// One signature to check: `signer_key` vouching for `child` holding `bundle`.
#[derive(Debug, Clone)]
struct Hop {
    child: ObjectId,
    bundle: PublicKeyBundle,
    signer_key: Ed25519PublicKey,
    signature: Ed25519Signature,
}

impl Hop {
    fn check<P: CryptoProvider>(&self, provider: &P) -> bool {
        let message = pubkey_signing_bytes(&self.child, &self.bundle);
        provider
            .verify(&message, &self.signature, &self.signer_key)
            .is_ok()
    }
}

/// A structurally valid chain, ready for signature checks.
struct Chain {
    /// Keyholders on the chain, leaf first.
    links: Vec<ObjectId>,
    hops: Vec<Hop>,
}

/// Verifies keyholder trust chains over one graph snapshot.
pub struct TrustVerifier<'a, P: CryptoProvider> {
    graph: &'a OrgGraph,
    roots: &'a TrustedRoots,
    pool: &'a CryptoPool<P>,
    verified: HashSet<ObjectId>,
}

impl<'a, P: CryptoProvider> TrustVerifier<'a, P> {
    pub fn new(graph: &'a OrgGraph, roots: &'a TrustedRoots, pool: &'a CryptoPool<P>) -> Self {
        Self {
            graph,
            roots,
            pool,
            verified: HashSet::new(),
        }
    }

    pub fn graph(&self) -> &'a OrgGraph {
        self.graph
    }

    /// Whether a keyholder was already verified in this pass.
    pub fn is_verified(&self, id: &ObjectId) -> bool {
        self.verified.contains(id)
    }

    /// Verify one keyholder, checking signatures on the calling thread.
    ///
    /// Hops are checked root first, so a failure names the highest broken link.
    pub fn verify(&mut self, keyholder_id: &ObjectId) -> Result<()> {
        let chain = self.walk(keyholder_id).map_err(|reason| violation(keyholder_id, reason))?;
        for hop in chain.hops.iter().rev() {
            if !hop.check(self.pool.provider()) {
                let reason = TrustFailure::BadSignature(hop.child.clone());
                return Err(violation(keyholder_id, reason));
            }
        }
        self.verified.extend(chain.links);
        Ok(())
    }

    /// Verify many keyholders at once.
    ///
    /// Walks every chain first, checks each distinct hop once on the worker
    /// pool, then fails on the first broken chain in input order.
    pub async fn verify_many(&mut self, keyholder_ids: &[ObjectId]) -> Result<()> {
        let mut chains = Vec::with_capacity(keyholder_ids.len());
        for id in keyholder_ids {
            if self.verified.contains(id) {
                continue;
            }
            let chain = self.walk(id).map_err(|reason| violation(id, reason))?;
            chains.push((id, chain));
        }

        let mut distinct: BTreeMap<ObjectId, Hop> = BTreeMap::new();
        for (_, chain) in &chains {
            for hop in &chain.hops {
                distinct.entry(hop.child.clone()).or_insert_with(|| hop.clone());
            }
        }
        let hops: Vec<Hop> = distinct.into_values().collect();
        let children: Vec<ObjectId> = hops.iter().map(|h| h.child.clone()).collect();
        tracing::debug!(
            keyholders = chains.len(),
            signatures = hops.len(),
            "verifying trust chains"
        );

        let results = self.pool.run_all(hops, |provider, hop| hop.check(provider)).await?;
        let bad: HashSet<ObjectId> = children
            .into_iter()
            .zip(results)
            .filter_map(|(child, ok)| (!ok).then_some(child))
            .collect();

        for (id, chain) in chains {
            if let Some(hop) = chain.hops.iter().rev().find(|h| bad.contains(&h.child)) {
                let reason = TrustFailure::BadSignature(hop.child.clone());
                return Err(violation(id, reason));
            }
            self.verified.extend(chain.links);
        }
        Ok(())
    }

    /// Structural walk from a keyholder up to a root or an already-verified
    /// keyholder. No signatures are checked here.
    fn walk(&self, keyholder_id: &ObjectId) -> std::result::Result<Chain, TrustFailure> {
        let mut links = Vec::new();
        let mut pending: Vec<(ObjectId, PublicKeyBundle, ObjectId, Ed25519Signature)> = Vec::new();
        let mut seen = HashSet::new();
        let mut current = keyholder_id.clone();

        loop {
            if self.verified.contains(&current) {
                break;
            }
            if !seen.insert(current.clone()) {
                return Err(TrustFailure::Cycle(current));
            }
            let keyholder = self
                .graph
                .keyholder_any(&current)
                .ok_or_else(|| TrustFailure::MissingKeyholder(current.clone()))?;
            if keyholder.meta.is_deleted() {
                return Err(TrustFailure::Tombstoned(current));
            }
            let bundle = keyholder
                .pubkey
                .ok_or_else(|| TrustFailure::MissingPubkey(current.clone()))?;
            links.push(current.clone());

            match &keyholder.signed_by_id {
                None => {
                    if !self.roots.is_trusted(&current, &bundle) {
                        return Err(TrustFailure::UntrustedRoot(current));
                    }
                    break;
                }
                Some(signer_id) => {
                    let signature = keyholder
                        .signature
                        .ok_or_else(|| TrustFailure::MissingSignature(current.clone()))?;
                    pending.push((current.clone(), bundle, signer_id.clone(), signature));
                    current = signer_id.clone();
                }
            }
        }

        // Every signer was either walked above or verified earlier, so its
        // pubkey is present.
        let mut hops = Vec::with_capacity(pending.len());
        for (child, bundle, signer_id, signature) in pending {
            let signer_key = self
                .graph
                .keyholder_any(&signer_id)
                .and_then(|k| k.pubkey)
                .map(|b| b.signing)
                .ok_or(TrustFailure::MissingPubkey(signer_id))?;
            hops.push(Hop {
                child,
                bundle,
                signer_key,
                signature,
            });
        }
        Ok(Chain { links, hops })
    }
}

fn violation(keyholder_id: &ObjectId, reason: TrustFailure) -> PermsError {
    tracing::warn!(keyholder = %keyholder_id, %reason, "trust chain verification failed");
    PermsError::TrustViolation {
        keyholder_id: keyholder_id.clone(),
        reason,
    }
}
