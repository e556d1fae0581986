//! Keyset Diff Engine.
//!
//! Compares the envelopes that exist with the envelopes a graph requires and
//! reports exactly what to seal and what to delete.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use envsync_core::{CoreError, GraphMutation, KeySet, ObjectId, OrgGraph};

use crate::requirements::{required_for_keyholder, required_keyset};

/// Envelopes to create and envelopes to delete.
///
/// `to_encrypt` and `to_delete` never share a triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetDelta {
    pub to_encrypt: KeySet,
    pub to_delete: KeySet,
}

/// Per-recipient envelope counts in a delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientChange {
    pub added: usize,
    pub removed: usize,
}

impl KeysetDelta {
    pub fn is_empty(&self) -> bool {
        self.to_encrypt.is_empty() && self.to_delete.is_empty()
    }

    /// Envelope counts grouped by recipient.
    pub fn summary(&self) -> BTreeMap<ObjectId, RecipientChange> {
        let mut summary: BTreeMap<ObjectId, RecipientChange> = BTreeMap::new();
        for triple in self.to_encrypt.triples() {
            summary.entry(triple.recipient_id).or_default().added += 1;
        }
        for triple in self.to_delete.triples() {
            summary.entry(triple.recipient_id).or_default().removed += 1;
        }
        summary
    }

    /// Keep only the changes for one recipient.
    pub fn for_recipient(&self, recipient_id: &ObjectId) -> KeysetDelta {
        KeysetDelta {
            to_encrypt: self.to_encrypt.only_recipient(recipient_id),
            to_delete: self.to_delete.only_recipient(recipient_id),
        }
    }
}

/// `to_encrypt = proposed − current`, `to_delete = current − proposed`.
pub fn diff(current: &KeySet, proposed: &KeySet) -> KeysetDelta {
    KeysetDelta {
        to_encrypt: proposed.difference(current),
        to_delete: current.difference(proposed),
    }
}

/// A proposed graph together with the envelope changes it needs.
#[derive(Debug, Clone)]
pub struct MutationDelta {
    pub proposed: OrgGraph,
    pub delta: KeysetDelta,
}

/// Apply `mutation` to a copy of `graph` and diff the required keysets.
///
/// The input graph is left untouched; callers commit `proposed` only after
/// the envelope work succeeds.
pub fn delta_for_mutation(
    graph: &OrgGraph,
    mutation: &GraphMutation,
    now: i64,
) -> Result<MutationDelta, CoreError> {
    let proposed = graph.apply(mutation, now)?;
    let delta = diff(&required_keyset(graph, now), &required_keyset(&proposed, now));
    tracing::debug!(
        upserts = mutation.upserts.len(),
        tombstones = mutation.tombstones.len(),
        to_encrypt = delta.to_encrypt.len(),
        to_delete = delta.to_delete.len(),
        "computed mutation delta"
    );
    Ok(MutationDelta { proposed, delta })
}

/// Envelopes for a newly added device or invitee: its whole requirement,
/// nothing to delete.
pub fn onboarding_delta(graph: &OrgGraph, keyholder_id: &ObjectId, now: i64) -> KeysetDelta {
    KeysetDelta {
        to_encrypt: required_for_keyholder(graph, keyholder_id, now),
        to_delete: KeySet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envsync_core::{KeyTriple, Part, Scope};

    fn triple(r: &str, env: &str, part: Part) -> KeyTriple {
        KeyTriple::new(r, Scope::environment(env), part)
    }

    #[test]
    fn test_diff_basic() {
        let current: KeySet = [
            triple("d1", "dev", Part::Env),
            triple("d1", "prod", Part::Env),
        ]
        .into_iter()
        .collect();
        let proposed: KeySet = [
            triple("d1", "dev", Part::Env),
            triple("d2", "dev", Part::Env),
        ]
        .into_iter()
        .collect();

        let delta = diff(&current, &proposed);
        assert!(delta.to_encrypt.contains_triple(&triple("d2", "dev", Part::Env)));
        assert!(delta.to_delete.contains_triple(&triple("d1", "prod", Part::Env)));
        assert_eq!(delta.to_encrypt.len(), 1);
        assert_eq!(delta.to_delete.len(), 1);

        let summary = delta.summary();
        assert_eq!(summary[&ObjectId::from("d1")], RecipientChange { added: 0, removed: 1 });
        assert_eq!(summary[&ObjectId::from("d2")], RecipientChange { added: 1, removed: 0 });
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let set: KeySet = [triple("d1", "dev", Part::Meta)].into_iter().collect();
        assert!(diff(&set, &set).is_empty());
    }

    #[test]
    fn test_delta_serializes() {
        let delta = diff(&KeySet::new(), &[triple("d1", "dev", Part::Env)].into_iter().collect());
        let json = serde_json::to_string(&delta).unwrap();
        let back: KeysetDelta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, delta);
    }
}
