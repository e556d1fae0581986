//! The KeySet: every (recipient, scope, part) triple that needs an envelope.
//!
//! Backed by nested BTree maps so iteration order, equality, and serialized
//! form are all independent of insertion order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::scope::{KeyTriple, Part, Scope};
use crate::types::ObjectId;

/// Parts required per scope for one recipient.
pub type ScopeParts = BTreeMap<Scope, BTreeSet<Part>>;

/// Recipient → scope → parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySet {
    entries: BTreeMap<ObjectId, ScopeParts>,
}

impl KeySet {
    /// Create an empty keyset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a triple. Returns true if it was not already present.
    pub fn insert(&mut self, recipient_id: &ObjectId, scope: &Scope, part: Part) -> bool {
        self.entries
            .entry(recipient_id.clone())
            .or_default()
            .entry(scope.clone())
            .or_default()
            .insert(part)
    }

    /// Add a triple value.
    pub fn insert_triple(&mut self, triple: KeyTriple) -> bool {
        self.entries
            .entry(triple.recipient_id)
            .or_default()
            .entry(triple.scope)
            .or_default()
            .insert(triple.part)
    }

    /// Remove a triple, pruning empty branches. Returns true if it was present.
    pub fn remove(&mut self, triple: &KeyTriple) -> bool {
        let Some(scopes) = self.entries.get_mut(&triple.recipient_id) else {
            return false;
        };
        let Some(parts) = scopes.get_mut(&triple.scope) else {
            return false;
        };
        let removed = parts.remove(&triple.part);
        if parts.is_empty() {
            scopes.remove(&triple.scope);
        }
        if scopes.is_empty() {
            self.entries.remove(&triple.recipient_id);
        }
        removed
    }

    /// Whether a triple is present.
    pub fn contains(&self, recipient_id: &ObjectId, scope: &Scope, part: &Part) -> bool {
        self.entries
            .get(recipient_id)
            .and_then(|scopes| scopes.get(scope))
            .map(|parts| parts.contains(part))
            .unwrap_or(false)
    }

    /// Whether a triple value is present.
    pub fn contains_triple(&self, triple: &KeyTriple) -> bool {
        self.contains(&triple.recipient_id, &triple.scope, &triple.part)
    }

    /// All scopes and parts for one recipient.
    pub fn for_recipient(&self, recipient_id: &ObjectId) -> Option<&ScopeParts> {
        self.entries.get(recipient_id)
    }

    /// Recipients with at least one triple.
    pub fn recipients(&self) -> impl Iterator<Item = &ObjectId> {
        self.entries.keys()
    }

    /// Iterate all triples in order.
    pub fn triples(&self) -> impl Iterator<Item = KeyTriple> + '_ {
        self.entries.iter().flat_map(|(recipient, scopes)| {
            scopes.iter().flat_map(move |(scope, parts)| {
                parts
                    .iter()
                    .map(move |part| KeyTriple::new(recipient.clone(), scope.clone(), part.clone()))
            })
        })
    }

    /// Number of triples.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(|scopes| scopes.values())
            .map(|parts| parts.len())
            .sum()
    }

    /// Whether there are no triples.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Union `other` into this set.
    pub fn merge(&mut self, other: &KeySet) {
        for triple in other.triples() {
            self.insert_triple(triple);
        }
    }

    /// Triples in `self` that are not in `other`.
    pub fn difference(&self, other: &KeySet) -> KeySet {
        let mut out = KeySet::new();
        for (recipient, scopes) in &self.entries {
            let other_scopes = other.entries.get(recipient);
            for (scope, parts) in scopes {
                let other_parts = other_scopes.and_then(|s| s.get(scope));
                for part in parts {
                    if !other_parts.map(|p| p.contains(part)).unwrap_or(false) {
                        out.insert(recipient, scope, part.clone());
                    }
                }
            }
        }
        out
    }

    /// Keep only the triples matching `keep`.
    pub fn filter(&self, mut keep: impl FnMut(&KeyTriple) -> bool) -> KeySet {
        self.triples().filter(|t| keep(t)).collect()
    }

    /// Keep only one recipient's triples.
    pub fn only_recipient(&self, recipient_id: &ObjectId) -> KeySet {
        let mut out = KeySet::new();
        if let Some(scopes) = self.entries.get(recipient_id) {
            out.entries.insert(recipient_id.clone(), scopes.clone());
        }
        out
    }
}

impl FromIterator<KeyTriple> for KeySet {
    fn from_iter<I: IntoIterator<Item = KeyTriple>>(iter: I) -> Self {
        let mut set = KeySet::new();
        for triple in iter {
            set.insert_triple(triple);
        }
        set
    }
}
