//! Changesets: the ordered history of one scope.
//!
//! Version `n` of a scope is the result of applying changesets `1..=n` in
//! order to an empty map. Each changeset is stored encrypted as its own
//! `changeset:<id>` part, with a public [`ChangesetHeader`] in the graph
//! carrying its version.

use serde::{Deserialize, Serialize};

use envsync_core::{diff_env, ChangeAction, ChangesetHeader, EnvMap, ObjectId, ObjectMeta, Scope};

use crate::error::{Result, SyncError};

/// One committed batch of edits to a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: ObjectId,
    pub scope: Scope,
    pub version: u64,
    pub created_at: i64,
    pub created_by_id: ObjectId,
    pub actions: Vec<ChangeAction>,
}

impl Changeset {
    /// The changeset turning `before` (at `base_version`) into `after`.
    pub fn between(
        scope: Scope,
        base_version: u64,
        before: &EnvMap,
        after: &EnvMap,
        created_by_id: ObjectId,
        created_at: i64,
    ) -> Self {
        Self {
            id: ObjectId::generate(),
            scope,
            version: base_version + 1,
            created_at,
            created_by_id,
            actions: diff_env(before, after),
        }
    }

    /// The public graph header announcing this changeset.
    pub fn header(&self, env_parent_id: ObjectId) -> ChangesetHeader {
        ChangesetHeader {
            meta: ObjectMeta::new(self.id.clone(), self.created_at),
            env_parent_id,
            scope: self.scope.clone(),
            version: self.version,
            created_by_id: self.created_by_id.clone(),
        }
    }

    /// Apply the actions to `env`.
    pub fn apply(&self, env: &mut EnvMap) {
        for action in &self.actions {
            action.apply(env);
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::InvalidChangeset(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::InvalidChangeset(e.to_string()))
    }
}

/// Sort changesets of one scope and check they form versions `1..=n`
/// with no gaps or duplicates.
pub fn ordered(scope: &Scope, changesets: &[Changeset]) -> Result<Vec<Changeset>> {
    let mut sorted: Vec<Changeset> = changesets.to_vec();
    sorted.sort_by_key(|c| c.version);
    for (i, cs) in sorted.iter().enumerate() {
        let expected = i as u64 + 1;
        if &cs.scope != scope {
            return Err(SyncError::InvalidChangeset(format!(
                "changeset {} belongs to {}, not {}",
                cs.id, cs.scope, scope
            )));
        }
        if cs.version != expected {
            return Err(SyncError::OutOfOrder {
                scope: scope.clone(),
                expected,
                found: cs.version,
            });
        }
    }
    Ok(sorted)
}

/// Rebuild the version-`n` snapshot of a scope from its changesets.
///
/// Requires versions `1..=n` to be present exactly once; later versions are
/// ignored.
pub fn replay(scope: &Scope, changesets: &[Changeset], n: u64) -> Result<EnvMap> {
    let sorted = ordered(scope, changesets)?;
    if (sorted.len() as u64) < n {
        return Err(SyncError::OutOfOrder {
            scope: scope.clone(),
            expected: sorted.len() as u64 + 1,
            found: n,
        });
    }

    let mut env = EnvMap::new();
    for cs in sorted.iter().take(n as usize) {
        cs.apply(&mut env);
    }
    tracing::debug!(%scope, version = n, keys = env.len(), "replayed changesets");
    Ok(env)
}
