//! Pending Change & Conflict Reconciler.
//!
//! Tracks uncommitted local edits per scope and reconciles them against each
//! authoritative refresh.
//!
//! ## Scope States
//!
//! ```text
//! Clean ──edit──> Dirty ──begin_commit──> Committing ──finish_commit──> Clean
//!   ^               │                         │
//!   └──reset/───────┘                         └──fail_commit──> Dirty
//!      reconcile
//! ```
//!
//! On reconcile, each pending edit compares its recorded base with the latest
//! authoritative cell:
//!
//! - unchanged: the edit still applies
//! - changed to the edit's own target: the edit is a no-op and is dropped
//! - key deleted underneath a value base, or scope gone: the edit is stale
//!   and pruned
//! - changed to anything else: the edit becomes a [`Conflict`]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use envsync_core::{Conflict, EnvCell, EnvMap, OrgGraph, PendingEnvUpdate, PendingKey, Scope};
use envsync_store::{Store, StoreExt};

use crate::error::{Result, SyncError};

/// Lifecycle state of one scope's pending edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeState {
    Clean,
    Dirty,
    Committing,
}

/// How the user settles a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Re-queue the local target against the authoritative value.
    KeepLocal,
    /// Discard the local edit.
    KeepRemote,
}

/// Authoritative state as of one refresh.
pub struct Authoritative<'a> {
    pub graph: &'a OrgGraph,
    /// Decrypted env maps of the scopes this client can read.
    pub envs: &'a BTreeMap<Scope, EnvMap>,
}

impl<'a> Authoritative<'a> {
    fn scope_is_live(&self, scope: &Scope) -> bool {
        if self.graph.env_parent_of_scope(scope).is_none() {
            return false;
        }
        match scope {
            Scope::Locals { user_id, .. } => self.graph.keyholder(user_id).is_some(),
            Scope::Environment(_) => true,
        }
    }

    /// Current map of a scope. A scope that was never written is empty;
    /// `None` means it has history this client cannot read.
    fn current(&self, scope: &Scope) -> Option<std::borrow::Cow<'a, EnvMap>> {
        match self.envs.get(scope) {
            Some(env) => Some(std::borrow::Cow::Borrowed(env)),
            None if self.graph.scope_version(scope) == 0 => Some(std::borrow::Cow::Owned(EnvMap::new())),
            None => None,
        }
    }

    fn version(&self, scope: &Scope) -> u64 {
        self.graph.scope_version(scope)
    }
}

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Edits that still apply.
    pub still_pending: usize,
    /// Edits whose target is now authoritative.
    pub dropped_noops: Vec<PendingKey>,
    /// Conflicts raised by this pass.
    pub conflicts: Vec<Conflict>,
    /// Edits and conflicts referencing deleted scopes or keys.
    pub pruned_stale: Vec<PendingKey>,
}

/// Pending edits and unresolved conflicts for one client.
#[derive(Debug, Clone, Default)]
pub struct PendingChanges {
    updates: BTreeMap<PendingKey, PendingEnvUpdate>,
    conflicts: BTreeMap<PendingKey, Conflict>,
    committing: BTreeSet<Scope>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records.
    pub fn from_parts(updates: Vec<PendingEnvUpdate>, conflicts: Vec<Conflict>) -> Self {
        Self {
            updates: updates.into_iter().map(|u| (u.key.clone(), u)).collect(),
            conflicts: conflicts.into_iter().map(|c| (c.key.clone(), c)).collect(),
            committing: BTreeSet::new(),
        }
    }

    /// Load persisted edits and conflicts.
    pub async fn load<S: Store + ?Sized>(store: &S) -> Result<Self> {
        let updates = store.list_pending().await?;
        let conflicts = store.list_conflicts().await?;
        tracing::debug!(
            pending = updates.len(),
            conflicts = conflicts.len(),
            "loaded pending state"
        );
        Ok(Self::from_parts(updates, conflicts))
    }

    /// Persist the current edits and conflicts, replacing what was stored.
    pub async fn persist<S: Store + ?Sized>(&self, store: &S) -> Result<()> {
        let updates: Vec<PendingEnvUpdate> = self.updates.values().cloned().collect();
        let conflicts: Vec<Conflict> = self.conflicts.values().cloned().collect();
        store.sync_pending_state(&updates, &conflicts).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self, scope: &Scope) -> ScopeState {
        if self.committing.contains(scope) {
            ScopeState::Committing
        } else if self.updates.keys().any(|k| &k.scope == scope) {
            ScopeState::Dirty
        } else {
            ScopeState::Clean
        }
    }

    pub fn updates(&self) -> impl Iterator<Item = &PendingEnvUpdate> {
        self.updates.values()
    }

    pub fn updates_for<'a>(&'a self, scope: &'a Scope) -> impl Iterator<Item = &'a PendingEnvUpdate> + 'a {
        self.updates.values().filter(move |u| &u.key.scope == scope)
    }

    pub fn get(&self, key: &PendingKey) -> Option<&PendingEnvUpdate> {
        self.updates.get(key)
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.values()
    }

    /// Scopes with at least one pending edit.
    pub fn dirty_scopes(&self) -> BTreeSet<Scope> {
        self.updates.keys().map(|k| k.scope.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.conflicts.is_empty()
    }

    /// Apply the pending edits of `scope` to `base`.
    pub fn apply_to(&self, scope: &Scope, base: &EnvMap) -> EnvMap {
        let mut env = base.clone();
        for update in self.updates_for(scope) {
            match &update.target {
                Some(cell) => env.insert(update.key.entry_key.clone(), cell.clone()),
                None => env.remove(&update.key.entry_key),
            };
        }
        env
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Record an edit.
    ///
    /// `base` and `base_version` describe the authoritative cell the edit was
    /// made against; they are only recorded for the first edit of a key. An
    /// edit back to the recorded base removes the pending entry.
    pub fn edit(
        &mut self,
        key: PendingKey,
        target: Option<EnvCell>,
        base: Option<EnvCell>,
        base_version: u64,
        now: i64,
    ) -> Result<()> {
        self.ensure_editable(&key.scope)?;
        if self.conflicts.contains_key(&key) {
            return Err(SyncError::UnresolvedConflict(key));
        }

        let update = match self.updates.remove(&key) {
            Some(mut existing) => {
                existing.target = target;
                existing
            }
            None => PendingEnvUpdate {
                key: key.clone(),
                base,
                target,
                base_version,
                created_at: now,
            },
        };

        if update.is_noop() {
            tracing::debug!(%key, "edit returned to base, dropping");
        } else {
            self.updates.insert(key, update);
        }
        Ok(())
    }

    /// Discard pending edits of a scope, or only the named keys. Returns the
    /// number removed.
    pub fn reset(&mut self, scope: &Scope, entry_keys: Option<&[String]>) -> Result<usize> {
        self.ensure_editable(scope)?;
        let before = self.updates.len();
        self.updates.retain(|k, _| {
            &k.scope != scope || entry_keys.is_some_and(|keys| !keys.contains(&k.entry_key))
        });
        Ok(before - self.updates.len())
    }

    /// Move dirty scopes to `Committing` and return their edits. Clean scopes
    /// in `scopes` are ignored.
    pub fn begin_commit(&mut self, scopes: &[Scope]) -> Result<Vec<PendingEnvUpdate>> {
        for scope in scopes {
            if self.committing.contains(scope) {
                return Err(SyncError::ScopeCommitting(scope.clone()));
            }
        }
        let mut batch = Vec::new();
        for scope in scopes {
            let updates: Vec<PendingEnvUpdate> = self.updates_for(scope).cloned().collect();
            if updates.is_empty() {
                continue;
            }
            self.committing.insert(scope.clone());
            batch.extend(updates);
        }
        Ok(batch)
    }

    /// Commit succeeded: clear the scopes' edits.
    pub fn finish_commit(&mut self, scopes: &[Scope]) {
        for scope in scopes {
            if self.committing.remove(scope) {
                self.updates.retain(|k, _| &k.scope != scope);
            }
        }
    }

    /// Commit failed: return the scopes to `Dirty` with edits intact.
    pub fn fail_commit(&mut self, scopes: &[Scope]) {
        for scope in scopes {
            self.committing.remove(scope);
        }
    }

    /// Compare every edit and conflict with fresh authoritative state.
    pub fn reconcile(&mut self, auth: &Authoritative<'_>, now: i64) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let keys: Vec<PendingKey> = self.updates.keys().cloned().collect();
        for key in keys {
            if self.committing.contains(&key.scope) {
                report.still_pending += 1;
                continue;
            }
            if !auth.scope_is_live(&key.scope) {
                self.updates.remove(&key);
                tracing::info!(%key, "pruned pending edit for deleted scope");
                report.pruned_stale.push(key);
                continue;
            }
            let Some(current_env) = auth.current(&key.scope) else {
                report.still_pending += 1;
                continue;
            };
            let current = current_env.get(&key.entry_key).cloned();

            let (base_matches, target_matches, base_was_value) = match self.updates.get(&key) {
                Some(update) => (
                    current == update.base,
                    current == update.target,
                    update.base.is_some(),
                ),
                None => continue,
            };
            if base_matches {
                report.still_pending += 1;
            } else if target_matches {
                self.updates.remove(&key);
                tracing::debug!(%key, "pending edit already authoritative, dropping");
                report.dropped_noops.push(key);
            } else if base_was_value && current.is_none() {
                self.updates.remove(&key);
                tracing::info!(%key, "pruned pending edit for deleted key");
                report.pruned_stale.push(key);
            } else if let Some(update) = self.updates.remove(&key) {
                let conflict = Conflict {
                    key: key.clone(),
                    base: update.base,
                    local_target: update.target,
                    authoritative: current,
                    authoritative_version: auth.version(&key.scope),
                    detected_at: now,
                };
                tracing::warn!(%key, version = conflict.authoritative_version, "conflict raised");
                self.conflicts.insert(key, conflict.clone());
                report.conflicts.push(conflict);
            }
        }

        let stale: Vec<PendingKey> = self
            .conflicts
            .keys()
            .filter(|k| !auth.scope_is_live(&k.scope))
            .cloned()
            .collect();
        for key in stale {
            self.conflicts.remove(&key);
            tracing::info!(%key, "pruned conflict for deleted scope");
            report.pruned_stale.push(key);
        }

        tracing::debug!(
            still_pending = report.still_pending,
            dropped = report.dropped_noops.len(),
            conflicts = report.conflicts.len(),
            pruned = report.pruned_stale.len(),
            "reconciled pending edits"
        );
        report
    }

    /// Settle a conflict. `KeepLocal` returns the re-queued edit, or `None`
    /// when the authoritative value already equals the local target.
    pub fn resolve_conflict(
        &mut self,
        key: &PendingKey,
        resolution: Resolution,
        now: i64,
    ) -> Result<Option<PendingEnvUpdate>> {
        self.ensure_editable(&key.scope)?;
        let conflict = self
            .conflicts
            .remove(key)
            .ok_or_else(|| SyncError::NoSuchConflict(key.clone()))?;

        match resolution {
            Resolution::KeepRemote => {
                tracing::debug!(%key, "conflict resolved keeping remote");
                Ok(None)
            }
            Resolution::KeepLocal => {
                let update = PendingEnvUpdate {
                    key: key.clone(),
                    base: conflict.authoritative,
                    target: conflict.local_target,
                    base_version: conflict.authoritative_version,
                    created_at: now,
                };
                tracing::debug!(%key, "conflict resolved keeping local");
                if update.is_noop() {
                    return Ok(None);
                }
                self.updates.insert(key.clone(), update.clone());
                Ok(Some(update))
            }
        }
    }

    fn ensure_editable(&self, scope: &Scope) -> Result<()> {
        if self.committing.contains(scope) {
            return Err(SyncError::ScopeCommitting(scope.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envsync_core::{
        ChangesetHeader, EnvParent, EnvParentKind, Environment, GraphObject, Keyholder,
        KeyholderKind, ObjectMeta,
    };

    fn graph(version: u64) -> OrgGraph {
        let mut objects = vec![
            GraphObject::EnvParent(EnvParent {
                meta: ObjectMeta::new("payments", 0),
                kind: EnvParentKind::App,
                name: "Payments".into(),
                envs_updated_at: None,
                locals_updated_at: Default::default(),
            }),
            GraphObject::Environment(Environment {
                meta: ObjectMeta::new("development", 0),
                env_parent_id: "payments".into(),
                environment_role_id: "role-dev".into(),
                is_sub: false,
                parent_environment_id: None,
                sub_name: None,
            }),
            GraphObject::Keyholder(Keyholder {
                meta: ObjectMeta::new("alice", 0),
                kind: KeyholderKind::User {
                    org_role_id: "basic".into(),
                    email: "alice@example.com".into(),
                },
                pubkey: None,
                signed_by_id: None,
                signature: None,
            }),
        ];
        for v in 1..=version {
            objects.push(GraphObject::ChangesetHeader(ChangesetHeader {
                meta: ObjectMeta::new(format!("cs-{}", v), 0),
                env_parent_id: "payments".into(),
                scope: dev(),
                version: v,
                created_by_id: "bob".into(),
            }));
        }
        OrgGraph::from_objects(objects)
    }

    fn dev() -> Scope {
        Scope::environment("development")
    }

    fn key(entry: &str) -> PendingKey {
        PendingKey::new("payments", dev(), entry)
    }

    fn val(v: &str) -> Option<EnvCell> {
        Some(EnvCell::value(v))
    }

    fn envs(pairs: &[(&str, &str)]) -> BTreeMap<Scope, EnvMap> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), EnvCell::value(*v)))
            .collect();
        BTreeMap::from([(dev(), map)])
    }

    fn edited(entry: &str, base: &str, target: &str) -> PendingChanges {
        let mut pending = PendingChanges::new();
        pending.edit(key(entry), val(target), val(base), 1, 0).unwrap();
        pending
    }

    #[test]
    fn test_edit_keeps_first_base_and_drops_return_to_base() {
        let mut pending = PendingChanges::new();
        pending.edit(key("A"), val("2"), val("1"), 1, 0).unwrap();
        pending.edit(key("A"), val("3"), val("2"), 2, 0).unwrap();
        assert_eq!(pending.get(&key("A")).unwrap().base, val("1"));
        assert_eq!(pending.state(&dev()), ScopeState::Dirty);

        pending.edit(key("A"), val("1"), val("3"), 2, 0).unwrap();
        assert!(pending.get(&key("A")).is_none());
        assert_eq!(pending.state(&dev()), ScopeState::Clean);
    }

    #[test]
    fn test_unchanged_base_stays_pending() {
        let mut pending = edited("A", "1", "2");
        let e = envs(&[("A", "1")]);
        let report = pending.reconcile(&Authoritative { graph: &graph(1), envs: &e }, 5);
        assert_eq!(report.still_pending, 1);
        assert!(pending.get(&key("A")).is_some());
    }

    #[test]
    fn test_same_target_dropped() {
        let mut pending = edited("A", "1", "2");
        let e = envs(&[("A", "2")]);
        let report = pending.reconcile(&Authoritative { graph: &graph(2), envs: &e }, 5);
        assert_eq!(report.dropped_noops, vec![key("A")]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_different_value_conflicts() {
        let mut pending = edited("STRIPE_KEY", "sk_old", "sk_alice");
        let e = envs(&[("STRIPE_KEY", "sk_bob")]);
        let report = pending.reconcile(&Authoritative { graph: &graph(2), envs: &e }, 5);

        assert_eq!(report.conflicts.len(), 1);
        let conflict = &report.conflicts[0];
        assert_eq!(conflict.local_target, val("sk_alice"));
        assert_eq!(conflict.authoritative, val("sk_bob"));
        assert_eq!(conflict.authoritative_version, 2);
        assert!(pending.get(&key("STRIPE_KEY")).is_none());
        assert_eq!(pending.conflicts().count(), 1);

        // editing a conflicted key is refused until resolved
        assert!(matches!(
            pending.edit(key("STRIPE_KEY"), val("x"), None, 2, 6),
            Err(SyncError::UnresolvedConflict(_))
        ));
    }

    #[test]
    fn test_deleted_key_pruned() {
        let mut pending = edited("A", "1", "2");
        let e = envs(&[]);
        let report = pending.reconcile(&Authoritative { graph: &graph(2), envs: &e }, 5);
        assert_eq!(report.pruned_stale, vec![key("A")]);
        assert!(report.conflicts.is_empty());
    }

    #[test]
    fn test_deleted_scope_pruned() {
        let mut pending = edited("A", "1", "2");
        let mut g = graph(1);
        g.tombstone(&"development".into(), 9).unwrap();
        let e = BTreeMap::new();
        let report = pending.reconcile(&Authoritative { graph: &g, envs: &e }, 5);
        assert_eq!(report.pruned_stale, vec![key("A")]);
    }

    #[test]
    fn test_unreadable_scope_left_alone() {
        let mut pending = edited("A", "1", "2");
        let e = BTreeMap::new();
        let report = pending.reconcile(&Authoritative { graph: &graph(3), envs: &e }, 5);
        assert_eq!(report.still_pending, 1);
    }

    #[test]
    fn test_commit_lifecycle() {
        let mut pending = edited("A", "1", "2");
        let batch = pending.begin_commit(&[dev(), Scope::environment("other")]).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(pending.state(&dev()), ScopeState::Committing);
        assert_eq!(pending.state(&Scope::environment("other")), ScopeState::Clean);

        assert!(matches!(
            pending.edit(key("B"), val("x"), None, 1, 0),
            Err(SyncError::ScopeCommitting(_))
        ));
        assert!(pending.reset(&dev(), None).is_err());

        pending.fail_commit(&[dev()]);
        assert_eq!(pending.state(&dev()), ScopeState::Dirty);

        pending.begin_commit(&[dev()]).unwrap();
        pending.finish_commit(&[dev()]);
        assert_eq!(pending.state(&dev()), ScopeState::Clean);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_reset_selected_keys() {
        let mut pending = edited("A", "1", "2");
        pending.edit(key("B"), val("9"), None, 1, 0).unwrap();
        assert_eq!(pending.reset(&dev(), Some(&["A".to_string()])).unwrap(), 1);
        assert!(pending.get(&key("B")).is_some());
        assert_eq!(pending.reset(&dev(), None).unwrap(), 1);
    }

    #[test]
    fn test_resolve_keep_local_requeues_against_authoritative() {
        let mut pending = edited("K", "a", "b");
        let e = envs(&[("K", "c")]);
        pending.reconcile(&Authoritative { graph: &graph(2), envs: &e }, 5);

        let requeued = pending.resolve_conflict(&key("K"), Resolution::KeepLocal, 6).unwrap().unwrap();
        assert_eq!(requeued.base, val("c"));
        assert_eq!(requeued.target, val("b"));
        assert_eq!(requeued.base_version, 2);
        assert_eq!(pending.conflicts().count(), 0);

        assert!(matches!(
            pending.resolve_conflict(&key("K"), Resolution::KeepRemote, 7),
            Err(SyncError::NoSuchConflict(_))
        ));
    }

    #[test]
    fn test_resolve_keep_remote_discards() {
        let mut pending = edited("K", "a", "b");
        let e = envs(&[("K", "c")]);
        pending.reconcile(&Authoritative { graph: &graph(2), envs: &e }, 5);
        assert!(pending.resolve_conflict(&key("K"), Resolution::KeepRemote, 6).unwrap().is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_apply_to() {
        let mut pending = edited("A", "1", "2");
        pending.edit(key("B"), None, val("x"), 1, 0).unwrap();
        let base = envs(&[("A", "1"), ("B", "x")]).remove(&dev()).unwrap();
        let applied = pending.apply_to(&dev(), &base);
        assert_eq!(applied.get("A"), val("2").as_ref());
        assert!(!applied.contains_key("B"));
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = envsync_store::MemoryStore::new();
        let mut pending = edited("A", "1", "2");
        let e = envs(&[("A", "3")]);
        pending.edit(key("B"), val("y"), None, 1, 0).unwrap();
        pending.reconcile(&Authoritative { graph: &graph(2), envs: &e }, 5);
        pending.persist(&store).await.unwrap();

        let loaded = PendingChanges::load(&store).await.unwrap();
        assert_eq!(loaded.updates().count(), 1);
        assert_eq!(loaded.conflicts().count(), 1);
    }
}
