//! Store trait: the abstract interface for client-local persistence.
//!
//! Only data that survives a restart lives here: uncommitted edits, the
//! conflicts they raised, pinned trust roots, and the last authoritative org
//! graph. Decrypted authoritative values are never persisted.

use async_trait::async_trait;
use envsync_core::{Conflict, ObjectId, OrgGraph, PendingEnvUpdate, PendingKey, PublicKeyBundle, TrustedRoots};

use crate::error::Result;

/// The Store trait: async interface for local persistence.
///
/// Records are keyed by [`PendingKey::storage_key`], and list operations
/// return them in that key's order.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Pending Updates
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace a pending update.
    async fn put_pending(&self, update: &PendingEnvUpdate) -> Result<()>;

    /// Remove a pending update. Returns whether it existed.
    async fn remove_pending(&self, key: &PendingKey) -> Result<bool>;

    /// All pending updates.
    async fn list_pending(&self) -> Result<Vec<PendingEnvUpdate>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Conflicts
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace a conflict.
    async fn put_conflict(&self, conflict: &Conflict) -> Result<()>;

    /// Remove a conflict. Returns whether it existed.
    async fn remove_conflict(&self, key: &PendingKey) -> Result<bool>;

    /// All unresolved conflicts.
    async fn list_conflicts(&self) -> Result<Vec<Conflict>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Trust Roots
    // ─────────────────────────────────────────────────────────────────────────

    /// Pin a root keyholder's public key, replacing any earlier pin.
    async fn put_trusted_root(&self, keyholder_id: &ObjectId, pubkey: &PublicKeyBundle) -> Result<()>;

    /// All pinned roots.
    async fn trusted_roots(&self) -> Result<TrustedRoots>;

    // ─────────────────────────────────────────────────────────────────────────
    // Graph Snapshot
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace the cached authoritative graph.
    async fn put_graph(&self, graph: &OrgGraph) -> Result<()>;

    /// The cached authoritative graph, if one was saved.
    async fn get_graph(&self) -> Result<Option<OrgGraph>>;
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    /// Make the persisted pending updates and conflicts exactly match the
    /// given lists.
    fn sync_pending_state(
        &self,
        pending: &[PendingEnvUpdate],
        conflicts: &[Conflict],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

impl<S: Store + ?Sized> StoreExt for S {
    async fn sync_pending_state(&self, pending: &[PendingEnvUpdate], conflicts: &[Conflict]) -> Result<()> {
        for stale in self.list_pending().await? {
            if !pending.iter().any(|p| p.key == stale.key) {
                self.remove_pending(&stale.key).await?;
            }
        }
        for update in pending {
            self.put_pending(update).await?;
        }

        for stale in self.list_conflicts().await? {
            if !conflicts.iter().any(|c| c.key == stale.key) {
                self.remove_conflict(&stale.key).await?;
            }
        }
        for conflict in conflicts {
            self.put_conflict(conflict).await?;
        }

        tracing::debug!(
            pending = pending.len(),
            conflicts = conflicts.len(),
            "persisted pending state"
        );
        Ok(())
    }
}
