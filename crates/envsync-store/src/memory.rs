//! In-memory implementation of the Store trait.
//!
//! Same semantics as SQLite with no persistence. Used by tests and by
//! clients configured not to persist pending edits.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use envsync_core::{Conflict, ObjectId, OrgGraph, PendingEnvUpdate, PendingKey, PublicKeyBundle, TrustedRoots};

use crate::error::{Result, StoreError};
use crate::traits::Store;

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Pending updates by storage key.
    pending: BTreeMap<String, PendingEnvUpdate>,

    /// Conflicts by storage key.
    conflicts: BTreeMap<String, Conflict>,

    roots: TrustedRoots,

    graph: Option<OrgGraph>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner.read().map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner.write().map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_pending(&self, update: &PendingEnvUpdate) -> Result<()> {
        self.write()?
            .pending
            .insert(update.key.storage_key(), update.clone());
        Ok(())
    }

    async fn remove_pending(&self, key: &PendingKey) -> Result<bool> {
        Ok(self.write()?.pending.remove(&key.storage_key()).is_some())
    }

    async fn list_pending(&self) -> Result<Vec<PendingEnvUpdate>> {
        Ok(self.read()?.pending.values().cloned().collect())
    }

    async fn put_conflict(&self, conflict: &Conflict) -> Result<()> {
        self.write()?
            .conflicts
            .insert(conflict.key.storage_key(), conflict.clone());
        Ok(())
    }

    async fn remove_conflict(&self, key: &PendingKey) -> Result<bool> {
        Ok(self.write()?.conflicts.remove(&key.storage_key()).is_some())
    }

    async fn list_conflicts(&self) -> Result<Vec<Conflict>> {
        Ok(self.read()?.conflicts.values().cloned().collect())
    }

    async fn put_trusted_root(&self, keyholder_id: &ObjectId, pubkey: &PublicKeyBundle) -> Result<()> {
        self.write()?.roots.insert(keyholder_id.clone(), *pubkey);
        Ok(())
    }

    async fn trusted_roots(&self) -> Result<TrustedRoots> {
        Ok(self.read()?.roots.clone())
    }

    async fn put_graph(&self, graph: &OrgGraph) -> Result<()> {
        self.write()?.graph = Some(graph.clone());
        Ok(())
    }

    async fn get_graph(&self) -> Result<Option<OrgGraph>> {
        Ok(self.read()?.graph.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use envsync_core::{EnvCell, Scope};

    fn update(entry: &str, target: &str) -> PendingEnvUpdate {
        PendingEnvUpdate {
            key: PendingKey::new("payments", Scope::environment("development"), entry),
            base: None,
            target: Some(EnvCell::value(target)),
            base_version: 0,
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn test_memory_store_pending() {
        let store = MemoryStore::new();
        store.put_pending(&update("B", "2")).await.unwrap();
        store.put_pending(&update("A", "1")).await.unwrap();
        store.put_pending(&update("A", "3")).await.unwrap();

        let listed = store.list_pending().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key.entry_key, "A");
        assert_eq!(listed[0].target, Some(EnvCell::value("3")));

        assert!(store.remove_pending(&listed[0].key).await.unwrap());
        assert!(!store.remove_pending(&listed[0].key).await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_pending_state_replaces_contents() {
        let store = MemoryStore::new();
        store.put_pending(&update("OLD", "x")).await.unwrap();

        let keep = vec![update("NEW", "y")];
        store.sync_pending_state(&keep, &[]).await.unwrap();

        let listed = store.list_pending().await.unwrap();
        assert_eq!(listed, keep);
        assert!(store.list_conflicts().await.unwrap().is_empty());
    }
}
