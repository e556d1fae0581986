//! SQLite implementation of the Store trait.
//!
//! The primary storage backend. Uses rusqlite with bundled SQLite; every
//! operation runs on `tokio::task::spawn_blocking`. Records are stored as
//! CBOR blobs next to the columns queries filter on.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use envsync_core::{now_millis, Conflict, ObjectId, OrgGraph, PendingEnvUpdate, PendingKey, PublicKeyBundle, TrustedRoots};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::Store;

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path, creating and migrating it
    /// as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))?
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_all<T: DeserializeOwned>(blobs: Vec<Vec<u8>>) -> Result<Vec<T>> {
    blobs.iter().map(|b| decode(b)).collect()
}

/// All `record` blobs of a keyed table, in storage-key order.
fn records(conn: &Connection, table: &str) -> Result<Vec<Vec<u8>>> {
    let mut stmt = conn.prepare(&format!("SELECT record FROM {} ORDER BY storage_key", table))?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
    Ok(rows)
}

#[async_trait]
impl Store for SqliteStore {
    async fn put_pending(&self, update: &PendingEnvUpdate) -> Result<()> {
        let key = update.key.storage_key();
        let scope = update.key.scope.to_string();
        let record = encode(update)?;
        let created_at = update.created_at;

        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO pending_updates (storage_key, scope, record, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, scope, record, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_pending(&self, key: &PendingKey) -> Result<bool> {
        let key = key.storage_key();
        self.blocking(move |conn| {
            let n = conn.execute("DELETE FROM pending_updates WHERE storage_key = ?1", params![key])?;
            Ok(n > 0)
        })
        .await
    }

    async fn list_pending(&self) -> Result<Vec<PendingEnvUpdate>> {
        let blobs = self.blocking(|conn| records(conn, "pending_updates")).await?;
        decode_all(blobs)
    }

    async fn put_conflict(&self, conflict: &Conflict) -> Result<()> {
        let key = conflict.key.storage_key();
        let scope = conflict.key.scope.to_string();
        let record = encode(conflict)?;
        let detected_at = conflict.detected_at;

        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO conflicts (storage_key, scope, record, detected_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, scope, record, detected_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_conflict(&self, key: &PendingKey) -> Result<bool> {
        let key = key.storage_key();
        self.blocking(move |conn| {
            let n = conn.execute("DELETE FROM conflicts WHERE storage_key = ?1", params![key])?;
            Ok(n > 0)
        })
        .await
    }

    async fn list_conflicts(&self) -> Result<Vec<Conflict>> {
        let blobs = self.blocking(|conn| records(conn, "conflicts")).await?;
        decode_all(blobs)
    }

    async fn put_trusted_root(&self, keyholder_id: &ObjectId, pubkey: &PublicKeyBundle) -> Result<()> {
        let id = keyholder_id.as_str().to_string();
        let pubkey = encode(pubkey)?;
        let now = now_millis();

        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO trusted_roots (keyholder_id, pubkey, pinned_at)
                 VALUES (?1, ?2, ?3)",
                params![id, pubkey, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn trusted_roots(&self) -> Result<TrustedRoots> {
        let rows: Vec<(String, Vec<u8>)> = self
            .blocking(|conn| {
                let mut stmt = conn.prepare("SELECT keyholder_id, pubkey FROM trusted_roots ORDER BY keyholder_id")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut roots = TrustedRoots::new();
        for (id, pubkey) in rows {
            roots.insert(ObjectId::new(id), decode(&pubkey)?);
        }
        Ok(roots)
    }

    async fn put_graph(&self, graph: &OrgGraph) -> Result<()> {
        let blob = encode(graph)?;
        let now = now_millis();

        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO graph_snapshot (id, graph, saved_at) VALUES (1, ?1, ?2)",
                params![blob, now],
            )?;
            Ok(())
        })
        .await?;
        tracing::debug!(objects = graph.len(), "saved graph snapshot");
        Ok(())
    }

    async fn get_graph(&self) -> Result<Option<OrgGraph>> {
        let blob: Option<Vec<u8>> = self
            .blocking(|conn| {
                Ok(conn
                    .query_row("SELECT graph FROM graph_snapshot WHERE id = 1", [], |row| row.get(0))
                    .optional()?)
            })
            .await?;
        blob.map(|b| decode(&b)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envsync_core::{EnvCell, GraphObject, ObjectMeta, Org, Scope, SigningKeypair, X25519PublicKey};

    fn conflict(entry: &str) -> Conflict {
        Conflict {
            key: PendingKey::new("payments", Scope::environment("development"), entry),
            base: Some(EnvCell::value("a")),
            local_target: Some(EnvCell::value("b")),
            authoritative: Some(EnvCell::value("c")),
            authoritative_version: 2,
            detected_at: 10,
        }
    }

    #[tokio::test]
    async fn test_pending_roundtrip_and_order() {
        let store = SqliteStore::open_memory().unwrap();
        for (entry, target) in [("Z", "1"), ("A", "2")] {
            store
                .put_pending(&PendingEnvUpdate {
                    key: PendingKey::new("payments", Scope::locals("payments", "alice"), entry),
                    base: None,
                    target: Some(EnvCell::value(target)),
                    base_version: 0,
                    created_at: 5,
                })
                .await
                .unwrap();
        }

        let listed = store.list_pending().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key.entry_key, "A");
        assert_eq!(listed[0].key.scope, Scope::locals("payments", "alice"));

        assert!(store.remove_pending(&listed[1].key).await.unwrap());
        assert_eq!(store.list_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicts() {
        let store = SqliteStore::open_memory().unwrap();
        store.put_conflict(&conflict("STRIPE_KEY")).await.unwrap();
        assert_eq!(store.list_conflicts().await.unwrap(), vec![conflict("STRIPE_KEY")]);
        assert!(store.remove_conflict(&conflict("STRIPE_KEY").key).await.unwrap());
        assert!(store.list_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("envsync.db");

        let signing = SigningKeypair::generate().public_key();
        let bundle = PublicKeyBundle {
            signing,
            encryption: X25519PublicKey([9; 32]),
        };
        let graph = OrgGraph::from_objects([GraphObject::Org(Org {
            meta: ObjectMeta::new("org", 1),
            name: "Acme".into(),
        })]);

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put_trusted_root(&"owner-device".into(), &bundle).await.unwrap();
            store.put_conflict(&conflict("K")).await.unwrap();
            store.put_graph(&graph).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let roots = store.trusted_roots().await.unwrap();
        assert!(roots.is_trusted(&"owner-device".into(), &bundle));
        assert_eq!(store.list_conflicts().await.unwrap().len(), 1);
        assert_eq!(store.get_graph().await.unwrap(), Some(graph));
    }

    #[tokio::test]
    async fn test_empty_graph_snapshot() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.get_graph().await.unwrap().is_none());
    }
}
