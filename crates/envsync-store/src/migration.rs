//! SQLite schema, versioned.
//!
//! `user_version` holds the applied version; each step runs in the same
//! transaction that bumps it.

use rusqlite::{Connection, Transaction};

use crate::error::{Result, StoreError};

pub const CURRENT_VERSION: u32 = 1;

/// Schema steps, indexed by `version - 1`.
const STEPS: &[&str] = &[r#"
    -- Uncommitted local edits, keyed envParentId/scope/entryKey
    CREATE TABLE pending_updates (
        storage_key TEXT PRIMARY KEY,
        scope TEXT NOT NULL,
        record BLOB NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX idx_pending_scope ON pending_updates(scope);

    CREATE TABLE conflicts (
        storage_key TEXT PRIMARY KEY,
        scope TEXT NOT NULL,
        record BLOB NOT NULL,
        detected_at INTEGER NOT NULL
    );
    CREATE INDEX idx_conflicts_scope ON conflicts(scope);

    CREATE TABLE trusted_roots (
        keyholder_id TEXT PRIMARY KEY,
        pubkey BLOB NOT NULL,
        pinned_at INTEGER NOT NULL
    );

    -- Single row
    CREATE TABLE graph_snapshot (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        graph BLOB NOT NULL,
        saved_at INTEGER NOT NULL
    );
"#];

fn schema_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the schema up to [`CURRENT_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let found = schema_version(conn)?;
    if found > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "schema v{} was written by a newer envsync (this build knows v{})",
            found, CURRENT_VERSION
        )));
    }

    for version in found + 1..=CURRENT_VERSION {
        let tx = conn.transaction()?;
        step(&tx, version)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        tracing::info!(version, "migrated envsync store");
    }
    Ok(())
}

fn step(tx: &Transaction<'_>, version: u32) -> Result<()> {
    let sql = STEPS
        .get(version as usize - 1)
        .ok_or_else(|| StoreError::Migration(format!("no step for v{}", version)))?;
    tx.execute_batch(sql)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn
    }

    #[test]
    fn test_fresh_database_gets_every_table() {
        let conn = migrated();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|name| name.unwrap())
            .collect();

        for table in ["pending_updates", "conflicts", "trusted_roots", "graph_snapshot"] {
            assert!(tables.iter().any(|t| t == table), "missing {}", table);
        }
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_rerun_is_noop() {
        let mut conn = migrated();
        migrate(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let mut conn = migrated();
        conn.pragma_update(None, "user_version", CURRENT_VERSION + 1).unwrap();
        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }
}
