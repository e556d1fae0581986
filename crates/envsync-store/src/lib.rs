//! # envsync store
//!
//! Client-local persistence behind the [`Store`] trait.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests and ephemeral clients
//!
//! ## Usage
//!
//! ```rust,no_run
//! use envsync_store::{SqliteStore, Store};
//!
//! async fn example() {
//!     let store = SqliteStore::open("envsync.db").unwrap();
//!     let pending = store.list_pending().await.unwrap();
//!     println!("{} uncommitted edits", pending.len());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - Pending edits and conflicts are persisted after every state transition,
//!   so a restart never loses an uncommitted edit or hides a conflict.
//! - Pending records carry the user's own plaintext edits; fetched values
//!   are never written here, only the org graph and pinned root pubkeys.

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{Store, StoreExt};
