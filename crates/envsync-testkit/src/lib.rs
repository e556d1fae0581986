//! # envsync Testkit
//!
//! Testing utilities for envsync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: Known encodings of changeset actions and env cells
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: Org graphs with real, correctly signed keyholders
//!
//! It depends on the component crates only, never on `envsync` itself, so
//! the client's own tests can use it without pulling in a second copy of
//! the client types.
//!
//! ## Golden Vectors
//!
//! ```rust
//! use envsync_testkit::vectors::verify_all_vectors;
//!
//! for (name, passed, actual) in verify_all_vectors() {
//!     assert!(passed, "{}: {}", name, actual);
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use envsync_sync::replay;
//! use envsync_testkit::generators::History;
//!
//! proptest! {
//!     #[test]
//!     fn replay_reaches_every_snapshot(history: History) {
//!         for (n, snapshot) in history.snapshots.iter().enumerate() {
//!             let env = replay(&history.scope, &history.changesets, n as u64).unwrap();
//!             prop_assert_eq!(&env, snapshot);
//!         }
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust
//! use envsync_testkit::fixtures::{OrgFixture, APP_DEVELOPER, ORG_BASIC, PAYMENTS};
//!
//! let fixture = OrgFixture::payments()
//!     .with_user("alice", ORG_BASIC)
//!     .with_grant(PAYMENTS, "alice", APP_DEVELOPER);
//! let seed = fixture.seed("alice-laptop");
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{device_of, env_map, OrgFixture};
pub use generators::{history_from_snapshots, History};
pub use vectors::{action_vectors, cell_vectors, verify_all_vectors, ActionVector, CellVector};
