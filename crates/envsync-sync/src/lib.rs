//! # envsync sync
//!
//! Versioned history, local edit reconciliation, and the server boundary.
//!
//! ## Overview
//!
//! - [`Changeset`]s are the strictly ordered history of one scope;
//!   [`replay`] rebuilds any version and [`version_state_hash`] lets two
//!   replicas compare histories.
//! - [`PendingChanges`] is the per-scope edit state machine. It never merges:
//!   an edit whose base moved to a different value becomes a [`Conflict`].
//! - [`Api`] is the atomic-or-rejected server interface; [`MemoryApi`] is
//!   the in-process reference server.
//!
//! ## Commit Flow
//!
//! ```text
//! Client                                   Server
//!   | begin_commit (scopes -> Committing)    |
//!   | build changesets, rotate data keys     |
//!   | seal blobs + envelopes                 |
//!   |------ UpdateRequest ------------------>|
//!   |        (base versions checked)         |
//!   |<----- FetchResponse / VersionConflict -|
//!   | finish_commit | fail_commit            |
//! ```
//!
//! [`Conflict`]: envsync_core::Conflict

mod admission;
pub mod api;
pub mod changeset;
pub mod config;
pub mod convergence;
pub mod error;
pub mod pending;

pub use api::{Api, ChangesetSubmission, FetchResponse, MemoryApi, UpdateRequest};
pub use changeset::{ordered, replay, Changeset};
pub use config::{with_timeout, SyncConfig};
pub use convergence::{verify_convergence, version_state_hash, ConvergenceResult};
pub use error::{Result, SyncError};
pub use pending::{Authoritative, PendingChanges, ReconcileReport, Resolution, ScopeState};
