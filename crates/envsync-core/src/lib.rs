//! # envsync core
//!
//! Pure data model for the envsync keyset engine: the org graph, scopes and
//! parts, the KeySet shape, permissions, environment cells, and pending-edit
//! records.
//!
//! This crate contains no I/O and no async code. Everything here is plain
//! data plus deterministic functions over it.
//!
//! ## Key Types
//!
//! - [`OrgGraph`] - Tombstone-only id → object arena
//! - [`Scope`] / [`Part`] - What an envelope unlocks
//! - [`KeySet`] - Ordered recipient → scope → parts requirement map
//! - [`Permission`] - Org, env-parent, and environment permissions
//! - [`EnvCell`] - One key's value in an environment
//! - [`PendingEnvUpdate`] / [`Conflict`] - Local edit bookkeeping
//!
//! ## Canonicalization
//!
//! Signed pubkeys and hashed changeset actions use deterministic CBOR. See
//! the [`canonical`] module.

pub mod canonical;
pub mod crypto;
pub mod env;
pub mod error;
pub mod graph;
pub mod keyset;
pub mod model;
pub mod pending;
pub mod permission;
pub mod scope;
pub mod types;

pub use canonical::{action_bytes, pubkey_signing_bytes};
pub use crypto::{
    Blake3Hash, Ed25519PublicKey, Ed25519Signature, PublicKeyBundle, SigningKeypair, TrustedRoots,
    X25519PublicKey,
};
pub use env::{diff_env, inherits_of, meta_of, CellMeta, ChangeAction, EnvCell, EnvMap, InheritsMap, MetaMap};
pub use error::{CoreError, Result};
pub use graph::{GraphMutation, OrgGraph};
pub use keyset::{KeySet, ScopeParts};
pub use model::{
    AppBlock, AppRole, AppRoleEnvironmentRole, AppUserGrant, ChangesetHeader, EnvParent,
    EnvParentKind, Environment, EnvironmentRole, GraphObject, InheritanceOverride,
    KeyableParent, KeyableParentKind, Keyholder, KeyholderKind, Org, OrgRole, RoleDefinition,
};
pub use pending::{Conflict, PendingEnvUpdate, PendingKey};
pub use permission::{Permission, PermissionSet, ScopeKind};
pub use scope::{KeyTriple, Part, Scope};
pub use types::{ObjectId, ObjectMeta};

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
