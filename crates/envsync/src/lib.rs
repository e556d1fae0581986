//! # envsync
//!
//! The client API for envsync: end-to-end encrypted environment variables,
//! shared across an org under role-based permissions.
//!
//! ## Overview
//!
//! The server only ever stores ciphertext. Every env is encrypted under a
//! data key, and every data key is wrapped once per keyholder allowed to
//! read it. This crate ties the pieces together:
//!
//! - **Graph**: Org, apps, blocks, environments, roles, and keyholders
//! - **Permissions**: Who may read, write, or manage which scope
//! - **Keysets**: Exactly which (recipient, scope, part) envelopes must exist
//! - **Sync**: Fetch, decrypt, stage edits, commit changesets, resolve conflicts
//!
//! ## Key Concepts
//!
//! - **Keyholder**: Anything with a public key: user device, CLI user,
//!   invite, device grant, or generated envkey.
//! - **Envelope**: A data key wrapped for one keyholder, signed by its sender.
//! - **Trust chain**: Every sender and recipient must chain by signatures
//!   to a pinned root before any envelope is opened or sealed.
//! - **Changeset**: One committed, versioned batch of edits to a scope.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use envsync::core::{EnvCell, OrgGraph, Scope, TrustedRoots};
//! use envsync::perms::NativeProvider;
//! use envsync::store::SqliteStore;
//! use envsync::sync::MemoryApi;
//! use envsync::{Client, ClientConfig, Session};
//!
//! async fn example(seed: [u8; 32], roots: TrustedRoots, graph: OrgGraph) {
//!     let session = Session::from_seed("device-1", &seed, roots);
//!     let api = Arc::new(MemoryApi::new(graph));
//!     let store = SqliteStore::open("envsync.db").unwrap();
//!
//!     let mut client = Client::open(session, api, NativeProvider, store, ClientConfig::default())
//!         .await
//!         .unwrap();
//!     client.refresh().await.unwrap();
//!
//!     let development = Scope::environment("development");
//!     client
//!         .edit(&development, "STRIPE_KEY", Some(EnvCell::value("sk_test_123")))
//!         .await
//!         .unwrap();
//!     client.commit(&[development]).await.unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `envsync::core` - Data model, graph, scopes, keysets
//! - `envsync::perms` - Permission resolution, trust chains, envelopes
//! - `envsync::keyset` - Required keyset and delta calculation
//! - `envsync::store` - Local storage abstraction and SQLite
//! - `envsync::sync` - Server API, changesets, pending edits

pub mod client;
pub mod config;
pub mod error;
pub mod mutation;
pub mod session;

// Re-export component crates
pub use envsync_core as core;
pub use envsync_keyset as keyset;
pub use envsync_perms as perms;
pub use envsync_store as store;
pub use envsync_sync as sync;

// Re-export main types for convenience
pub use client::{Client, CommitOutcome, ProposalOutcome};
pub use config::ClientConfig;
pub use error::{ClientError, ErrorCategory, Result};
pub use mutation::{BuildContext, BuiltMutation, IssuedKey, Mutation};
pub use session::{Clock, FixedClock, Session, SystemClock};

// Re-export commonly used core types
pub use envsync_core::{
    EnvCell, EnvMap, KeySet, KeyTriple, ObjectId, OrgGraph, Part, Permission, Scope, TrustedRoots,
};
pub use envsync_sync::{ReconcileReport, Resolution, ScopeState};
