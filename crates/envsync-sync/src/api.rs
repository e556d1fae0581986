//! Storage/transport API consumed by the client.
//!
//! The server only ever sees the org graph, sealed envelopes, and encrypted
//! blobs. Every [`UpdateRequest`] is applied atomically or rejected whole.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use envsync_core::{now_millis, GraphMutation, KeySet, KeyTriple, ObjectId, OrgGraph, Part, Permission, Scope};
use envsync_keyset::{required_for_keyholder, required_keyset};
use envsync_perms::{Blobs, EncryptedPayload, Envelope, PermissionResolver};

use crate::admission::authorize_mutation;
use crate::error::{Result, SyncError};

/// A scope write with the version it was based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetSubmission {
    pub scope: Scope,
    /// Authoritative version the new changeset builds on.
    pub base_version: u64,
}

/// One atomic write.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Keyholder performing the write.
    pub submitter_id: ObjectId,
    pub mutation: Option<GraphMutation>,
    /// Envelopes to add or replace.
    pub envelopes: Vec<Envelope>,
    /// Envelope triples to delete.
    pub deleted: KeySet,
    /// Blobs to add or replace.
    pub blobs: Blobs,
    pub changesets: Vec<ChangesetSubmission>,
}

/// Authoritative state as visible to one keyholder.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub graph: OrgGraph,
    /// Envelopes addressed to the keyholder.
    pub envelopes: Vec<Envelope>,
    /// Blobs for exactly the envelopes' (scope, part) addresses.
    pub blobs: Blobs,
    /// Current version per scope the keyholder holds envelopes for.
    pub versions: BTreeMap<Scope, u64>,
}

/// Server interface.
#[async_trait]
pub trait Api: Send + Sync {
    /// Everything currently addressed to `keyholder_id`.
    async fn fetch(&self, keyholder_id: &ObjectId) -> Result<FetchResponse>;

    /// Apply `request` atomically, then return the submitter's fresh view.
    async fn submit(&self, request: UpdateRequest) -> Result<FetchResponse>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory server
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ServerState {
    graph: OrgGraph,
    envelopes: BTreeMap<KeyTriple, Envelope>,
    blobs: Blobs,
}

/// In-memory authoritative server.
///
/// Enforces optimistic concurrency per scope, write permission on every
/// submitted scope, authorization of every graph change, and that every
/// stored envelope is one the resulting graph actually requires. Envelopes
/// the graph stops requiring are dropped on the next write and never served.
pub struct MemoryApi {
    state: RwLock<ServerState>,
    clock: Arc<dyn Fn() -> i64 + Send + Sync>,
    max_envelopes: Option<usize>,
}

impl MemoryApi {
    /// A server seeded with an initial graph.
    pub fn new(graph: OrgGraph) -> Self {
        Self {
            state: RwLock::new(ServerState {
                graph,
                ..Default::default()
            }),
            clock: Arc::new(now_millis),
            max_envelopes: None,
        }
    }

    /// Use a custom clock for tombstones and expiry checks.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Reject requests carrying more than `limit` envelopes.
    pub fn with_max_envelopes(mut self, limit: usize) -> Self {
        self.max_envelopes = Some(limit);
        self
    }

    /// A copy of the authoritative graph.
    pub async fn graph(&self) -> OrgGraph {
        self.state.read().await.graph.clone()
    }

    /// Every stored envelope triple.
    pub async fn stored_keyset(&self) -> KeySet {
        self.state.read().await.envelopes.keys().cloned().collect()
    }

    /// The stored blob at an address.
    pub async fn blob(&self, scope: &Scope, part: &Part) -> Option<EncryptedPayload> {
        self.state
            .read()
            .await
            .blobs
            .get(&(scope.clone(), part.clone()))
            .cloned()
    }

    fn view(state: &ServerState, keyholder_id: &ObjectId, now: i64) -> FetchResponse {
        let required = required_for_keyholder(&state.graph, keyholder_id, now);
        let envelopes: Vec<Envelope> = state
            .envelopes
            .values()
            .filter(|e| &e.recipient_id == keyholder_id && required.contains_triple(&e.triple()))
            .cloned()
            .collect();
        let mut blobs = Blobs::new();
        let mut versions = BTreeMap::new();
        for envelope in &envelopes {
            let address = (envelope.scope.clone(), envelope.part.clone());
            if let Some(blob) = state.blobs.get(&address) {
                blobs.insert(address, blob.clone());
            }
            versions
                .entry(envelope.scope.clone())
                .or_insert_with(|| state.graph.scope_version(&envelope.scope));
        }
        FetchResponse {
            graph: state.graph.clone(),
            envelopes,
            blobs,
            versions,
        }
    }

    /// Check a request against current state. Returns the next graph and
    /// the keyset it requires.
    fn validate(&self, state: &ServerState, request: &UpdateRequest, now: i64) -> Result<(OrgGraph, KeySet)> {
        if let Some(limit) = self.max_envelopes {
            if request.envelopes.len() > limit {
                return Err(SyncError::RequestTooLarge {
                    count: request.envelopes.len(),
                    limit,
                });
            }
        }
        if state.graph.keyholder(&request.submitter_id).is_none() {
            return Err(SyncError::Rejected(format!(
                "unknown submitter {}",
                request.submitter_id
            )));
        }

        let resolver = PermissionResolver::new(&state.graph);
        for submission in &request.changesets {
            resolver.require(
                &submission.scope.to_string(),
                &request.submitter_id,
                Permission::Write,
            )?;
            let actual = state.graph.scope_version(&submission.scope);
            if actual != submission.base_version {
                return Err(SyncError::VersionConflict {
                    scope: submission.scope.clone(),
                    expected: submission.base_version,
                    actual,
                });
            }
        }

        let next = match &request.mutation {
            Some(mutation) => {
                let next = state.graph.apply(mutation, now)?;
                authorize_mutation(&state.graph, &next, mutation, request, now)?;
                next
            }
            None => state.graph.clone(),
        };

        for submission in &request.changesets {
            let expected = submission.base_version + 1;
            if next.scope_version(&submission.scope) != expected {
                return Err(SyncError::Rejected(format!(
                    "submission for {} does not announce version {}",
                    submission.scope, expected
                )));
            }
        }

        let required = required_keyset(&next, now);
        for envelope in &request.envelopes {
            if !required.contains_triple(&envelope.triple()) {
                return Err(SyncError::Rejected(format!(
                    "envelope {} is not required by the resulting graph",
                    envelope.triple()
                )));
            }
            let address = (envelope.scope.clone(), envelope.part.clone());
            if !request.blobs.contains_key(&address) && !state.blobs.contains_key(&address) {
                return Err(SyncError::Rejected(format!(
                    "envelope {} has no blob",
                    envelope.triple()
                )));
            }
        }
        Ok((next, required))
    }
}

#[async_trait]
impl Api for MemoryApi {
    async fn fetch(&self, keyholder_id: &ObjectId) -> Result<FetchResponse> {
        let now = (self.clock)();
        let state = self.state.read().await;
        Ok(Self::view(&state, keyholder_id, now))
    }

    async fn submit(&self, request: UpdateRequest) -> Result<FetchResponse> {
        let now = (self.clock)();
        let mut state = self.state.write().await;

        let (next, required) = match self.validate(&state, &request, now) {
            Ok(validated) => validated,
            Err(e) => {
                tracing::debug!(submitter = %request.submitter_id, error = %e, "rejected update");
                return Err(e);
            }
        };

        state.graph = next;
        for triple in request.deleted.triples() {
            state.envelopes.remove(&triple);
        }
        for envelope in request.envelopes {
            state.envelopes.insert(envelope.triple(), envelope);
        }
        state.blobs.extend(request.blobs);

        let before = state.envelopes.len();
        state.envelopes.retain(|triple, _| required.contains_triple(triple));
        let pruned = before - state.envelopes.len();

        tracing::debug!(
            submitter = %request.submitter_id,
            changesets = request.changesets.len(),
            envelopes = state.envelopes.len(),
            pruned,
            "applied update"
        );
        Ok(Self::view(&state, &request.submitter_id, now))
    }
}
