//! The Client: one keyholder's view of the org and its encrypted envs.
//!
//! A client owns the single logical thread of graph mutation, keyset
//! calculation, and pending-edit bookkeeping for its session. Cryptographic
//! work fans out on the [`CryptoPool`]; everything else runs inline.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rand::RngCore;

use envsync_core::{
    inherits_of, meta_of, pubkey_signing_bytes, Blake3Hash, Conflict, EnvCell, EnvMap, EnvParent,
    GraphMutation, GraphObject, InheritsMap, KeySet, Keyholder, KeyholderKind, MetaMap, ObjectId,
    ObjectMeta, OrgGraph, Part, PendingEnvUpdate, PendingKey, Permission, Scope,
};
use envsync_keyset::{
    delta_for_mutation, onboarding_delta, required_for_keyholder, required_keyset, KeysetDelta,
    MutationDelta, RecipientChange,
};
use envsync_perms::{
    seal_blob, Blobs, CryptoPool, CryptoProvider, DataKeyring, DecryptedEnvs, Envelope,
    EnvelopeDecryptor, EnvelopeEncryptor, PermissionResolver, PermsError, PrivateKeyBundle,
    TrustVerifier,
};
use envsync_store::Store;
use envsync_sync::{
    ordered, replay, verify_convergence, version_state_hash, with_timeout, Api, Authoritative,
    Changeset, ChangesetSubmission, ConvergenceResult, FetchResponse, PendingChanges,
    ReconcileReport, Resolution, ScopeState, SyncError, UpdateRequest,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::mutation::{BuildContext, IssuedKey, Mutation};
use crate::session::{Clock, Session, SystemClock};

/// Result of a successful commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    /// New version of each committed scope.
    pub versions: BTreeMap<Scope, u64>,
    pub changesets: Vec<ObjectId>,
    pub envelopes: usize,
    /// Reconcile pass over the refreshed state.
    pub report: ReconcileReport,
}

/// Result of a successful [`Client::propose`].
#[derive(Debug, Clone, Default)]
pub struct ProposalOutcome {
    /// Per-recipient envelope changes.
    pub summary: BTreeMap<ObjectId, RecipientChange>,
    /// Objects created by the mutation.
    pub created: Vec<ObjectId>,
    /// Key seeds to hand to new keyholders.
    pub issued: Vec<IssuedKey>,
    pub envelopes: usize,
    pub deleted: usize,
}

/// The main Client struct.
///
/// Provides:
/// - Fetching and decrypting the session's envs
/// - Local edits with conflict detection
/// - Committing edits as changesets
/// - Authorized graph mutations with minimal re-encryption
/// - Invite and device grant acceptance
pub struct Client<A: Api, P: CryptoProvider, S: Store> {
    api: Arc<A>,
    pool: CryptoPool<P>,
    store: S,
    session: Session,
    clock: Arc<dyn Clock>,
    config: ClientConfig,
    /// Last authoritative graph.
    graph: OrgGraph,
    /// Decrypted authoritative contents. Replaced whole on every refresh.
    state: DecryptedEnvs,
    pending: PendingChanges,
}

impl<A: Api, P: CryptoProvider, S: Store> Client<A, P, S> {
    /// Create a client with empty local state.
    pub fn new(session: Session, api: Arc<A>, provider: P, store: S, config: ClientConfig) -> Self {
        Self {
            api,
            pool: CryptoPool::new(provider, config.pool_config()),
            store,
            session,
            clock: Arc::new(SystemClock),
            config,
            graph: OrgGraph::new(),
            state: DecryptedEnvs::default(),
            pending: PendingChanges::new(),
        }
    }

    /// Create a client and load persisted pending edits, conflicts, pinned
    /// roots, and the cached graph from `store`.
    pub async fn open(
        session: Session,
        api: Arc<A>,
        provider: P,
        store: S,
        config: ClientConfig,
    ) -> Result<Self> {
        let mut client = Self::new(session, api, provider, store, config);
        client.load().await?;
        Ok(client)
    }

    /// Use a custom clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn load(&mut self) -> Result<()> {
        for (id, pubkey) in self.session.roots.iter() {
            self.store.put_trusted_root(id, pubkey).await?;
        }
        self.session.roots = self.store.trusted_roots().await?;
        self.pending = PendingChanges::load(&self.store).await?;
        if let Some(graph) = self.store.get_graph().await? {
            self.graph = graph;
        }
        tracing::debug!(
            keyholder = %self.session.keyholder_id,
            roots = self.session.roots.len(),
            "opened client"
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Last authoritative graph.
    pub fn graph(&self) -> &OrgGraph {
        &self.graph
    }

    /// Authoritative version of a scope.
    pub fn version(&self, scope: &Scope) -> u64 {
        self.graph.scope_version(scope)
    }

    /// Decrypted authoritative env of a readable scope.
    pub fn env(&self, scope: &Scope) -> Option<&EnvMap> {
        self.state.envs.get(scope)
    }

    /// Key metadata of a scope, for readers with `ReadMeta`.
    pub fn meta(&self, scope: &Scope) -> Option<&MetaMap> {
        self.state.metas.get(scope)
    }

    pub fn inherits(&self, scope: &Scope) -> Option<&InheritsMap> {
        self.state.inherits.get(scope)
    }

    /// Values `scope` inherits from `source_environment_id`.
    pub fn inherited(&self, scope: &Scope, source_environment_id: &ObjectId) -> Option<&EnvMap> {
        self.state
            .overrides
            .get(&(scope.clone(), source_environment_id.clone()))
    }

    /// The authoritative env with pending edits applied.
    pub fn view(&self, scope: &Scope) -> Option<EnvMap> {
        let base = self.authoritative_env(scope).ok()?;
        Some(self.pending.apply_to(scope, &base))
    }

    pub fn pending_updates(&self) -> impl Iterator<Item = &PendingEnvUpdate> {
        self.pending.updates()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.pending.conflicts()
    }

    pub fn scope_state(&self, scope: &Scope) -> ScopeState {
        self.pending.state(scope)
    }

    /// The triples this session's keyholder should hold right now.
    pub fn required_keyset(&self) -> KeySet {
        required_for_keyholder(&self.graph, &self.session.keyholder_id, self.clock.now())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Refresh
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch, verify, and decrypt the authoritative state, then reconcile
    /// pending edits against it.
    ///
    /// Local state is replaced only after the whole batch decrypted and
    /// verified; any trust or integrity failure leaves it untouched.
    pub async fn refresh(&mut self) -> Result<ReconcileReport> {
        let response = with_timeout(
            &self.config.sync,
            "fetch",
            self.api.fetch(&self.session.keyholder_id),
        )
        .await?;
        self.ingest(response).await
    }

    async fn ingest(&mut self, response: FetchResponse) -> Result<ReconcileReport> {
        let now = self.clock.now();
        if response.graph.keyholder(&self.session.keyholder_id).is_none() {
            return Err(ClientError::NotLoaded(self.session.keyholder_id.clone()));
        }

        let decrypted = {
            let mut verifier = TrustVerifier::new(&response.graph, &self.session.roots, &self.pool);
            let decryptor = EnvelopeDecryptor::new(
                &self.pool,
                self.session.keyholder_id.clone(),
                self.session.keys.clone(),
            );
            decryptor
                .decrypt_fetched(&mut verifier, &response.envelopes, &response.blobs)
                .await?
        };

        for (scope, version) in &response.versions {
            let announced = response.graph.scope_version(scope);
            if announced != *version {
                return Err(PermsError::Integrity(format!(
                    "{} reported at version {} but the graph announces {}",
                    scope, version, announced
                ))
                .into());
            }
        }
        if self.config.verify_history {
            verify_history(&response.graph, &decrypted)?;
        }

        self.graph = response.graph;
        self.state = decrypted;

        let auth = Authoritative {
            graph: &self.graph,
            envs: &self.state.envs,
        };
        let report = self.pending.reconcile(&auth, now);
        self.persist_pending().await?;
        self.store.put_graph(&self.graph).await?;

        tracing::info!(
            keyholder = %self.session.keyholder_id,
            scopes = self.state.envs.len(),
            conflicts = report.conflicts.len(),
            "refreshed"
        );
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local edits
    // ─────────────────────────────────────────────────────────────────────────

    /// Stage an edit. `None` removes the key.
    ///
    /// Requires `Write` on the scope; the base is the authoritative cell as
    /// of the last refresh.
    pub async fn edit(&mut self, scope: &Scope, entry_key: &str, target: Option<EnvCell>) -> Result<()> {
        PermissionResolver::new(&self.graph).require(
            &scope.to_string(),
            &self.session.keyholder_id,
            Permission::Write,
        )?;
        let env_parent_id = self.env_parent_id(scope)?;
        let base_env = self.authoritative_env(scope)?;
        let key = PendingKey::new(env_parent_id, scope.clone(), entry_key);
        self.pending.edit(
            key,
            target,
            base_env.get(entry_key).cloned(),
            self.graph.scope_version(scope),
            self.clock.now(),
        )?;
        self.persist_pending().await
    }

    /// Discard pending edits of a scope, or only `entry_keys`.
    pub async fn reset(&mut self, scope: &Scope, entry_keys: Option<&[String]>) -> Result<usize> {
        let removed = self.pending.reset(scope, entry_keys)?;
        self.persist_pending().await?;
        Ok(removed)
    }

    /// Settle a conflict raised by a refresh.
    pub async fn resolve_conflict(
        &mut self,
        key: &PendingKey,
        resolution: Resolution,
    ) -> Result<Option<PendingEnvUpdate>> {
        let requeued = self.pending.resolve_conflict(key, resolution, self.clock.now())?;
        self.persist_pending().await?;
        Ok(requeued)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commit
    // ─────────────────────────────────────────────────────────────────────────

    /// Commit the pending edits of `scopes` as one changeset per scope.
    ///
    /// Every committed scope gets fresh data keys, sealed for every keyholder
    /// the resulting graph requires. On any failure the scopes return to
    /// `Dirty` with their edits intact.
    pub async fn commit(&mut self, scopes: &[Scope]) -> Result<CommitOutcome> {
        {
            let resolver = PermissionResolver::new(&self.graph);
            for scope in scopes {
                resolver.require(&scope.to_string(), &self.session.keyholder_id, Permission::Write)?;
            }
        }

        let batch = self.pending.begin_commit(scopes)?;
        let committing: Vec<Scope> = batch
            .iter()
            .map(|u| u.key.scope.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if committing.is_empty() {
            return Ok(CommitOutcome::default());
        }

        let now = self.clock.now();
        let (request, mut outcome) = match self.prepare_commit(&committing, now).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.pending.fail_commit(&committing);
                return Err(e);
            }
        };

        let submitted = with_timeout(&self.config.sync, "submit", self.api.submit(request)).await;
        let response = match submitted {
            Ok(response) => response,
            Err(e) => {
                self.pending.fail_commit(&committing);
                tracing::warn!(scopes = committing.len(), error = %e, "commit rejected");
                self.persist_pending().await?;
                return Err(e.into());
            }
        };

        self.pending.finish_commit(&committing);
        self.persist_pending().await?;
        outcome.report = self.ingest(response).await?;
        tracing::info!(
            scopes = committing.len(),
            envelopes = outcome.envelopes,
            "committed"
        );
        Ok(outcome)
    }

    async fn prepare_commit(&self, scopes: &[Scope], now: i64) -> Result<(UpdateRequest, CommitOutcome)> {
        let provider = self.pool.provider();
        let mut keyring = self.state.keyring.clone();
        let mut blobs = Blobs::new();
        let mut touched = BTreeSet::new();
        let mut mutation = GraphMutation::new();
        let mut parents: BTreeMap<ObjectId, EnvParent> = BTreeMap::new();
        let mut changed: BTreeMap<Scope, EnvMap> = BTreeMap::new();
        let mut submissions = Vec::new();
        let mut outcome = CommitOutcome::default();

        for scope in scopes {
            let parent = self
                .graph
                .env_parent_of_scope(scope)
                .ok_or_else(|| ClientError::UnknownObject(ObjectId::new(scope.to_string())))?;
            let before = self.authoritative_env(scope)?;
            let after = self.pending.apply_to(scope, &before);
            let base_version = self.graph.scope_version(scope);
            let changeset = Changeset::between(
                scope.clone(),
                base_version,
                &before,
                &after,
                self.session.keyholder_id.clone(),
                now,
            );

            parents
                .entry(parent.meta.id.clone())
                .or_insert_with(|| parent.clone())
                .touch(scope, now);
            mutation
                .upserts
                .push(GraphObject::ChangesetHeader(changeset.header(parent.meta.id.clone())));

            let key = keyring.rotate(scope, &Part::Env);
            blobs.insert((scope.clone(), Part::Env), seal_blob(provider, &key, &after)?);
            let key = keyring.rotate(scope, &Part::Meta);
            blobs.insert((scope.clone(), Part::Meta), seal_blob(provider, &key, &meta_of(&after))?);
            let key = keyring.rotate(scope, &Part::Inherits);
            blobs.insert(
                (scope.clone(), Part::Inherits),
                seal_blob(provider, &key, &inherits_of(&after))?,
            );
            let changeset_part = Part::Changeset(changeset.id.clone());
            let key = keyring.rotate(scope, &changeset_part);
            blobs.insert((scope.clone(), changeset_part.clone()), seal_blob(provider, &key, &changeset)?);

            for part in [Part::Env, Part::Meta, Part::Inherits, changeset_part] {
                touched.insert((scope.clone(), part));
            }
            submissions.push(ChangesetSubmission {
                scope: scope.clone(),
                base_version,
            });
            outcome.versions.insert(scope.clone(), changeset.version);
            outcome.changesets.push(changeset.id.clone());
            changed.insert(scope.clone(), after);
        }
        for parent in parents.into_values() {
            mutation.upserts.push(GraphObject::EnvParent(parent));
        }

        let targets: BTreeSet<Scope> = scopes.iter().cloned().collect();
        touched.extend(self.seal_overrides(&self.graph, &targets, &changed, &mut keyring, &mut blobs)?);

        let MutationDelta { proposed, delta } = delta_for_mutation(&self.graph, &mutation, now)?;
        let mut to_encrypt =
            required_keyset(&proposed, now).filter(|t| touched.contains(&(t.scope.clone(), t.part.clone())));
        to_encrypt.merge(&delta.to_encrypt);

        let envelopes = self.seal_envelopes(&proposed, &keyring, &to_encrypt).await?;
        outcome.envelopes = envelopes.len();

        let request = UpdateRequest {
            submitter_id: self.session.keyholder_id.clone(),
            mutation: Some(mutation),
            envelopes,
            deleted: delta.to_delete,
            blobs,
            changesets: submissions,
        };
        Ok((request, outcome))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Graph mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// The envelope delta `mutation` would cause, without submitting it.
    pub fn preview(&self, mutation: &Mutation) -> Result<KeysetDelta> {
        mutation.authorize(&self.graph, &self.session.keyholder_id)?;
        let now = self.clock.now();
        let built = mutation.build(&self.build_context(now))?;
        Ok(delta_for_mutation(&self.graph, &built.graph_mutation, now)?.delta)
    }

    /// Authorize, build, and submit a graph mutation together with exactly
    /// the envelopes it adds and removes.
    pub async fn propose(&mut self, mutation: &Mutation) -> Result<ProposalOutcome> {
        mutation.authorize(&self.graph, &self.session.keyholder_id)?;
        let now = self.clock.now();
        let built = mutation.build(&self.build_context(now))?;
        let MutationDelta { proposed, delta } = delta_for_mutation(&self.graph, &built.graph_mutation, now)?;

        let mut keyring = self.state.keyring.clone();
        let mut blobs = Blobs::new();
        let mut to_encrypt = delta.to_encrypt.clone();
        if let Mutation::AddInheritanceOverride { environment_id, .. } = mutation {
            let targets = BTreeSet::from([Scope::Environment(environment_id.clone())]);
            let touched = self.seal_overrides(&proposed, &targets, &BTreeMap::new(), &mut keyring, &mut blobs)?;
            to_encrypt.merge(
                &required_keyset(&proposed, now)
                    .filter(|t| touched.contains(&(t.scope.clone(), t.part.clone()))),
            );
        }

        let envelopes = self.seal_envelopes(&proposed, &keyring, &to_encrypt).await?;
        let outcome = ProposalOutcome {
            summary: delta.summary(),
            created: built.created,
            issued: built.issued,
            envelopes: envelopes.len(),
            deleted: delta.to_delete.len(),
        };
        let request = UpdateRequest {
            submitter_id: self.session.keyholder_id.clone(),
            mutation: Some(built.graph_mutation),
            envelopes,
            deleted: delta.to_delete,
            blobs,
            changesets: Vec::new(),
        };
        let response = with_timeout(&self.config.sync, "submit", self.api.submit(request)).await?;
        self.ingest(response).await?;

        tracing::info!(
            mutation = mutation.name(),
            envelopes = outcome.envelopes,
            deleted = outcome.deleted,
            "proposed mutation"
        );
        Ok(outcome)
    }

    /// Accept the invite or device grant this session holds: create a device
    /// for its user, seal everything the device requires, and retire the
    /// invite's envelopes in the same request.
    ///
    /// Returns the session of the new device.
    pub async fn accept(&mut self, device_name: &str) -> Result<Session> {
        let now = self.clock.now();
        let me = self
            .graph
            .keyholder(&self.session.keyholder_id)
            .cloned()
            .ok_or_else(|| ClientError::NotLoaded(self.session.keyholder_id.clone()))?;
        let user_id = match &me.kind {
            KeyholderKind::Invite { invitee_id, .. } => invitee_id.clone(),
            KeyholderKind::DeviceGrant { grantee_id, .. } => grantee_id.clone(),
            _ => {
                return Err(ClientError::InvalidMutation(format!(
                    "{} is a {}, not an invite or device grant",
                    me.id(),
                    me.kind.name()
                )))
            }
        };
        if !me.is_active_recipient(now) {
            return Err(ClientError::InvalidMutation(format!(
                "{} is expired or already accepted",
                me.id()
            )));
        }

        let mut accepted = me.clone();
        accepted.meta.updated_at = now;
        if let KeyholderKind::Invite { accepted_at, .. } | KeyholderKind::DeviceGrant { accepted_at, .. } =
            &mut accepted.kind
        {
            *accepted_at = Some(now);
        }

        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let device_keys = PrivateKeyBundle::from_seed(&seed);
        let device_id = ObjectId::generate();
        let bundle = device_keys.public_bundle();
        let signature = self
            .pool
            .provider()
            .sign(&pubkey_signing_bytes(&device_id, &bundle), &self.session.keys);
        let device = Keyholder {
            meta: ObjectMeta::new(device_id.clone(), now),
            kind: KeyholderKind::Device {
                user_id,
                name: device_name.to_string(),
            },
            pubkey: Some(bundle),
            signed_by_id: Some(self.session.keyholder_id.clone()),
            signature: Some(signature),
        };

        let mutation = GraphMutation::new()
            .upsert(GraphObject::Keyholder(accepted))
            .upsert(GraphObject::Keyholder(device));
        let MutationDelta { proposed, delta } = delta_for_mutation(&self.graph, &mutation, now)?;
        let onboarding = onboarding_delta(&proposed, &device_id, now);
        let envelopes = self
            .seal_envelopes(&proposed, &self.state.keyring, &onboarding.to_encrypt)
            .await?;
        let sealed = envelopes.len();

        let request = UpdateRequest {
            submitter_id: self.session.keyholder_id.clone(),
            mutation: Some(mutation),
            envelopes,
            deleted: delta.to_delete,
            blobs: Blobs::new(),
            changesets: Vec::new(),
        };
        let response = with_timeout(&self.config.sync, "submit", self.api.submit(request)).await?;
        self.ingest(response).await?;

        tracing::info!(device = %device_id, envelopes = sealed, "accepted onto new device");
        Ok(Session::new(device_id, device_keys, self.session.roots.clone()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // History
    // ─────────────────────────────────────────────────────────────────────────

    /// The decrypted changesets of a scope, ordered by version. Requires
    /// `ReadHistory`.
    pub fn history(&self, scope: &Scope) -> Result<Vec<Changeset>> {
        let mut histories = decode_history(&self.graph, &self.state)?;
        let changesets = histories.remove(scope).unwrap_or_default();
        Ok(ordered(scope, &changesets)?)
    }

    /// Rebuild a scope at version `n` from its history.
    pub fn env_at(&self, scope: &Scope, n: u64) -> Result<EnvMap> {
        Ok(replay(scope, &self.history(scope)?, n)?)
    }

    /// State hash of the full history of a scope.
    pub fn state_hash(&self, scope: &Scope) -> Result<Blake3Hash> {
        let history = self.history(scope)?;
        Ok(version_state_hash(scope, &history, history.len() as u64)?)
    }

    /// Compare this replica's history of `scope` with a remote one.
    pub fn check_convergence(
        &self,
        scope: &Scope,
        remote_version: u64,
        remote_hash: &Blake3Hash,
    ) -> Result<ConvergenceResult> {
        Ok(verify_convergence(scope, &self.history(scope)?, remote_version, remote_hash)?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal
    // ─────────────────────────────────────────────────────────────────────────

    fn build_context(&self, now: i64) -> BuildContext<'_, P> {
        BuildContext {
            graph: &self.graph,
            signer_id: &self.session.keyholder_id,
            signer_keys: &self.session.keys,
            provider: self.pool.provider(),
            now,
            invite_ttl_ms: self.config.invite_ttl.as_millis() as i64,
            device_grant_ttl_ms: self.config.device_grant_ttl.as_millis() as i64,
        }
    }

    fn env_parent_id(&self, scope: &Scope) -> Result<ObjectId> {
        self.graph
            .env_parent_of_scope(scope)
            .map(|p| p.meta.id.clone())
            .ok_or_else(|| ClientError::UnknownObject(ObjectId::new(scope.to_string())))
    }

    /// Authoritative env of a scope. A scope that was never written is empty.
    fn authoritative_env(&self, scope: &Scope) -> Result<EnvMap> {
        match self.state.envs.get(scope) {
            Some(env) => Ok(env.clone()),
            None if self.graph.scope_version(scope) == 0 => Ok(EnvMap::new()),
            None => Err(PermsError::Integrity(format!("no readable env for {}", scope)).into()),
        }
    }

    async fn persist_pending(&self) -> Result<()> {
        if self.config.persist_pending {
            self.pending.persist(&self.store).await?;
        }
        Ok(())
    }

    /// Re-seal inheritance override blobs whose owning or source environment
    /// is in `targets`. Returns the (scope, part) addresses given new keys.
    ///
    /// An override blob holds the source values of exactly the keys the
    /// owner inherits from it, so both envs must be readable; overrides this
    /// session cannot compute are left alone.
    fn seal_overrides(
        &self,
        graph: &OrgGraph,
        targets: &BTreeSet<Scope>,
        changed: &BTreeMap<Scope, EnvMap>,
        keyring: &mut DataKeyring,
        blobs: &mut Blobs,
    ) -> Result<BTreeSet<(Scope, Part)>> {
        let current = |scope: &Scope| -> Option<EnvMap> {
            match changed.get(scope).or_else(|| self.state.envs.get(scope)) {
                Some(env) => Some(env.clone()),
                None if graph.scope_version(scope) == 0 => Some(EnvMap::new()),
                None => None,
            }
        };

        let mut touched = BTreeSet::new();
        let overrides: Vec<_> = graph
            .environments()
            .flat_map(|env| graph.visible_overrides(&env.meta.id))
            .collect();
        for io in overrides {
            let owner = Scope::Environment(io.environment_id.clone());
            let source = Scope::Environment(io.source_environment_id.clone());
            if !targets.contains(&owner) && !targets.contains(&source) {
                continue;
            }
            let (Some(owner_env), Some(source_env)) = (current(&owner), current(&source)) else {
                tracing::debug!(%owner, %source, "override not computable by this session, skipping");
                continue;
            };
            let inherited: EnvMap = source_env
                .into_iter()
                .filter(|(k, _)| {
                    owner_env.get(k).and_then(|c| c.inherits_from()) == Some(&io.source_environment_id)
                })
                .collect();

            let part = Part::InheritanceOverride(io.source_environment_id.clone());
            let key = keyring.rotate(&owner, &part);
            blobs.insert(
                (owner.clone(), part.clone()),
                seal_blob(self.pool.provider(), &key, &inherited)?,
            );
            touched.insert((owner, part));
        }
        Ok(touched)
    }

    /// Seal envelopes for `required` over `graph`, verifying every recipient.
    ///
    /// Triples for env parts of scopes that were never written have no data
    /// key yet and are skipped; the first commit to the scope seals them.
    async fn seal_envelopes(
        &self,
        graph: &OrgGraph,
        keyring: &DataKeyring,
        required: &KeySet,
    ) -> Result<Vec<Envelope>> {
        let sealable = required.filter(|t| {
            keyring.contains(&t.scope, &t.part)
                || !(graph.scope_version(&t.scope) == 0
                    && matches!(t.part, Part::Env | Part::Meta | Part::Inherits))
        });
        let skipped = required.len() - sealable.len();
        if skipped > 0 {
            tracing::debug!(skipped, "skipping envelopes for unwritten scopes");
        }

        let mut verifier = TrustVerifier::new(graph, &self.session.roots, &self.pool);
        let encryptor = EnvelopeEncryptor::new(
            &self.pool,
            self.session.keyholder_id.clone(),
            self.session.keys.clone(),
        );
        let envelopes = encryptor.encrypt_keyset(&mut verifier, keyring, &sealable).await?;

        let limit = self.config.sync.max_envelopes_per_request;
        if envelopes.len() > limit {
            return Err(SyncError::RequestTooLarge {
                count: envelopes.len(),
                limit,
            }
            .into());
        }
        Ok(envelopes)
    }
}

/// Parse every decrypted changeset and check it against its graph header.
fn decode_history(graph: &OrgGraph, state: &DecryptedEnvs) -> Result<BTreeMap<Scope, Vec<Changeset>>> {
    let mut histories: BTreeMap<Scope, Vec<Changeset>> = BTreeMap::new();
    for ((scope, id), bytes) in &state.changesets {
        let changeset = Changeset::from_json(bytes)?;
        let header = graph
            .changesets_for(scope)
            .into_iter()
            .find(|h| &h.meta.id == id)
            .ok_or_else(|| PermsError::Integrity(format!("changeset {} has no header", id)))?;
        if &changeset.id != id || &changeset.scope != scope || changeset.version != header.version {
            return Err(PermsError::Integrity(format!(
                "changeset {} does not match its header for {} version {}",
                id, scope, header.version
            ))
            .into());
        }
        histories.entry(scope.clone()).or_default().push(changeset);
    }
    Ok(histories)
}

/// Where a full history was delivered, replaying it must reproduce the env.
fn verify_history(graph: &OrgGraph, state: &DecryptedEnvs) -> Result<()> {
    for (scope, changesets) in decode_history(graph, state)? {
        let version = graph.scope_version(&scope);
        let Some(env) = state.envs.get(&scope) else {
            continue;
        };
        if changesets.len() as u64 != version {
            continue;
        }
        let replayed = replay(&scope, &changesets, version)?;
        if &replayed != env {
            return Err(PermsError::Integrity(format!(
                "history of {} does not reproduce version {}",
                scope, version
            ))
            .into());
        }
    }
    Ok(())
}
