//! MemoryApi rules, exercised with real keys and sealed envelopes.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use envsync_core::{
    inherits_of, meta_of, AppUserGrant, EnvMap, GraphMutation, GraphObject, KeySet, KeyTriple, KeyholderKind,
    ObjectId, ObjectMeta, OrgGraph, Part, Scope,
};
use envsync_keyset::{required_for_keyholder, required_keyset};
use envsync_perms::{
    seal_blob, Blobs, CryptoPool, DataKeyring, EnvelopeDecryptor, EnvelopeEncryptor,
    NativeProvider, PoolConfig, TrustVerifier,
};
use envsync_sync::{Api, Changeset, ChangesetSubmission, MemoryApi, SyncError, UpdateRequest};
use envsync_testkit::fixtures::{
    OrgFixture, APP_ADMIN, APP_DEVELOPER, DEVELOPMENT, ORG_BASIC, OWNER_DEVICE, PAYMENTS, PRODUCTION,
};
use envsync_testkit::env_map;

fn pool() -> CryptoPool<NativeProvider> {
    CryptoPool::new(NativeProvider, PoolConfig::default())
}

fn fixture() -> OrgFixture {
    OrgFixture::payments()
        .with_user("alice", ORG_BASIC)
        .with_grant(PAYMENTS, "alice", APP_DEVELOPER)
}

/// A version-(base + 1) commit of `env` to `scope`, sealed for every
/// keyholder the resulting graph requires.
async fn commit_request(
    fixture: &OrgFixture,
    graph: &OrgGraph,
    submitter: &str,
    scope: &Scope,
    env: &EnvMap,
    base_version: u64,
) -> UpdateRequest {
    let pool = pool();
    let changeset = Changeset::between(
        scope.clone(),
        base_version,
        &EnvMap::new(),
        env,
        submitter.into(),
        1,
    );
    let mutation = GraphMutation::new().upsert(GraphObject::ChangesetHeader(changeset.header(PAYMENTS.into())));
    let proposed = graph.apply(&mutation, 1).unwrap();

    let mut keyring = DataKeyring::new();
    let mut blobs = Blobs::new();
    let key = keyring.rotate(scope, &Part::Env);
    blobs.insert((scope.clone(), Part::Env), seal_blob(pool.provider(), &key, env).unwrap());
    let key = keyring.rotate(scope, &Part::Meta);
    blobs.insert(
        (scope.clone(), Part::Meta),
        seal_blob(pool.provider(), &key, &meta_of(env)).unwrap(),
    );
    let key = keyring.rotate(scope, &Part::Inherits);
    blobs.insert(
        (scope.clone(), Part::Inherits),
        seal_blob(pool.provider(), &key, &inherits_of(env)).unwrap(),
    );
    let part = Part::Changeset(changeset.id.clone());
    let key = keyring.rotate(scope, &part);
    blobs.insert((scope.clone(), part), seal_blob(pool.provider(), &key, &changeset).unwrap());

    let required = required_keyset(&proposed, 1)
        .filter(|t| &t.scope == scope && keyring.contains(&t.scope, &t.part));

    let roots = fixture.roots();
    let mut verifier = TrustVerifier::new(&proposed, &roots, &pool);
    let encryptor = EnvelopeEncryptor::new(&pool, submitter.into(), Arc::new(fixture.keys(submitter)));
    let envelopes = encryptor
        .encrypt_keyset(&mut verifier, &keyring, &required)
        .await
        .unwrap();

    UpdateRequest {
        submitter_id: submitter.into(),
        mutation: Some(mutation),
        envelopes,
        deleted: KeySet::new(),
        blobs,
        changesets: vec![ChangesetSubmission {
            scope: scope.clone(),
            base_version,
        }],
    }
}

#[tokio::test]
async fn test_commit_then_fetch_decrypts() {
    let fixture = fixture();
    let api = MemoryApi::new(fixture.graph().clone()).with_clock(|| 1);
    let development = Scope::environment(DEVELOPMENT);
    let env = env_map(&[("STRIPE_KEY", "sk_test_123")]);

    let request = commit_request(&fixture, fixture.graph(), OWNER_DEVICE, &development, &env, 0).await;
    api.submit(request).await.unwrap();

    let response = api.fetch(&"alice-laptop".into()).await.unwrap();
    assert_eq!(response.versions.get(&development), Some(&1));

    let pool = pool();
    let roots = fixture.roots();
    let mut verifier = TrustVerifier::new(&response.graph, &roots, &pool);
    let decryptor = EnvelopeDecryptor::new(&pool, "alice-laptop".into(), Arc::new(fixture.keys("alice-laptop")));
    let decrypted = decryptor
        .decrypt_fetched(&mut verifier, &response.envelopes, &response.blobs)
        .await
        .unwrap();
    assert_eq!(decrypted.envs.get(&development), Some(&env));
}

#[tokio::test]
async fn test_stale_base_version_conflicts() {
    let fixture = fixture();
    let api = MemoryApi::new(fixture.graph().clone()).with_clock(|| 1);
    let development = Scope::environment(DEVELOPMENT);

    let first = commit_request(&fixture, fixture.graph(), OWNER_DEVICE, &development, &env_map(&[("A", "1")]), 0).await;
    let second = commit_request(&fixture, fixture.graph(), "alice-laptop", &development, &env_map(&[("A", "2")]), 0).await;
    api.submit(first).await.unwrap();

    let err = api.submit(second).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::VersionConflict { expected: 0, actual: 1, .. }
    ));
}

#[tokio::test]
async fn test_write_requires_permission() {
    let fixture = fixture();
    let api = MemoryApi::new(fixture.graph().clone()).with_clock(|| 1);
    let production = Scope::environment(PRODUCTION);

    let request = commit_request(&fixture, fixture.graph(), "alice-laptop", &production, &env_map(&[("A", "1")]), 0).await;
    let err = api.submit(request).await.unwrap_err();
    assert!(matches!(err, SyncError::Perms(_)));
    assert_eq!(api.graph().await.scope_version(&production), 0);
}

#[tokio::test]
async fn test_unrequired_envelope_rejected() {
    let fixture = fixture();
    let api = MemoryApi::new(fixture.graph().clone()).with_clock(|| 1);
    let production = Scope::environment(PRODUCTION);

    let mut request =
        commit_request(&fixture, fixture.graph(), OWNER_DEVICE, &production, &env_map(&[("A", "1")]), 0).await;
    // alice may only see production's keys, never its values
    let owner_envelope = request
        .envelopes
        .iter()
        .find(|e| e.recipient_id == ObjectId::new(OWNER_DEVICE) && e.part == Part::Env)
        .cloned()
        .unwrap();
    let mut leaked = owner_envelope;
    leaked.recipient_id = "alice-laptop".into();
    request.envelopes.push(leaked);

    let err = api.submit(request).await.unwrap_err();
    assert!(matches!(err, SyncError::Rejected(_)));
    assert!(api.stored_keyset().await.is_empty());
}

#[tokio::test]
async fn test_request_size_limit() {
    let fixture = fixture();
    let api = MemoryApi::new(fixture.graph().clone())
        .with_clock(|| 1)
        .with_max_envelopes(1);
    let development = Scope::environment(DEVELOPMENT);

    let request = commit_request(&fixture, fixture.graph(), OWNER_DEVICE, &development, &env_map(&[("A", "1")]), 0).await;
    assert!(request.envelopes.len() > 1);
    let err = api.submit(request).await.unwrap_err();
    assert!(matches!(err, SyncError::RequestTooLarge { limit: 1, .. }));
}

#[tokio::test]
async fn test_fetch_returns_only_own_envelopes() {
    let fixture = fixture();
    let api = MemoryApi::new(fixture.graph().clone()).with_clock(|| 1);
    let development = Scope::environment(DEVELOPMENT);
    let request = commit_request(&fixture, fixture.graph(), OWNER_DEVICE, &development, &env_map(&[("A", "1")]), 0).await;
    api.submit(request).await.unwrap();

    let response = api.fetch(&"alice-laptop".into()).await.unwrap();
    let expected = required_for_keyholder(&response.graph, &"alice-laptop".into(), 1)
        .filter(|t| t.scope == development);
    let fetched: KeySet = response.envelopes.iter().map(|e| e.triple()).collect();
    assert_eq!(fetched, expected);
    assert!(fetched.contains_triple(&KeyTriple::new("alice-laptop", development, Part::Env)));
}

#[tokio::test]
async fn test_expired_invite_is_served_nothing() {
    let fixture = fixture()
        .with_user("dave", ORG_BASIC)
        .with_grant(PAYMENTS, "dave", APP_DEVELOPER)
        .with_signed_keyholder(
            "dave-invite",
            KeyholderKind::Invite {
                invitee_id: "dave".into(),
                expires_at: 10,
                accepted_at: None,
            },
            OWNER_DEVICE,
        );
    let clock = Arc::new(AtomicI64::new(1));
    let server_clock = clock.clone();
    let api = MemoryApi::new(fixture.graph().clone()).with_clock(move || server_clock.load(Ordering::SeqCst));
    let development = Scope::environment(DEVELOPMENT);
    let request = commit_request(&fixture, fixture.graph(), OWNER_DEVICE, &development, &env_map(&[("A", "1")]), 0).await;
    api.submit(request).await.unwrap();
    assert!(!api.fetch(&"dave-invite".into()).await.unwrap().envelopes.is_empty());

    clock.store(10, Ordering::SeqCst);
    let response = api.fetch(&"dave-invite".into()).await.unwrap();
    assert!(response.envelopes.is_empty());
    assert!(response.blobs.is_empty());

    // the next write drops what the graph no longer requires
    api.submit(UpdateRequest {
        submitter_id: OWNER_DEVICE.into(),
        ..Default::default()
    })
    .await
    .unwrap();
    let stored = api.stored_keyset().await;
    assert!(stored.recipients().all(|r| r.as_str() != "dave-invite"));
    assert!(stored.recipients().any(|r| r.as_str() == "dave-laptop"));
}

#[tokio::test]
async fn test_changeset_header_needs_submission() {
    let fixture = fixture();
    let api = MemoryApi::new(fixture.graph().clone()).with_clock(|| 1);
    let production = Scope::environment(PRODUCTION);

    // alice cannot write production, so announce a version without submitting it
    let changeset = Changeset::between(
        production.clone(),
        0,
        &EnvMap::new(),
        &env_map(&[("A", "1")]),
        "alice-laptop".into(),
        1,
    );
    let request = UpdateRequest {
        submitter_id: "alice-laptop".into(),
        mutation: Some(
            GraphMutation::new().upsert(GraphObject::ChangesetHeader(changeset.header(PAYMENTS.into()))),
        ),
        ..Default::default()
    };
    let err = api.submit(request).await.unwrap_err();
    assert!(matches!(err, SyncError::Rejected(_)));
    assert_eq!(api.graph().await.scope_version(&production), 0);
}

#[tokio::test]
async fn test_committed_history_is_immutable() {
    let fixture = fixture();
    let api = MemoryApi::new(fixture.graph().clone()).with_clock(|| 1);
    let development = Scope::environment(DEVELOPMENT);
    let request = commit_request(&fixture, fixture.graph(), OWNER_DEVICE, &development, &env_map(&[("A", "1")]), 0).await;
    api.submit(request).await.unwrap();
    let header = api.graph().await.changesets_for(&development)[0].clone();

    let deleted = UpdateRequest {
        submitter_id: OWNER_DEVICE.into(),
        mutation: Some(GraphMutation::new().tombstone(header.meta.id.clone())),
        ..Default::default()
    };
    assert!(matches!(api.submit(deleted).await.unwrap_err(), SyncError::Rejected(_)));

    let mut rewritten = header.clone();
    rewritten.version = 2;
    let replaced = UpdateRequest {
        submitter_id: OWNER_DEVICE.into(),
        mutation: Some(GraphMutation::new().upsert(GraphObject::ChangesetHeader(rewritten))),
        changesets: vec![ChangesetSubmission {
            scope: development.clone(),
            base_version: 1,
        }],
        ..Default::default()
    };
    assert!(matches!(api.submit(replaced).await.unwrap_err(), SyncError::Rejected(_)));

    let graph = api.graph().await;
    assert_eq!(graph.scope_version(&development), 1);
    assert_eq!(graph.changesets_for(&development), vec![&header]);
}

#[tokio::test]
async fn test_graph_changes_require_permission() {
    let fixture = fixture();
    let api = MemoryApi::new(fixture.graph().clone()).with_clock(|| 1);

    let promoted = GraphObject::AppUserGrant(AppUserGrant {
        meta: ObjectMeta::new("grant-self", 1),
        app_id: PAYMENTS.into(),
        user_id: "alice".into(),
        app_role_id: APP_ADMIN.into(),
    });
    let request = UpdateRequest {
        submitter_id: "alice-laptop".into(),
        mutation: Some(GraphMutation::new().upsert(promoted.clone())),
        ..Default::default()
    };
    let err = api.submit(request).await.unwrap_err();
    assert!(matches!(err, SyncError::Perms(_)));
    let graph = api.graph().await;
    assert!(graph.get(&"grant-self".into()).is_none());

    let revoke = UpdateRequest {
        submitter_id: "alice-laptop".into(),
        mutation: Some(GraphMutation::new().tombstone(format!("grant-{}-{}", PAYMENTS, "alice"))),
        ..Default::default()
    };
    assert!(matches!(api.submit(revoke).await.unwrap_err(), SyncError::Perms(_)));

    let granted = UpdateRequest {
        submitter_id: OWNER_DEVICE.into(),
        mutation: Some(GraphMutation::new().upsert(promoted)),
        ..Default::default()
    };
    api.submit(granted).await.unwrap();
    assert!(api.graph().await.get(&"grant-self".into()).is_some());
}
