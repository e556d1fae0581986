//! Edit, commit, refresh, and conflict flows across several clients sharing
//! one server.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use common::Org;
use envsync::core::{ObjectId, PendingKey};
use envsync::store::MemoryStore;
use envsync::sync::{Api, FetchResponse, MemoryApi, SyncError, UpdateRequest};
use envsync::{EnvCell, ErrorCategory, Resolution, Scope, ScopeState};
use envsync_testkit::fixtures::{
    OrgFixture, APP_DEVELOPER, DEVELOPMENT, ORG_BASIC, OWNER_DEVICE, PAYMENTS, PRODUCTION,
};
use envsync_testkit::{device_of, env_map};

fn payments_team() -> OrgFixture {
    OrgFixture::payments()
        .with_user("alice", ORG_BASIC)
        .with_user("bob", ORG_BASIC)
        .with_grant(PAYMENTS, "alice", APP_DEVELOPER)
        .with_grant(PAYMENTS, "bob", APP_DEVELOPER)
}

fn development() -> Scope {
    Scope::environment(DEVELOPMENT)
}

fn production() -> Scope {
    Scope::environment(PRODUCTION)
}

#[tokio::test]
async fn test_concurrent_edits_conflict_and_resolve() -> anyhow::Result<()> {
    let org = Org::new(payments_team());
    let mut owner = org.client(OWNER_DEVICE).await?;

    owner
        .edit(&development(), "STRIPE_KEY", Some(EnvCell::value("sk_test")))
        .await?;
    owner
        .edit(&production(), "STRIPE_KEY", Some(EnvCell::value("sk_live")))
        .await?;
    let outcome = owner.commit(&[development(), production()]).await?;
    assert_eq!(outcome.versions.get(&development()), Some(&1));
    assert_eq!(outcome.versions.get(&production()), Some(&1));
    assert_eq!(outcome.changesets.len(), 2);
    assert_eq!(owner.scope_state(&development()), ScopeState::Clean);

    let mut alice = org.client(&device_of("alice")).await?;
    assert_eq!(
        alice.env(&development()),
        Some(&env_map(&[("STRIPE_KEY", "sk_test")]))
    );
    // Production is key-names only for developers.
    assert!(alice.env(&production()).is_none());
    assert!(alice.meta(&production()).is_some_and(|m| m.contains_key("STRIPE_KEY")));

    let mut bob = org.client(&device_of("bob")).await?;
    alice
        .edit(&development(), "STRIPE_KEY", Some(EnvCell::value("sk_test_alice")))
        .await?;
    bob.edit(&development(), "STRIPE_KEY", Some(EnvCell::value("sk_test_bob")))
        .await?;
    let outcome = bob.commit(&[development()]).await?;
    assert_eq!(outcome.versions.get(&development()), Some(&2));

    let err = alice.commit(&[development()]).await.unwrap_err();
    assert!(err.is_conflict(), "unexpected error: {}", err);
    assert_eq!(alice.scope_state(&development()), ScopeState::Dirty);

    let report = alice.refresh().await?;
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.base, Some(EnvCell::value("sk_test")));
    assert_eq!(conflict.local_target, Some(EnvCell::value("sk_test_alice")));
    assert_eq!(conflict.authoritative, Some(EnvCell::value("sk_test_bob")));
    assert_eq!(conflict.authoritative_version, 2);

    let key = PendingKey::new(PAYMENTS, development(), "STRIPE_KEY");
    let err = alice
        .edit(&development(), "STRIPE_KEY", Some(EnvCell::value("sk_test_again")))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let requeued = alice.resolve_conflict(&key, Resolution::KeepLocal).await?;
    assert!(requeued.is_some());
    assert_eq!(alice.conflicts().count(), 0);
    let outcome = alice.commit(&[development()]).await?;
    assert_eq!(outcome.versions.get(&development()), Some(&3));

    owner.refresh().await?;
    assert_eq!(
        owner.env(&development()),
        Some(&env_map(&[("STRIPE_KEY", "sk_test_alice")]))
    );
    let history = owner.history(&development())?;
    assert_eq!(history.len(), 3);
    assert_eq!(
        owner.env_at(&development(), 2)?,
        env_map(&[("STRIPE_KEY", "sk_test_bob")])
    );

    bob.refresh().await?;
    assert_eq!(owner.state_hash(&development())?, bob.state_hash(&development())?);
    let remote = owner.state_hash(&development())?;
    assert!(bob.check_convergence(&development(), 3, &remote)?.is_converged());
    Ok(())
}

#[tokio::test]
async fn test_refresh_drops_edits_that_became_authoritative() -> anyhow::Result<()> {
    let org = Org::new(payments_team());
    let mut alice = org.client(&device_of("alice")).await?;
    let mut bob = org.client(&device_of("bob")).await?;

    alice
        .edit(&development(), "REGION", Some(EnvCell::value("eu-west-1")))
        .await?;
    bob.edit(&development(), "REGION", Some(EnvCell::value("eu-west-1")))
        .await?;
    bob.commit(&[development()]).await?;

    let report = alice.refresh().await?;
    assert_eq!(report.dropped_noops.len(), 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(alice.pending_updates().count(), 0);
    assert_eq!(alice.scope_state(&development()), ScopeState::Clean);
    Ok(())
}

#[tokio::test]
async fn test_edit_and_reset() -> anyhow::Result<()> {
    let org = Org::new(payments_team());
    let mut alice = org.client(&device_of("alice")).await?;

    alice.edit(&development(), "A", Some(EnvCell::value("1"))).await?;
    alice.edit(&development(), "B", Some(EnvCell::Empty)).await?;
    assert_eq!(alice.scope_state(&development()), ScopeState::Dirty);
    assert_eq!(
        alice.view(&development()).map(|env| env.len()),
        Some(2)
    );

    let removed = alice.reset(&development(), Some(&["A".to_string()])).await?;
    assert_eq!(removed, 1);
    assert_eq!(alice.reset(&development(), None).await?, 1);
    assert_eq!(alice.scope_state(&development()), ScopeState::Clean);

    // Committing a clean scope is a no-op.
    let outcome = alice.commit(&[development()]).await?;
    assert!(outcome.versions.is_empty());
    assert_eq!(org.api.graph().await.scope_version(&development()), 0);
    Ok(())
}

#[tokio::test]
async fn test_writes_need_write_permission() -> anyhow::Result<()> {
    let org = Org::new(payments_team());
    let mut alice = org.client(&device_of("alice")).await?;

    let err = alice
        .edit(&production(), "STRIPE_KEY", Some(EnvCell::value("sk_live_alice")))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::PermissionDenied);

    let err = alice
        .preview(&envsync::Mutation::GrantAppAccess {
            app_id: PAYMENTS.into(),
            user_id: "bob".into(),
            app_role_id: "app-admin".into(),
        })
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::PermissionDenied);
    Ok(())
}

#[tokio::test]
async fn test_user_locals_are_private_to_owner_and_admins() -> anyhow::Result<()> {
    let org = Org::new(payments_team());
    let locals = Scope::locals(PAYMENTS, "alice");

    let mut alice = org.client(&device_of("alice")).await?;
    alice
        .edit(&locals, "DEBUG", Some(EnvCell::value("true")))
        .await?;
    alice.commit(&[locals.clone()]).await?;

    let owner = org.client(OWNER_DEVICE).await?;
    assert_eq!(owner.env(&locals), Some(&env_map(&[("DEBUG", "true")])));

    let bob = org.client(&device_of("bob")).await?;
    assert!(bob.env(&locals).is_none());
    Ok(())
}

#[tokio::test]
async fn test_inheritance_override_follows_source() -> anyhow::Result<()> {
    let org = Org::new(payments_team());
    let staging = Scope::environment("staging");
    let mut owner = org.client(OWNER_DEVICE).await?;

    owner
        .edit(&development(), "DATABASE_URL", Some(EnvCell::value("postgres://dev")))
        .await?;
    owner
        .edit(&staging, "DATABASE_URL", Some(EnvCell::Inherits(DEVELOPMENT.into())))
        .await?;
    owner.commit(&[development(), staging.clone()]).await?;
    owner
        .propose(&envsync::Mutation::AddInheritanceOverride {
            environment_id: "staging".into(),
            source_environment_id: DEVELOPMENT.into(),
        })
        .await?;

    let mut alice = org.client(&device_of("alice")).await?;
    let source: ObjectId = DEVELOPMENT.into();
    assert_eq!(
        alice.inherited(&staging, &source),
        Some(&env_map(&[("DATABASE_URL", "postgres://dev")]))
    );

    // A new source value reaches the override without touching staging.
    owner
        .edit(&development(), "DATABASE_URL", Some(EnvCell::value("postgres://dev-2")))
        .await?;
    owner.commit(&[development()]).await?;
    alice.refresh().await?;
    assert_eq!(
        alice.inherited(&staging, &source),
        Some(&env_map(&[("DATABASE_URL", "postgres://dev-2")]))
    );
    assert_eq!(alice.version(&staging), 1);
    Ok(())
}

/// Fails the next submit with a timeout, then forwards.
struct FlakyApi {
    inner: Arc<MemoryApi>,
    fail_next: AtomicBool,
}

#[async_trait]
impl Api for FlakyApi {
    async fn fetch(&self, keyholder_id: &ObjectId) -> envsync::sync::Result<FetchResponse> {
        self.inner.fetch(keyholder_id).await
    }

    async fn submit(&self, request: UpdateRequest) -> envsync::sync::Result<FetchResponse> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Timeout("submit".into()));
        }
        self.inner.submit(request).await
    }
}

#[tokio::test]
async fn test_failed_submit_keeps_edits_for_retry() -> anyhow::Result<()> {
    let org = Org::new(payments_team());
    let api = Arc::new(FlakyApi {
        inner: org.api.clone(),
        fail_next: AtomicBool::new(true),
    });
    let mut alice = org
        .open(org.session(&device_of("alice")), api, MemoryStore::new())
        .await?;

    alice.edit(&development(), "A", Some(EnvCell::value("1"))).await?;
    let err = alice.commit(&[development()]).await.unwrap_err();
    assert!(matches!(
        err,
        envsync::ClientError::Sync(SyncError::Timeout(_))
    ));
    assert_eq!(alice.scope_state(&development()), ScopeState::Dirty);
    assert_eq!(alice.pending_updates().count(), 1);

    let outcome = alice.commit(&[development()]).await?;
    assert_eq!(outcome.versions.get(&development()), Some(&1));
    assert_eq!(alice.env(&development()), Some(&env_map(&[("A", "1")])));
    Ok(())
}
