//! Server-side authorization of graph mutations.
//!
//! Clients authorize their own mutations before building them, but the
//! server only sees the resulting upserts and tombstones. Every touched
//! object is checked here against the graph as it stood before the request.

use std::collections::BTreeSet;
use std::mem::discriminant;

use envsync_core::{
    EnvParent, GraphMutation, GraphObject, KeyableParent, KeyableParentKind, Keyholder,
    KeyholderKind, ObjectId, OrgGraph, Permission,
};
use envsync_perms::PermissionResolver;

use crate::api::{ChangesetSubmission, UpdateRequest};
use crate::error::{Result, SyncError};

/// Check that `request.submitter_id` may apply `mutation`.
///
/// `next` is `graph` with the mutation applied; objects created in the same
/// request (a keyable parent and its envkey) are looked up there.
pub(crate) fn authorize_mutation(
    graph: &OrgGraph,
    next: &OrgGraph,
    mutation: &GraphMutation,
    request: &UpdateRequest,
    now: i64,
) -> Result<()> {
    let submitter = graph
        .keyholder(&request.submitter_id)
        .ok_or_else(|| SyncError::Rejected(format!("unknown submitter {}", request.submitter_id)))?;
    let admission = Admission {
        graph,
        next,
        resolver: PermissionResolver::new(graph),
        submitter,
        submissions: &request.changesets,
        now,
    };
    admission.check_history(mutation)?;
    for object in &mutation.upserts {
        admission.check_upsert(object)?;
    }
    for id in &mutation.tombstones {
        admission.check_tombstone(id)?;
    }
    Ok(())
}

struct Admission<'a> {
    graph: &'a OrgGraph,
    next: &'a OrgGraph,
    resolver: PermissionResolver<'a>,
    submitter: &'a Keyholder,
    submissions: &'a [ChangesetSubmission],
    now: i64,
}

impl<'a> Admission<'a> {
    /// Changeset headers are append-only: each new header must announce
    /// exactly one submitted scope at `base_version + 1`.
    fn check_history(&self, mutation: &GraphMutation) -> Result<()> {
        let mut announced = BTreeSet::new();
        for object in &mutation.upserts {
            let GraphObject::ChangesetHeader(header) = object else {
                continue;
            };
            if self.graph.get_any(&header.meta.id).is_some() {
                return Err(SyncError::Rejected(format!(
                    "changeset {} is already recorded",
                    header.meta.id
                )));
            }
            let submission = self
                .submissions
                .iter()
                .find(|s| s.scope == header.scope)
                .ok_or_else(|| {
                    SyncError::Rejected(format!(
                        "changeset {} has no submission for {}",
                        header.meta.id, header.scope
                    ))
                })?;
            if header.version != submission.base_version + 1 {
                return Err(SyncError::Rejected(format!(
                    "changeset {} announces version {} on base {}",
                    header.meta.id, header.version, submission.base_version
                )));
            }
            if !announced.insert(header.scope.clone()) {
                return Err(SyncError::Rejected(format!(
                    "more than one changeset for {}",
                    header.scope
                )));
            }
            if &header.created_by_id != self.submitter.id() {
                return Err(SyncError::Rejected(format!(
                    "changeset {} is not authored by {}",
                    header.meta.id,
                    self.submitter.id()
                )));
            }
            let owner = self.graph.env_parent_of_scope(&header.scope).map(|p| &p.meta.id);
            if owner != Some(&header.env_parent_id) {
                return Err(SyncError::Rejected(format!(
                    "changeset {} names the wrong env parent {}",
                    header.meta.id, header.env_parent_id
                )));
            }
        }
        for id in &mutation.tombstones {
            if let Some(GraphObject::ChangesetHeader(_)) = self.graph.get_any(id) {
                return Err(SyncError::Rejected(format!("changeset {} cannot be deleted", id)));
            }
        }
        Ok(())
    }

    fn check_upsert(&self, object: &GraphObject) -> Result<()> {
        let existing = self.graph.get_any(object.id());
        if let Some(existing) = existing {
            if existing.is_deleted() {
                return Err(SyncError::Rejected(format!("{} is deleted", object.id())));
            }
            if discriminant(existing) != discriminant(object) {
                return Err(SyncError::Rejected(format!(
                    "{} cannot change object type",
                    object.id()
                )));
            }
        }

        match object {
            GraphObject::ChangesetHeader(_) => Ok(()),
            GraphObject::Org(_) => self.require_org(Permission::OrgManageSettings),
            GraphObject::OrgRole(_)
            | GraphObject::AppRole(_)
            | GraphObject::EnvironmentRole(_)
            | GraphObject::AppRoleEnvironmentRole(_) => self.require_org(Permission::OrgManageRoles),
            GraphObject::EnvParent(parent) => match existing {
                Some(GraphObject::EnvParent(current)) => self.check_env_parent(current, parent),
                _ => self.require_org(Permission::OrgCreateApps),
            },
            GraphObject::Environment(env) => {
                self.require_on_parent(&env.env_parent_id, Permission::AppManageEnvironments)
            }
            GraphObject::AppUserGrant(grant) => {
                if let Some(GraphObject::AppUserGrant(current)) = existing {
                    self.require(&current.app_id, Permission::AppManageUsers)?;
                }
                self.require(&grant.app_id, Permission::AppManageUsers)
            }
            GraphObject::AppBlock(connection) => {
                self.require(&connection.app_id, Permission::AppManageEnvironments)
            }
            GraphObject::InheritanceOverride(io) => self.require(&io.environment_id, Permission::Write),
            GraphObject::KeyableParent(keyable) => self.check_keyable_parent(keyable),
            GraphObject::Keyholder(keyholder) => {
                let current = match existing {
                    Some(GraphObject::Keyholder(current)) => Some(current),
                    _ => None,
                };
                self.check_keyholder(current, keyholder)
            }
        }
    }

    fn check_tombstone(&self, id: &ObjectId) -> Result<()> {
        let Some(object) = self.graph.get_any(id) else {
            return Err(SyncError::Rejected(format!("unknown object {}", id)));
        };
        match object {
            GraphObject::ChangesetHeader(_) => {
                Err(SyncError::Rejected(format!("changeset {} cannot be deleted", id)))
            }
            GraphObject::Org(_) => self.require_org(Permission::OrgManageSettings),
            GraphObject::OrgRole(_)
            | GraphObject::AppRole(_)
            | GraphObject::EnvironmentRole(_)
            | GraphObject::AppRoleEnvironmentRole(_) => self.require_org(Permission::OrgManageRoles),
            GraphObject::EnvParent(_) => self.require_org(Permission::OrgCreateApps),
            GraphObject::Environment(env) => {
                self.require(&env.env_parent_id, Permission::AppManageEnvironments)
            }
            GraphObject::AppUserGrant(grant) => self.require(&grant.app_id, Permission::AppManageUsers),
            GraphObject::AppBlock(connection) => {
                self.require(&connection.app_id, Permission::AppManageEnvironments)
            }
            GraphObject::InheritanceOverride(io) => self.require(&io.environment_id, Permission::Write),
            GraphObject::KeyableParent(keyable) => self.check_keyable_parent(keyable),
            GraphObject::Keyholder(keyholder) => self.check_keyholder_kind(keyholder),
        }
    }

    /// A commit may bump an env parent's freshness stamps for the scopes it
    /// submits. Any other change needs `AppManageEnvironments`.
    fn check_env_parent(&self, current: &EnvParent, parent: &EnvParent) -> Result<()> {
        let committed = self
            .submissions
            .iter()
            .any(|s| self.graph.env_parent_of_scope(&s.scope).map(|p| &p.meta.id) == Some(&parent.meta.id));
        if committed && is_freshness_touch(current, parent) {
            return Ok(());
        }
        self.require(&parent.meta.id, Permission::AppManageEnvironments)
    }

    fn check_keyable_parent(&self, keyable: &KeyableParent) -> Result<()> {
        match &keyable.kind {
            KeyableParentKind::Server => self.require(&keyable.app_id, Permission::AppManageServers),
            KeyableParentKind::LocalKey { user_id } if Some(user_id) == self.submitter.actor_id() => {
                self.require(&keyable.environment_id, Permission::Read)
            }
            KeyableParentKind::LocalKey { .. } => {
                self.require(&keyable.app_id, Permission::AppManageLocalKeys)
            }
        }
    }

    fn check_keyholder(&self, current: Option<&Keyholder>, keyholder: &Keyholder) -> Result<()> {
        if let Some(current) = current {
            if keyholder.id() == self.submitter.id() && is_acceptance(current, keyholder) {
                if !current.is_active_recipient(self.now) {
                    return Err(SyncError::Rejected(format!(
                        "{} is expired or already accepted",
                        keyholder.id()
                    )));
                }
                return Ok(());
            }
        }

        let signed = match current {
            Some(current) => {
                current.pubkey != keyholder.pubkey
                    || current.signature != keyholder.signature
                    || current.signed_by_id != keyholder.signed_by_id
            }
            None => keyholder.pubkey.is_some(),
        };
        if signed && keyholder.signed_by_id.as_ref() != Some(self.submitter.id()) {
            return Err(SyncError::Rejected(format!(
                "{} must be signed by {}",
                keyholder.id(),
                self.submitter.id()
            )));
        }
        if signed && current.is_some() {
            return self.require_org(Permission::OrgManageDevices);
        }
        self.check_keyholder_kind(keyholder)
    }

    /// Permission to create or remove a keyholder of this kind.
    fn check_keyholder_kind(&self, keyholder: &Keyholder) -> Result<()> {
        match &keyholder.kind {
            KeyholderKind::User { .. } | KeyholderKind::Invite { .. } => {
                self.require_org(Permission::OrgManageUsers)
            }
            KeyholderKind::CliUser { .. } => self.require_org(Permission::OrgManageCliUsers),
            KeyholderKind::Device { user_id, .. }
            | KeyholderKind::DeviceGrant {
                grantee_id: user_id, ..
            } => {
                if Some(user_id) == self.submitter.actor_id() {
                    Ok(())
                } else {
                    self.require_org(Permission::OrgManageDevices)
                }
            }
            KeyholderKind::GeneratedEnvkey { keyable_parent_id } => {
                match self.next.get_any(keyable_parent_id) {
                    Some(GraphObject::KeyableParent(keyable)) => self.check_keyable_parent(keyable),
                    _ => Err(SyncError::Rejected(format!(
                        "{} has no keyable parent {}",
                        keyholder.id(),
                        keyable_parent_id
                    ))),
                }
            }
        }
    }

    /// Env-parent permission, or `OrgCreateApps` when the parent is new.
    fn require_on_parent(&self, env_parent_id: &ObjectId, permission: Permission) -> Result<()> {
        if self.graph.get_any(env_parent_id).is_none() {
            return self.require_org(Permission::OrgCreateApps);
        }
        self.require(env_parent_id, permission)
    }

    fn require(&self, scope_id: &ObjectId, permission: Permission) -> Result<()> {
        self.resolver
            .require(scope_id.as_str(), self.submitter.id(), permission)?;
        Ok(())
    }

    fn require_org(&self, permission: Permission) -> Result<()> {
        self.resolver.require("", self.submitter.id(), permission)?;
        Ok(())
    }
}

/// Whether `next` differs from `current` only in freshness stamps.
fn is_freshness_touch(current: &EnvParent, next: &EnvParent) -> bool {
    let mut normalized = next.clone();
    normalized.meta.updated_at = current.meta.updated_at;
    normalized.envs_updated_at = current.envs_updated_at;
    normalized.locals_updated_at = current.locals_updated_at.clone();
    &normalized == current
}

/// Whether `next` is `current` with `accepted_at` set and nothing else changed.
fn is_acceptance(current: &Keyholder, next: &Keyholder) -> bool {
    let mut normalized = next.clone();
    normalized.meta.updated_at = current.meta.updated_at;
    match (&mut normalized.kind, &current.kind) {
        (
            KeyholderKind::Invite { accepted_at, .. },
            KeyholderKind::Invite {
                accepted_at: before, ..
            },
        )
        | (
            KeyholderKind::DeviceGrant { accepted_at, .. },
            KeyholderKind::DeviceGrant {
                accepted_at: before, ..
            },
        ) => {
            if accepted_at.is_none() {
                return false;
            }
            *accepted_at = *before;
        }
        _ => return false,
    }
    &normalized == current
}
