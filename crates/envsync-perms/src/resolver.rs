//! Permission Resolver.
//!
//! Computes the exact permission set an actor holds on an org, env-parent,
//! or environment scope within one graph snapshot. Missing or tombstoned
//! actors and scopes resolve to the empty set rather than an error; only
//! [`PermissionResolver::require`] turns an absent permission into one.
//!
//! ## Rules
//!
//! - Org: the org-kind permissions of the actor's org role.
//! - App: the org role's `auto_app_role_id`, else the live app grant, picks
//!   the app role. A full-permissions app role holds every app and
//!   environment permission; otherwise environment access is the closed
//!   matrix entry intersected with the role's closed environment ceiling.
//! - Block: org-wide block grants, unioned with access through every app
//!   that connects the block.
//! - Locals: a user's own locals are fully accessible; another user's need
//!   the env-parent "user locals" permissions.

use std::cell::RefCell;
use std::collections::HashMap;

use envsync_core::permission::{all_environment_permissions, close, filter_kind};
use envsync_core::{
    AppRole, EnvParent, Environment, Keyholder, ObjectId, OrgGraph, Permission, PermissionSet,
    Scope, ScopeKind,
};

use crate::error::{PermsError, Result};
use crate::roles::RoleResolver;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MemoKey {
    Org,
    EnvParent(ObjectId),
    Scope(Scope),
}

/// Resolves permissions over one immutable graph snapshot.
///
/// Holds per-(actor, scope) memoization, so create a fresh resolver for each
/// snapshot.
pub struct PermissionResolver<'g> {
    graph: &'g OrgGraph,
    roles: RoleResolver<'g>,
    memo: RefCell<HashMap<(ObjectId, MemoKey), PermissionSet>>,
}

impl<'g> PermissionResolver<'g> {
    pub fn new(graph: &'g OrgGraph) -> Self {
        Self {
            graph,
            roles: RoleResolver::new(graph),
            memo: RefCell::new(HashMap::new()),
        }
    }

    pub fn graph(&self) -> &'g OrgGraph {
        self.graph
    }

    /// Permissions of `actor_id` on a scope of the given kind.
    ///
    /// `scope_id` is ignored for [`ScopeKind::Org`], names an app or block for
    /// [`ScopeKind::EnvParent`], and is an environment id or locals text form
    /// (`envParentId|userId`) for [`ScopeKind::Environment`].
    pub fn permissions(&self, scope_id: &str, actor_id: &ObjectId, kind: ScopeKind) -> PermissionSet {
        match kind {
            ScopeKind::Org => self.org_permissions(actor_id),
            ScopeKind::EnvParent => self.env_parent_permissions(&ObjectId::new(scope_id), actor_id),
            ScopeKind::Environment => match scope_id.parse::<Scope>() {
                Ok(scope) => self.scope_permissions(&scope, actor_id),
                Err(_) => PermissionSet::new(),
            },
        }
    }

    /// Fail with `PermissionDenied` unless the actor holds `permission`.
    pub fn require(&self, scope_id: &str, actor_id: &ObjectId, permission: Permission) -> Result<()> {
        let granted = self.permissions(scope_id, actor_id, permission.scope_kind());
        if granted.contains(&permission) {
            Ok(())
        } else {
            tracing::debug!(actor = %actor_id, scope = scope_id, %permission, "permission denied");
            Err(PermsError::PermissionDenied {
                actor_id: actor_id.clone(),
                scope: scope_id.to_string(),
                permission,
            })
        }
    }

    /// Org-level permissions.
    pub fn org_permissions(&self, actor_id: &ObjectId) -> PermissionSet {
        self.memoized(actor_id, MemoKey::Org, |actor| {
            let Some(role_id) = actor.org_role_id() else {
                return PermissionSet::new();
            };
            filter_kind(&self.roles.effective(role_id), ScopeKind::Org)
        })
    }

    /// Permissions on an app or block as a whole.
    pub fn env_parent_permissions(&self, env_parent_id: &ObjectId, actor_id: &ObjectId) -> PermissionSet {
        self.memoized(actor_id, MemoKey::EnvParent(env_parent_id.clone()), |actor| {
            let Some(parent) = self.graph.env_parent(env_parent_id) else {
                return PermissionSet::new();
            };
            if parent.is_app() {
                self.app_level(&parent.meta.id, actor)
            } else {
                self.block_level(parent, actor)
            }
        })
    }

    /// Environment permissions on a concrete or locals scope.
    pub fn scope_permissions(&self, scope: &Scope, actor_id: &ObjectId) -> PermissionSet {
        self.memoized(actor_id, MemoKey::Scope(scope.clone()), |actor| match scope {
            Scope::Environment(env_id) => {
                let Some(env) = self.graph.live_environment(env_id) else {
                    return PermissionSet::new();
                };
                let Some(parent) = self.graph.env_parent(&env.env_parent_id) else {
                    return PermissionSet::new();
                };
                if parent.is_app() {
                    self.app_environment(&parent.meta.id, env, actor)
                } else {
                    self.block_environment(parent, env, actor)
                }
            }
            Scope::Locals {
                env_parent_id,
                user_id,
            } => self.locals(env_parent_id, user_id, actor),
        })
    }

    /// The app role an actor holds on an app, if any.
    pub fn app_role_for(&self, app_id: &ObjectId, actor_id: &ObjectId) -> Option<&'g AppRole> {
        let actor = self.actor(actor_id)?;
        self.app_role_of(app_id, actor)
    }

    /// Whether the actor can reach an env parent at all.
    pub fn has_env_parent_access(&self, env_parent_id: &ObjectId, actor_id: &ObjectId) -> bool {
        let Some(actor) = self.actor(actor_id) else {
            return false;
        };
        let Some(parent) = self.graph.env_parent(env_parent_id) else {
            return false;
        };
        self.has_access(parent, actor)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal rules
    // ─────────────────────────────────────────────────────────────────────────

    fn memoized(
        &self,
        actor_id: &ObjectId,
        key: MemoKey,
        compute: impl FnOnce(&'g Keyholder) -> PermissionSet,
    ) -> PermissionSet {
        let memo_key = (actor_id.clone(), key);
        if let Some(hit) = self.memo.borrow().get(&memo_key) {
            return hit.clone();
        }
        let result = match self.actor(actor_id) {
            Some(actor) => compute(actor),
            None => PermissionSet::new(),
        };
        self.memo.borrow_mut().insert(memo_key, result.clone());
        result
    }

    /// The live user or CLI user behind an id. Devices, invites, and device
    /// grants resolve to the actor they act for.
    fn actor(&self, id: &ObjectId) -> Option<&'g Keyholder> {
        let keyholder = self.graph.keyholder(id)?;
        let actor_id = keyholder.actor_id()?;
        let actor = if actor_id == id {
            keyholder
        } else {
            self.graph.keyholder(actor_id)?
        };
        actor.org_role_id()?;
        Some(actor)
    }

    fn org_set(&self, actor: &Keyholder) -> PermissionSet {
        actor
            .org_role_id()
            .map(|role_id| filter_kind(&self.roles.effective(role_id), ScopeKind::Org))
            .unwrap_or_default()
    }

    fn app_role_of(&self, app_id: &ObjectId, actor: &Keyholder) -> Option<&'g AppRole> {
        let app = self.graph.env_parent(app_id)?;
        if !app.is_app() {
            return None;
        }
        let org_role = self.graph.org_role(actor.org_role_id()?)?;
        let app_role_id = match &org_role.auto_app_role_id {
            Some(auto) => auto.clone(),
            None => self.graph.app_user_grant(app_id, actor.id())?.app_role_id.clone(),
        };
        self.graph.app_role(&app_role_id)
    }

    fn app_level(&self, app_id: &ObjectId, actor: &Keyholder) -> PermissionSet {
        let Some(app_role) = self.app_role_of(app_id, actor) else {
            return PermissionSet::new();
        };
        if app_role.has_full_permissions {
            return all_env_parent_permissions();
        }
        filter_kind(&self.roles.effective(&app_role.meta.id), ScopeKind::EnvParent)
    }

    fn block_level(&self, block: &EnvParent, actor: &Keyholder) -> PermissionSet {
        let org = self.org_set(actor);
        let mut set = PermissionSet::new();
        for link in self.graph.apps_of_block(&block.meta.id) {
            set.extend(self.app_level(&link.app_id, actor));
        }
        if org.contains(&Permission::OrgReadAllBlocks) || org.contains(&Permission::OrgWriteAllBlocks) {
            set.insert(Permission::AppReadUserLocals);
            set.insert(Permission::AppReadUserLocalsHistory);
        }
        if org.contains(&Permission::OrgWriteAllBlocks) {
            set.insert(Permission::AppWriteUserLocals);
        }
        set
    }

    /// Matrix rule for an app role on an environment role.
    fn matrix_rule(&self, app_role: &AppRole, environment_role_id: &ObjectId) -> PermissionSet {
        if self.graph.environment_role(environment_role_id).is_none() {
            return PermissionSet::new();
        }
        if app_role.has_full_permissions {
            return all_environment_permissions();
        }
        let ceiling = close(&filter_kind(
            &self.roles.effective(&app_role.meta.id),
            ScopeKind::Environment,
        ));
        let matrix = self
            .graph
            .matrix_entry(&app_role.meta.id, environment_role_id)
            .map(|m| close(&filter_kind(&m.permissions, ScopeKind::Environment)))
            .unwrap_or_default();
        matrix.intersection(&ceiling).copied().collect()
    }

    fn app_environment(&self, app_id: &ObjectId, env: &Environment, actor: &Keyholder) -> PermissionSet {
        match self.app_role_of(app_id, actor) {
            Some(app_role) => self.matrix_rule(app_role, &env.environment_role_id),
            None => PermissionSet::new(),
        }
    }

    fn block_environment(&self, block: &EnvParent, env: &Environment, actor: &Keyholder) -> PermissionSet {
        if self.graph.environment_role(&env.environment_role_id).is_none() {
            return PermissionSet::new();
        }
        let org = self.org_set(actor);
        let mut set = if org.contains(&Permission::OrgWriteAllBlocks) {
            all_environment_permissions()
        } else if org.contains(&Permission::OrgReadAllBlocks) {
            Permission::READ_ALL.into_iter().collect()
        } else {
            PermissionSet::new()
        };
        for link in self.graph.apps_of_block(&block.meta.id) {
            if let Some(app_role) = self.app_role_of(&link.app_id, actor) {
                set.extend(self.matrix_rule(app_role, &env.environment_role_id));
            }
        }
        close(&set)
    }

    fn has_access(&self, parent: &EnvParent, actor: &Keyholder) -> bool {
        if parent.is_app() {
            return self.app_role_of(&parent.meta.id, actor).is_some();
        }
        let org = self.org_set(actor);
        org.contains(&Permission::OrgReadAllBlocks)
            || org.contains(&Permission::OrgWriteAllBlocks)
            || self
                .graph
                .apps_of_block(&parent.meta.id)
                .iter()
                .any(|link| self.app_role_of(&link.app_id, actor).is_some())
    }

    fn locals(&self, env_parent_id: &ObjectId, user_id: &ObjectId, actor: &Keyholder) -> PermissionSet {
        let Some(parent) = self.graph.env_parent(env_parent_id) else {
            return PermissionSet::new();
        };
        match self.graph.keyholder(user_id) {
            Some(owner) if owner.is_org_user() => {}
            _ => return PermissionSet::new(),
        }
        if !self.has_access(parent, actor) {
            return PermissionSet::new();
        }
        if actor.id() == user_id {
            return all_environment_permissions();
        }

        let parent_perms = if parent.is_app() {
            self.app_level(&parent.meta.id, actor)
        } else {
            self.block_level(parent, actor)
        };
        let mut set = PermissionSet::new();
        if parent_perms.contains(&Permission::AppReadUserLocals) {
            set.extend([Permission::Read, Permission::ReadMeta, Permission::ReadInherits]);
        }
        if parent_perms.contains(&Permission::AppReadUserLocalsHistory) {
            set.insert(Permission::ReadHistory);
        }
        if parent_perms.contains(&Permission::AppWriteUserLocals) {
            set.insert(Permission::Write);
        }
        close(&set)
    }
}

fn all_env_parent_permissions() -> PermissionSet {
    [
        Permission::AppManageUsers,
        Permission::AppManageEnvironments,
        Permission::AppManageServers,
        Permission::AppManageLocalKeys,
        Permission::AppReadUserLocals,
        Permission::AppReadUserLocalsHistory,
        Permission::AppWriteUserLocals,
    ]
    .into_iter()
    .collect()
}
