//! Org graph object model.
//!
//! Every object embeds an [`ObjectMeta`] header. References between objects
//! are plain ids resolved through the [`OrgGraph`](crate::graph::OrgGraph)
//! arena, never direct pointers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::{Ed25519Signature, PublicKeyBundle};
use crate::permission::PermissionSet;
use crate::scope::Scope;
use crate::types::{ObjectId, ObjectMeta};

/// The organization itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Org {
    pub meta: ObjectMeta,
    pub name: String,
}

/// Permission declaration shared by org and app roles.
///
/// With `extends_role_id` set, the effective set is the parent's effective set
/// plus `add_permissions` minus `remove_permissions`; `permissions` is ignored.
/// Without it, the effective set is `permissions` plus additions minus removals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub permissions: PermissionSet,
    pub extends_role_id: Option<ObjectId>,
    pub add_permissions: PermissionSet,
    pub remove_permissions: PermissionSet,
}

impl RoleDefinition {
    /// A standalone role with a fixed permission set.
    pub fn fixed(permissions: impl IntoIterator<Item = crate::Permission>) -> Self {
        Self {
            permissions: permissions.into_iter().collect(),
            ..Default::default()
        }
    }

    /// A role extending `parent` with deltas.
    pub fn extending(
        parent: impl Into<ObjectId>,
        add: impl IntoIterator<Item = crate::Permission>,
        remove: impl IntoIterator<Item = crate::Permission>,
    ) -> Self {
        Self {
            permissions: PermissionSet::new(),
            extends_role_id: Some(parent.into()),
            add_permissions: add.into_iter().collect(),
            remove_permissions: remove.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgRole {
    pub meta: ObjectMeta,
    pub name: String,
    pub definition: RoleDefinition,
    /// App role this org role holds on every app (org owners and admins).
    pub auto_app_role_id: Option<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRole {
    pub meta: ObjectMeta,
    pub name: String,
    pub definition: RoleDefinition,
    /// Bypasses the environment role matrix.
    pub has_full_permissions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRole {
    pub meta: ObjectMeta,
    pub name: String,
    pub has_local_keys: bool,
    pub has_servers: bool,
}

/// One cell of the AppRole × EnvironmentRole matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRoleEnvironmentRole {
    pub meta: ObjectMeta,
    pub app_role_id: ObjectId,
    pub environment_role_id: ObjectId,
    pub permissions: PermissionSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvParentKind {
    App,
    Block,
}

/// An app or block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvParent {
    pub meta: ObjectMeta,
    pub kind: EnvParentKind,
    pub name: String,
    /// Last committed change to any base or sub environment.
    pub envs_updated_at: Option<i64>,
    /// Last committed change to each user's locals.
    pub locals_updated_at: BTreeMap<ObjectId, i64>,
}

impl EnvParent {
    pub fn is_app(&self) -> bool {
        self.kind == EnvParentKind::App
    }

    pub fn is_block(&self) -> bool {
        self.kind == EnvParentKind::Block
    }

    /// Freshness timestamp relevant to a scope of this parent.
    pub fn updated_at_for(&self, scope: &Scope) -> Option<i64> {
        match scope {
            Scope::Environment(_) => self.envs_updated_at,
            Scope::Locals { user_id, .. } => self.locals_updated_at.get(user_id).copied(),
        }
    }

    /// Record a committed change to `scope` at `at`.
    pub fn touch(&mut self, scope: &Scope, at: i64) {
        match scope {
            Scope::Environment(_) => self.envs_updated_at = Some(at),
            Scope::Locals { user_id, .. } => {
                self.locals_updated_at.insert(user_id.clone(), at);
            }
        }
        self.meta.updated_at = at;
    }
}

/// A base or sub environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub meta: ObjectMeta,
    pub env_parent_id: ObjectId,
    pub environment_role_id: ObjectId,
    pub is_sub: bool,
    pub parent_environment_id: Option<ObjectId>,
    pub sub_name: Option<String>,
}

/// A user's role on one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppUserGrant {
    pub meta: ObjectMeta,
    pub app_id: ObjectId,
    pub user_id: ObjectId,
    pub app_role_id: ObjectId,
}

/// An app's connection to a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppBlock {
    pub meta: ObjectMeta,
    pub app_id: ObjectId,
    pub block_id: ObjectId,
    pub order_index: u32,
}

/// What kind of principal a keyholder is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyholderKind {
    User {
        org_role_id: ObjectId,
        email: String,
    },
    CliUser {
        org_role_id: ObjectId,
        name: String,
    },
    Device {
        user_id: ObjectId,
        name: String,
    },
    Invite {
        invitee_id: ObjectId,
        expires_at: i64,
        accepted_at: Option<i64>,
    },
    DeviceGrant {
        grantee_id: ObjectId,
        expires_at: i64,
        accepted_at: Option<i64>,
    },
    GeneratedEnvkey {
        keyable_parent_id: ObjectId,
    },
}

impl KeyholderKind {
    pub fn name(&self) -> &'static str {
        match self {
            KeyholderKind::User { .. } => "user",
            KeyholderKind::CliUser { .. } => "cli_user",
            KeyholderKind::Device { .. } => "device",
            KeyholderKind::Invite { .. } => "invite",
            KeyholderKind::DeviceGrant { .. } => "device_grant",
            KeyholderKind::GeneratedEnvkey { .. } => "generated_envkey",
        }
    }
}

/// Any entity that can hold a public key and receive envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyholder {
    pub meta: ObjectMeta,
    pub kind: KeyholderKind,
    pub pubkey: Option<PublicKeyBundle>,
    /// The keyholder whose signature authorizes `pubkey`. `None` for roots.
    pub signed_by_id: Option<ObjectId>,
    pub signature: Option<Ed25519Signature>,
}

impl Keyholder {
    pub fn id(&self) -> &ObjectId {
        &self.meta.id
    }

    /// The user (or CLI user) whose permissions this keyholder exercises.
    pub fn actor_id(&self) -> Option<&ObjectId> {
        match &self.kind {
            KeyholderKind::User { .. } | KeyholderKind::CliUser { .. } => Some(&self.meta.id),
            KeyholderKind::Device { user_id, .. } => Some(user_id),
            KeyholderKind::Invite { invitee_id, .. } => Some(invitee_id),
            KeyholderKind::DeviceGrant { grantee_id, .. } => Some(grantee_id),
            KeyholderKind::GeneratedEnvkey { .. } => None,
        }
    }

    /// The org role for actor keyholders (users and CLI users).
    pub fn org_role_id(&self) -> Option<&ObjectId> {
        match &self.kind {
            KeyholderKind::User { org_role_id, .. } | KeyholderKind::CliUser { org_role_id, .. } => {
                Some(org_role_id)
            }
            _ => None,
        }
    }

    /// Whether this keyholder is an org user (not a CLI user).
    pub fn is_org_user(&self) -> bool {
        matches!(self.kind, KeyholderKind::User { .. })
    }

    /// Whether this keyholder should receive envelopes at `now`.
    ///
    /// Requires a live object with a pubkey; invites and device grants stop
    /// receiving once accepted or expired.
    pub fn is_active_recipient(&self, now: i64) -> bool {
        if self.meta.is_deleted() || self.pubkey.is_none() {
            return false;
        }
        match &self.kind {
            KeyholderKind::Invite {
                expires_at,
                accepted_at,
                ..
            }
            | KeyholderKind::DeviceGrant {
                expires_at,
                accepted_at,
                ..
            } => accepted_at.is_none() && now < *expires_at,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyableParentKind {
    Server,
    LocalKey { user_id: ObjectId },
}

/// A server or local development key bound to one app environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyableParent {
    pub meta: ObjectMeta,
    pub kind: KeyableParentKind,
    pub name: String,
    pub app_id: ObjectId,
    pub environment_id: ObjectId,
}

/// Values an environment inherits from `source_environment_id`, re-encrypted
/// for readers of the owning environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InheritanceOverride {
    pub meta: ObjectMeta,
    pub environment_id: ObjectId,
    pub source_environment_id: ObjectId,
}

/// The graph-visible header of a committed changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetHeader {
    pub meta: ObjectMeta,
    pub env_parent_id: ObjectId,
    pub scope: Scope,
    pub version: u64,
    pub created_by_id: ObjectId,
}

/// Any object stored in the org graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum GraphObject {
    Org(Org),
    OrgRole(OrgRole),
    AppRole(AppRole),
    EnvironmentRole(EnvironmentRole),
    AppRoleEnvironmentRole(AppRoleEnvironmentRole),
    EnvParent(EnvParent),
    Environment(Environment),
    AppUserGrant(AppUserGrant),
    AppBlock(AppBlock),
    Keyholder(Keyholder),
    KeyableParent(KeyableParent),
    InheritanceOverride(InheritanceOverride),
    ChangesetHeader(ChangesetHeader),
}

impl GraphObject {
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            GraphObject::Org(o) => &o.meta,
            GraphObject::OrgRole(o) => &o.meta,
            GraphObject::AppRole(o) => &o.meta,
            GraphObject::EnvironmentRole(o) => &o.meta,
            GraphObject::AppRoleEnvironmentRole(o) => &o.meta,
            GraphObject::EnvParent(o) => &o.meta,
            GraphObject::Environment(o) => &o.meta,
            GraphObject::AppUserGrant(o) => &o.meta,
            GraphObject::AppBlock(o) => &o.meta,
            GraphObject::Keyholder(o) => &o.meta,
            GraphObject::KeyableParent(o) => &o.meta,
            GraphObject::InheritanceOverride(o) => &o.meta,
            GraphObject::ChangesetHeader(o) => &o.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            GraphObject::Org(o) => &mut o.meta,
            GraphObject::OrgRole(o) => &mut o.meta,
            GraphObject::AppRole(o) => &mut o.meta,
            GraphObject::EnvironmentRole(o) => &mut o.meta,
            GraphObject::AppRoleEnvironmentRole(o) => &mut o.meta,
            GraphObject::EnvParent(o) => &mut o.meta,
            GraphObject::Environment(o) => &mut o.meta,
            GraphObject::AppUserGrant(o) => &mut o.meta,
            GraphObject::AppBlock(o) => &mut o.meta,
            GraphObject::Keyholder(o) => &mut o.meta,
            GraphObject::KeyableParent(o) => &mut o.meta,
            GraphObject::InheritanceOverride(o) => &mut o.meta,
            GraphObject::ChangesetHeader(o) => &mut o.meta,
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.meta().id
    }

    pub fn is_deleted(&self) -> bool {
        self.meta().is_deleted()
    }

    /// Short kind name, for errors and logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            GraphObject::Org(_) => "org",
            GraphObject::OrgRole(_) => "org_role",
            GraphObject::AppRole(_) => "app_role",
            GraphObject::EnvironmentRole(_) => "environment_role",
            GraphObject::AppRoleEnvironmentRole(_) => "app_role_environment_role",
            GraphObject::EnvParent(_) => "env_parent",
            GraphObject::Environment(_) => "environment",
            GraphObject::AppUserGrant(_) => "app_user_grant",
            GraphObject::AppBlock(_) => "app_block",
            GraphObject::Keyholder(_) => "keyholder",
            GraphObject::KeyableParent(_) => "keyable_parent",
            GraphObject::InheritanceOverride(_) => "inheritance_override",
            GraphObject::ChangesetHeader(_) => "changeset_header",
        }
    }
}
