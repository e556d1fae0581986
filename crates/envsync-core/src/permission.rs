//! Permission vocabulary.
//!
//! One enum covers all three scope kinds so role definitions can mix org,
//! env-parent, and environment permissions (an app role's environment
//! permissions act as a ceiling over the matrix entries).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The kind of scope a permission applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// The organization as a whole.
    Org,
    /// An app or block.
    EnvParent,
    /// A base environment, sub-environment, or locals scope.
    Environment,
}

/// A single permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    // Org
    OrgManageSettings,
    OrgManageUsers,
    OrgManageCliUsers,
    OrgManageDevices,
    OrgManageRoles,
    OrgCreateApps,
    OrgReadAllBlocks,
    OrgWriteAllBlocks,

    // Env parent
    AppManageUsers,
    AppManageEnvironments,
    AppManageServers,
    AppManageLocalKeys,
    AppReadUserLocals,
    AppReadUserLocalsHistory,
    AppWriteUserLocals,

    // Environment
    Read,
    ReadMeta,
    ReadInherits,
    ReadHistory,
    Write,
}

/// A set of permissions. Ordered so that debug output and comparisons are stable.
pub type PermissionSet = BTreeSet<Permission>;

impl Permission {
    /// All environment permissions.
    pub const ENVIRONMENT: [Permission; 5] = [
        Permission::Read,
        Permission::ReadMeta,
        Permission::ReadInherits,
        Permission::ReadHistory,
        Permission::Write,
    ];

    /// Environment permissions implied by read access including history.
    pub const READ_ALL: [Permission; 4] = [
        Permission::Read,
        Permission::ReadMeta,
        Permission::ReadInherits,
        Permission::ReadHistory,
    ];

    /// The scope kind this permission is evaluated against.
    pub fn scope_kind(&self) -> ScopeKind {
        use Permission::*;
        match self {
            OrgManageSettings | OrgManageUsers | OrgManageCliUsers | OrgManageDevices
            | OrgManageRoles | OrgCreateApps | OrgReadAllBlocks | OrgWriteAllBlocks => {
                ScopeKind::Org
            }
            AppManageUsers | AppManageEnvironments | AppManageServers | AppManageLocalKeys
            | AppReadUserLocals | AppReadUserLocalsHistory | AppWriteUserLocals => {
                ScopeKind::EnvParent
            }
            Read | ReadMeta | ReadInherits | ReadHistory | Write => ScopeKind::Environment,
        }
    }

    /// Permissions directly implied by this one.
    fn implies(&self) -> &'static [Permission] {
        match self {
            Permission::Write => &[Permission::Read],
            Permission::Read => &[Permission::ReadMeta, Permission::ReadInherits],
            _ => &[],
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// All environment permissions as a set.
pub fn all_environment_permissions() -> PermissionSet {
    Permission::ENVIRONMENT.into_iter().collect()
}

/// Keep only the permissions of one scope kind.
pub fn filter_kind(set: &PermissionSet, kind: ScopeKind) -> PermissionSet {
    set.iter().copied().filter(|p| p.scope_kind() == kind).collect()
}

/// Close a set under implication (`Write ⇒ Read ⇒ ReadMeta + ReadInherits`).
pub fn close(set: &PermissionSet) -> PermissionSet {
    let mut closed = set.clone();
    let mut frontier: Vec<Permission> = set.iter().copied().collect();
    while let Some(p) = frontier.pop() {
        for implied in p.implies() {
            if closed.insert(*implied) {
                frontier.push(*implied);
            }
        }
    }
    closed
}
