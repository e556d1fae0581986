//! Role composition.
//!
//! A role's effective permission set is its base set (or, when it extends
//! another role, that role's effective set) plus additions minus removals.
//! Results are cached per role id for the life of one graph snapshot.

use std::cell::RefCell;
use std::collections::HashMap;

use envsync_core::{ObjectId, OrgGraph, PermissionSet, RoleDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleKind {
    Org,
    App,
}

/// Resolves effective role permission sets over one graph snapshot.
pub struct RoleResolver<'g> {
    graph: &'g OrgGraph,
    cache: RefCell<HashMap<ObjectId, PermissionSet>>,
}

impl<'g> RoleResolver<'g> {
    pub fn new(graph: &'g OrgGraph) -> Self {
        Self {
            graph,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Effective permissions of a live org or app role.
    ///
    /// Missing roles, roles extending a missing role or a role of another
    /// kind, and roles on an extends cycle all resolve to the empty set.
    pub fn effective(&self, role_id: &ObjectId) -> PermissionSet {
        if let Some(hit) = self.cache.borrow().get(role_id) {
            return hit.clone();
        }
        let mut path = Vec::new();
        let resolved = match self.resolve(role_id, &mut path) {
            Some(set) => set,
            None => PermissionSet::new(),
        };
        self.cache
            .borrow_mut()
            .insert(role_id.clone(), resolved.clone());
        resolved
    }

    fn definition(&self, role_id: &ObjectId) -> Option<(RoleKind, &'g RoleDefinition)> {
        if let Some(role) = self.graph.org_role(role_id) {
            return Some((RoleKind::Org, &role.definition));
        }
        self.graph
            .app_role(role_id)
            .map(|role| (RoleKind::App, &role.definition))
    }

    fn resolve(&self, role_id: &ObjectId, path: &mut Vec<ObjectId>) -> Option<PermissionSet> {
        if let Some(hit) = self.cache.borrow().get(role_id) {
            return Some(hit.clone());
        }
        if path.contains(role_id) {
            tracing::warn!(role = %role_id, "role extends cycle, resolving to no permissions");
            return None;
        }
        let (kind, def) = self.definition(role_id)?;

        let mut set = match &def.extends_role_id {
            Some(parent_id) => {
                let (parent_kind, _) = self.definition(parent_id)?;
                if parent_kind != kind {
                    tracing::warn!(role = %role_id, parent = %parent_id, "role extends a role of another kind");
                    return None;
                }
                path.push(role_id.clone());
                let parent = self.resolve(parent_id, path);
                path.pop();
                parent?
            }
            None => def.permissions.clone(),
        };
        set.extend(def.add_permissions.iter().copied());
        for removed in &def.remove_permissions {
            set.remove(removed);
        }
        Some(set)
    }
}
