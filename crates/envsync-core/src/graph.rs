//! The org graph: an id → object arena with tombstone-only removal.
//!
//! All typed accessors filter out tombstoned objects. Raw access to
//! tombstones goes through [`OrgGraph::get_any`] so historical decisions
//! (trust chains through removed keyholders, say) can still be explained.
//!
//! Mutations never touch a graph in place during a calculation pass:
//! [`OrgGraph::apply`] clones the snapshot and returns the proposed graph.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::model::*;
use crate::scope::Scope;
use crate::types::ObjectId;

/// A point-in-time org graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgGraph {
    objects: BTreeMap<ObjectId, GraphObject>,
}

/// A proposed change to the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphMutation {
    /// Objects to insert or replace.
    pub upserts: Vec<GraphObject>,
    /// Ids to tombstone.
    pub tombstones: Vec<ObjectId>,
}

impl GraphMutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(mut self, object: GraphObject) -> Self {
        self.upserts.push(object);
        self
    }

    pub fn tombstone(mut self, id: impl Into<ObjectId>) -> Self {
        self.tombstones.push(id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.tombstones.is_empty()
    }
}

macro_rules! typed_get {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $name(&self, id: &ObjectId) -> Option<&$ty> {
            match self.get(id)? {
                GraphObject::$variant(o) => Some(o),
                _ => None,
            }
        }
    };
}

impl OrgGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from objects. Later duplicates replace earlier ones.
    pub fn from_objects(objects: impl IntoIterator<Item = GraphObject>) -> Self {
        let mut graph = Self::new();
        for object in objects {
            graph.upsert(object);
        }
        graph
    }

    /// Number of objects, tombstones included.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Raw access
    // ─────────────────────────────────────────────────────────────────────────

    /// A live object.
    pub fn get(&self, id: &ObjectId) -> Option<&GraphObject> {
        self.objects.get(id).filter(|o| !o.is_deleted())
    }

    /// An object regardless of tombstone state.
    pub fn get_any(&self, id: &ObjectId) -> Option<&GraphObject> {
        self.objects.get(id)
    }

    /// All live objects, ordered by id.
    pub fn live(&self) -> impl Iterator<Item = &GraphObject> {
        self.objects.values().filter(|o| !o.is_deleted())
    }

    /// All objects including tombstones.
    pub fn all(&self) -> impl Iterator<Item = &GraphObject> {
        self.objects.values()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutation
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace an object.
    pub fn upsert(&mut self, object: GraphObject) {
        self.objects.insert(object.id().clone(), object);
    }

    /// Mark an object deleted. The entry stays in the arena.
    pub fn tombstone(&mut self, id: &ObjectId, at: i64) -> Result<()> {
        let object = self
            .objects
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownObject(id.clone()))?;
        if object.is_deleted() {
            return Err(CoreError::AlreadyDeleted(id.clone()));
        }
        let meta = object.meta_mut();
        meta.deleted_at = Some(at);
        meta.updated_at = at;
        Ok(())
    }

    /// Return a new graph with `mutation` applied; `self` is untouched.
    pub fn apply(&self, mutation: &GraphMutation, at: i64) -> Result<OrgGraph> {
        let mut next = self.clone();
        for object in &mutation.upserts {
            next.upsert(object.clone());
        }
        for id in &mutation.tombstones {
            next.tombstone(id, at)?;
        }
        Ok(next)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Typed accessors (live only)
    // ─────────────────────────────────────────────────────────────────────────

    typed_get!(org_role, OrgRole, OrgRole);
    typed_get!(app_role, AppRole, AppRole);
    typed_get!(environment_role, EnvironmentRole, EnvironmentRole);
    typed_get!(env_parent, EnvParent, EnvParent);
    typed_get!(
        /// A live environment object. Does not check its parents; see
        /// [`OrgGraph::live_environment`].
        environment,
        Environment,
        Environment
    );
    typed_get!(keyholder, Keyholder, Keyholder);
    typed_get!(keyable_parent, KeyableParent, KeyableParent);
    typed_get!(inheritance_override, InheritanceOverride, InheritanceOverride);

    /// A keyholder regardless of tombstone state.
    pub fn keyholder_any(&self, id: &ObjectId) -> Option<&Keyholder> {
        match self.get_any(id)? {
            GraphObject::Keyholder(k) => Some(k),
            _ => None,
        }
    }

    /// The org object, if present.
    pub fn org(&self) -> Option<&Org> {
        self.live().find_map(|o| match o {
            GraphObject::Org(org) => Some(org),
            _ => None,
        })
    }

    /// An environment that is usable as a scope: it, its env parent, and
    /// (for a sub-environment) its parent environment are all live.
    pub fn live_environment(&self, id: &ObjectId) -> Option<&Environment> {
        let env = self.environment(id)?;
        self.env_parent(&env.env_parent_id)?;
        if env.is_sub {
            let parent_id = env.parent_environment_id.as_ref()?;
            let parent = self.environment(parent_id)?;
            if parent.env_parent_id != env.env_parent_id {
                return None;
            }
        }
        Some(env)
    }

    /// The env parent a scope belongs to, if the scope is live.
    pub fn env_parent_of_scope(&self, scope: &Scope) -> Option<&EnvParent> {
        match scope {
            Scope::Environment(id) => {
                let env = self.live_environment(id)?;
                self.env_parent(&env.env_parent_id)
            }
            Scope::Locals { env_parent_id, .. } => self.env_parent(env_parent_id),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Collections (live only)
    // ─────────────────────────────────────────────────────────────────────────

    pub fn env_parents(&self) -> impl Iterator<Item = &EnvParent> {
        self.live().filter_map(|o| match o {
            GraphObject::EnvParent(p) => Some(p),
            _ => None,
        })
    }

    pub fn environments(&self) -> impl Iterator<Item = &Environment> {
        self.live().filter_map(|o| match o {
            GraphObject::Environment(e) => Some(e),
            _ => None,
        })
    }

    /// Usable environments of one env parent.
    pub fn environments_of<'a: 'b, 'b>(
        &'a self,
        env_parent_id: &'b ObjectId,
    ) -> impl Iterator<Item = &'a Environment> + 'b {
        self.environments()
            .filter(move |e| &e.env_parent_id == env_parent_id)
            .filter(move |e| self.live_environment(&e.meta.id).is_some())
    }

    /// The base environment of an env parent bound to an environment role.
    pub fn base_environment_with_role(
        &self,
        env_parent_id: &ObjectId,
        environment_role_id: &ObjectId,
    ) -> Option<&Environment> {
        self.environments_of(env_parent_id)
            .find(|e| !e.is_sub && &e.environment_role_id == environment_role_id)
    }

    /// A live sub-environment of `parent_environment_id` with the given name.
    pub fn sub_environment_named(
        &self,
        parent_environment_id: &ObjectId,
        sub_name: &str,
    ) -> Option<&Environment> {
        self.environments().find(|e| {
            e.is_sub
                && e.parent_environment_id.as_ref() == Some(parent_environment_id)
                && e.sub_name.as_deref() == Some(sub_name)
                && self.live_environment(&e.meta.id).is_some()
        })
    }

    pub fn keyholders(&self) -> impl Iterator<Item = &Keyholder> {
        self.live().filter_map(|o| match o {
            GraphObject::Keyholder(k) => Some(k),
            _ => None,
        })
    }

    /// Live org users (not CLI users), whose locals scopes exist.
    pub fn org_users(&self) -> impl Iterator<Item = &Keyholder> {
        self.keyholders().filter(|k| k.is_org_user())
    }

    /// The live devices of a user.
    pub fn devices_of<'a>(&'a self, user_id: &'a ObjectId) -> impl Iterator<Item = &'a Keyholder> + 'a {
        self.keyholders().filter(move |k| {
            matches!(&k.kind, KeyholderKind::Device { user_id: u, .. } if u == user_id)
        })
    }

    /// The keyholder holding a generated envkey for a keyable parent.
    pub fn generated_envkey_for(&self, keyable_parent_id: &ObjectId) -> Option<&Keyholder> {
        self.keyholders().find(|k| {
            matches!(&k.kind, KeyholderKind::GeneratedEnvkey { keyable_parent_id: p } if p == keyable_parent_id)
        })
    }

    /// The live grant of `user_id` on `app_id`.
    pub fn app_user_grant(&self, app_id: &ObjectId, user_id: &ObjectId) -> Option<&AppUserGrant> {
        self.live().find_map(|o| match o {
            GraphObject::AppUserGrant(g) if &g.app_id == app_id && &g.user_id == user_id => Some(g),
            _ => None,
        })
    }

    /// Live app→block connections for an app, ordered by `order_index`.
    pub fn blocks_of_app(&self, app_id: &ObjectId) -> Vec<&AppBlock> {
        let mut blocks: Vec<&AppBlock> = self
            .live()
            .filter_map(|o| match o {
                GraphObject::AppBlock(b) if &b.app_id == app_id => Some(b),
                _ => None,
            })
            .filter(|b| self.env_parent(&b.block_id).is_some())
            .collect();
        blocks.sort_by_key(|b| b.order_index);
        blocks
    }

    /// Live app→block connections for a block.
    pub fn apps_of_block(&self, block_id: &ObjectId) -> Vec<&AppBlock> {
        self.live()
            .filter_map(|o| match o {
                GraphObject::AppBlock(b) if &b.block_id == block_id => Some(b),
                _ => None,
            })
            .filter(|b| self.env_parent(&b.app_id).is_some())
            .collect()
    }

    /// The matrix entry for an (app role, environment role) pair.
    pub fn matrix_entry(
        &self,
        app_role_id: &ObjectId,
        environment_role_id: &ObjectId,
    ) -> Option<&AppRoleEnvironmentRole> {
        self.live().find_map(|o| match o {
            GraphObject::AppRoleEnvironmentRole(m)
                if &m.app_role_id == app_role_id
                    && &m.environment_role_id == environment_role_id =>
            {
                Some(m)
            }
            _ => None,
        })
    }

    /// Live overrides owned by an environment whose source is still usable.
    pub fn visible_overrides(&self, environment_id: &ObjectId) -> Vec<&InheritanceOverride> {
        self.live()
            .filter_map(|o| match o {
                GraphObject::InheritanceOverride(io) if &io.environment_id == environment_id => {
                    Some(io)
                }
                _ => None,
            })
            .filter(|io| self.live_environment(&io.source_environment_id).is_some())
            .collect()
    }

    pub fn keyable_parents(&self) -> impl Iterator<Item = &KeyableParent> {
        self.live().filter_map(|o| match o {
            GraphObject::KeyableParent(k) => Some(k),
            _ => None,
        })
    }

    /// Live changeset headers for a scope, ordered by version.
    pub fn changesets_for(&self, scope: &Scope) -> Vec<&ChangesetHeader> {
        let mut headers: Vec<&ChangesetHeader> = self
            .live()
            .filter_map(|o| match o {
                GraphObject::ChangesetHeader(c) if &c.scope == scope => Some(c),
                _ => None,
            })
            .collect();
        headers.sort_by_key(|c| c.version);
        headers
    }

    /// Latest committed version of a scope (0 when never written).
    pub fn scope_version(&self, scope: &Scope) -> u64 {
        self.changesets_for(scope).last().map(|c| c.version).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectMeta;

    fn parent(id: &str) -> GraphObject {
        GraphObject::EnvParent(EnvParent {
            meta: ObjectMeta::new(id, 0),
            kind: EnvParentKind::App,
            name: id.to_string(),
            envs_updated_at: None,
            locals_updated_at: BTreeMap::new(),
        })
    }

    fn env(id: &str, parent: &str, sub_of: Option<&str>) -> GraphObject {
        GraphObject::Environment(Environment {
            meta: ObjectMeta::new(id, 0),
            env_parent_id: parent.into(),
            environment_role_id: "role-dev".into(),
            is_sub: sub_of.is_some(),
            parent_environment_id: sub_of.map(ObjectId::from),
            sub_name: sub_of.map(|_| "feature".to_string()),
        })
    }

    #[test]
    fn test_tombstoned_objects_hidden_but_retained() {
        let mut graph = OrgGraph::from_objects([parent("app"), env("dev", "app", None)]);
        graph.tombstone(&"dev".into(), 5).unwrap();

        assert!(graph.environment(&"dev".into()).is_none());
        assert!(graph.get_any(&"dev".into()).is_some());
        assert_eq!(graph.len(), 2);
        assert!(matches!(
            graph.tombstone(&"dev".into(), 6),
            Err(CoreError::AlreadyDeleted(_))
        ));
    }

    #[test]
    fn test_sub_environment_of_tombstoned_parent_is_missing() {
        let mut graph = OrgGraph::from_objects([
            parent("app"),
            env("dev", "app", None),
            env("dev-feature", "app", Some("dev")),
        ]);
        assert!(graph.live_environment(&"dev-feature".into()).is_some());

        graph.tombstone(&"dev".into(), 1).unwrap();
        assert!(graph.environment(&"dev-feature".into()).is_some());
        assert!(graph.live_environment(&"dev-feature".into()).is_none());
    }

    #[test]
    fn test_apply_leaves_source_untouched() {
        let graph = OrgGraph::from_objects([parent("app")]);
        let mutation = GraphMutation::new()
            .upsert(env("dev", "app", None))
            .tombstone("app");

        let next = graph.apply(&mutation, 10).unwrap();
        assert!(graph.env_parent(&"app".into()).is_some());
        assert!(graph.environment(&"dev".into()).is_none());
        assert!(next.env_parent(&"app".into()).is_none());
        assert!(next.environment(&"dev".into()).is_some());
        assert!(next.live_environment(&"dev".into()).is_none());
    }

    #[test]
    fn test_apply_unknown_tombstone_fails() {
        let graph = OrgGraph::new();
        let mutation = GraphMutation::new().tombstone("ghost");
        assert!(matches!(
            graph.apply(&mutation, 0),
            Err(CoreError::UnknownObject(_))
        ));
    }
}
