//! Keyset Requirement Calculator.
//!
//! Maps a graph snapshot and a timestamp to the complete [`KeySet`] of
//! envelopes that must exist. The result depends only on those two inputs:
//! iteration is over ordered maps and no clock or randomness is consulted.
//!
//! Two kinds of recipient are handled:
//!
//! - **Actor keyholders** (users, CLI users, devices, invites, device
//!   grants) receive parts according to the permissions of the actor they
//!   act for.
//! - **Generated envkeys** belong to a server or local key bound to one app
//!   environment and receive that environment's values, its connected
//!   blocks' matching environments, and every visible inheritance override.

use std::collections::BTreeSet;

use envsync_core::{
    Environment, KeySet, KeyableParent, KeyableParentKind, Keyholder, KeyholderKind, ObjectId,
    OrgGraph, Part, Permission, PermissionSet, Scope,
};
use envsync_perms::PermissionResolver;

/// Computes required envelopes over one graph snapshot at one instant.
pub struct KeysetCalculator<'g> {
    graph: &'g OrgGraph,
    resolver: PermissionResolver<'g>,
    now: i64,
}

impl<'g> KeysetCalculator<'g> {
    pub fn new(graph: &'g OrgGraph, now: i64) -> Self {
        Self {
            graph,
            resolver: PermissionResolver::new(graph),
            now,
        }
    }

    /// The resolver this calculator consults.
    pub fn resolver(&self) -> &PermissionResolver<'g> {
        &self.resolver
    }

    /// Every required triple.
    pub fn required_keyset(&self) -> KeySet {
        let scopes = self.scopes();
        let mut keyset = KeySet::new();
        for keyholder in self.graph.keyholders() {
            self.add_keyholder(&mut keyset, keyholder, &scopes);
        }
        tracing::debug!(
            triples = keyset.len(),
            scopes = scopes.len(),
            "computed required keyset"
        );
        keyset
    }

    /// Required triples for one keyholder. Empty for missing or inactive
    /// keyholders.
    pub fn required_for_keyholder(&self, keyholder_id: &ObjectId) -> KeySet {
        let mut keyset = KeySet::new();
        if let Some(keyholder) = self.graph.keyholder(keyholder_id) {
            self.add_keyholder(&mut keyset, keyholder, &self.scopes());
        }
        keyset
    }

    /// Every encryptable scope: live environments and per-user locals.
    fn scopes(&self) -> Vec<Scope> {
        let users: Vec<&ObjectId> = self.graph.org_users().map(|u| u.id()).collect();
        let mut scopes = Vec::new();
        for parent in self.graph.env_parents() {
            for env in self.graph.environments_of(&parent.meta.id) {
                scopes.push(Scope::Environment(env.meta.id.clone()));
            }
            for user in &users {
                scopes.push(Scope::locals(parent.meta.id.clone(), (*user).clone()));
            }
        }
        scopes
    }

    fn add_keyholder(&self, keyset: &mut KeySet, keyholder: &Keyholder, scopes: &[Scope]) {
        if !keyholder.is_active_recipient(self.now) {
            return;
        }
        if let KeyholderKind::GeneratedEnvkey { keyable_parent_id } = &keyholder.kind {
            if let Some(keyable) = self.graph.keyable_parent(keyable_parent_id) {
                self.add_generated_envkey(keyset, keyholder.id(), keyable);
            }
            return;
        }
        let Some(actor_id) = keyholder.actor_id() else {
            return;
        };
        for scope in scopes {
            let perms = self.resolver.scope_permissions(scope, actor_id);
            self.add_parts(keyset, keyholder.id(), scope, &perms);
        }
    }

    /// Translate a permission set on a scope into required parts.
    fn add_parts(&self, keyset: &mut KeySet, recipient: &ObjectId, scope: &Scope, perms: &PermissionSet) {
        if perms.contains(&Permission::Read) {
            keyset.insert(recipient, scope, Part::Env);
            if let Scope::Environment(env_id) = scope {
                for io in self.graph.visible_overrides(env_id) {
                    keyset.insert(
                        recipient,
                        scope,
                        Part::InheritanceOverride(io.source_environment_id.clone()),
                    );
                }
            }
        }
        if perms.contains(&Permission::ReadMeta) {
            keyset.insert(recipient, scope, Part::Meta);
        }
        if perms.contains(&Permission::ReadInherits) {
            keyset.insert(recipient, scope, Part::Inherits);
        }
        if perms.contains(&Permission::ReadHistory) {
            for header in self.graph.changesets_for(scope) {
                keyset.insert(recipient, scope, Part::Changeset(header.meta.id.clone()));
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Generated envkeys
    // ─────────────────────────────────────────────────────────────────────────

    fn add_generated_envkey(&self, keyset: &mut KeySet, recipient: &ObjectId, keyable: &KeyableParent) {
        let Some(app) = self.graph.env_parent(&keyable.app_id) else {
            return;
        };
        if !app.is_app() {
            return;
        }
        let Some(env) = self.graph.live_environment(&keyable.environment_id) else {
            return;
        };
        if env.env_parent_id != app.meta.id {
            return;
        }

        if let KeyableParentKind::LocalKey { user_id } = &keyable.kind {
            let owner_reads = self
                .resolver
                .scope_permissions(&Scope::Environment(env.meta.id.clone()), user_id)
                .contains(&Permission::Read);
            if !owner_reads {
                return;
            }
            keyset.insert(recipient, &Scope::locals(app.meta.id.clone(), user_id.clone()), Part::Env);
            for link in self.graph.blocks_of_app(&app.meta.id) {
                keyset.insert(
                    recipient,
                    &Scope::locals(link.block_id.clone(), user_id.clone()),
                    Part::Env,
                );
            }
        }

        self.add_bound_environment(keyset, recipient, env);

        for link in self.graph.blocks_of_app(&app.meta.id) {
            if let Some(block_env) = self.block_counterpart(&link.block_id, env) {
                self.add_bound_environment(keyset, recipient, block_env);
            }
        }
    }

    /// `Env` plus visible overrides on `env`; for a sub-environment, also its
    /// parent and the parent's overrides the sub does not shadow.
    fn add_bound_environment(&self, keyset: &mut KeySet, recipient: &ObjectId, env: &Environment) {
        let scope = Scope::Environment(env.meta.id.clone());
        keyset.insert(recipient, &scope, Part::Env);
        let own = self.graph.visible_overrides(&env.meta.id);
        let shadowed: BTreeSet<&ObjectId> = own.iter().map(|io| &io.source_environment_id).collect();
        for io in &own {
            keyset.insert(
                recipient,
                &scope,
                Part::InheritanceOverride(io.source_environment_id.clone()),
            );
        }

        if !env.is_sub {
            return;
        }
        let Some(parent_id) = &env.parent_environment_id else {
            return;
        };
        let parent_scope = Scope::Environment(parent_id.clone());
        keyset.insert(recipient, &parent_scope, Part::Env);
        for io in self.graph.visible_overrides(parent_id) {
            if shadowed.contains(&io.source_environment_id) {
                continue;
            }
            keyset.insert(
                recipient,
                &parent_scope,
                Part::InheritanceOverride(io.source_environment_id.clone()),
            );
        }
    }

    /// The block environment matching an app environment: same environment
    /// role, and same sub-environment name when the app environment is a sub.
    fn block_counterpart(&self, block_id: &ObjectId, env: &Environment) -> Option<&'g Environment> {
        let base = self
            .graph
            .base_environment_with_role(block_id, &env.environment_role_id)?;
        if !env.is_sub {
            return Some(base);
        }
        match env.sub_name.as_deref() {
            Some(name) => Some(
                self.graph
                    .sub_environment_named(&base.meta.id, name)
                    .unwrap_or(base),
            ),
            None => Some(base),
        }
    }
}

/// Every envelope the graph requires at `now`.
pub fn required_keyset(graph: &OrgGraph, now: i64) -> KeySet {
    KeysetCalculator::new(graph, now).required_keyset()
}

/// The envelopes one keyholder requires at `now`.
pub fn required_for_keyholder(graph: &OrgGraph, keyholder_id: &ObjectId, now: i64) -> KeySet {
    KeysetCalculator::new(graph, now).required_for_keyholder(keyholder_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use envsync_core::{
        AppBlock, AppRole, AppRoleEnvironmentRole, AppUserGrant, ChangesetHeader, EnvParent,
        EnvParentKind, EnvironmentRole, GraphObject, InheritanceOverride, KeyTriple,
        ObjectMeta, OrgRole, PublicKeyBundle, RoleDefinition,
    };
    use envsync_core::{Ed25519PublicKey, X25519PublicKey};
    use std::collections::BTreeMap;

    fn meta(id: &str) -> ObjectMeta {
        ObjectMeta::new(id, 0)
    }

    fn key(b: u8) -> Option<PublicKeyBundle> {
        Some(PublicKeyBundle {
            signing: Ed25519PublicKey([b; 32]),
            encryption: X25519PublicKey([b; 32]),
        })
    }

    fn keyholder(id: &str, kind: KeyholderKind, pubkey: Option<PublicKeyBundle>) -> GraphObject {
        GraphObject::Keyholder(Keyholder {
            meta: meta(id),
            kind,
            pubkey,
            signed_by_id: None,
            signature: None,
        })
    }

    fn env(id: &str, parent: &str, role: &str, sub_of: Option<&str>) -> GraphObject {
        GraphObject::Environment(Environment {
            meta: meta(id),
            env_parent_id: parent.into(),
            environment_role_id: role.into(),
            is_sub: sub_of.is_some(),
            parent_environment_id: sub_of.map(ObjectId::from),
            sub_name: sub_of.map(|_| "feature".to_string()),
        })
    }

    fn parent(id: &str, kind: EnvParentKind) -> GraphObject {
        GraphObject::EnvParent(EnvParent {
            meta: meta(id),
            kind,
            name: id.into(),
            envs_updated_at: None,
            locals_updated_at: BTreeMap::new(),
        })
    }

    /// Payments app with Development/Staging/Production; alice is a
    /// developer with one device.
    fn payments() -> OrgGraph {
        let mut objects = vec![
            GraphObject::OrgRole(OrgRole {
                meta: meta("org-basic"),
                name: "Basic".into(),
                definition: RoleDefinition::default(),
                auto_app_role_id: None,
            }),
            GraphObject::AppRole(AppRole {
                meta: meta("app-dev"),
                name: "Developer".into(),
                definition: RoleDefinition::fixed(Permission::ENVIRONMENT),
                has_full_permissions: false,
            }),
            parent("payments", EnvParentKind::App),
        ];
        for (name, perms) in [
            ("development", vec![Permission::Write]),
            ("staging", vec![Permission::Read]),
            ("production", vec![Permission::ReadMeta]),
        ] {
            objects.push(GraphObject::EnvironmentRole(EnvironmentRole {
                meta: meta(&format!("role-{}", name)),
                name: name.into(),
                has_local_keys: true,
                has_servers: true,
            }));
            objects.push(GraphObject::AppRoleEnvironmentRole(AppRoleEnvironmentRole {
                meta: meta(&format!("m-{}", name)),
                app_role_id: "app-dev".into(),
                environment_role_id: format!("role-{}", name).into(),
                permissions: perms.into_iter().collect(),
            }));
            objects.push(env(name, "payments", &format!("role-{}", name), None));
        }
        objects.push(keyholder(
            "alice",
            KeyholderKind::User {
                org_role_id: "org-basic".into(),
                email: "alice@example.com".into(),
            },
            None,
        ));
        objects.push(keyholder(
            "alice-laptop",
            KeyholderKind::Device {
                user_id: "alice".into(),
                name: "laptop".into(),
            },
            key(1),
        ));
        objects.push(GraphObject::AppUserGrant(AppUserGrant {
            meta: meta("grant-alice"),
            app_id: "payments".into(),
            user_id: "alice".into(),
            app_role_id: "app-dev".into(),
        }));
        OrgGraph::from_objects(objects)
    }

    fn has(set: &KeySet, r: &str, scope: Scope, part: Part) -> bool {
        set.contains_triple(&KeyTriple::new(r, scope, part))
    }

    #[test]
    fn test_payments_keyset() {
        let graph = payments();
        let set = required_keyset(&graph, 0);
        let dev = "alice-laptop";

        assert!(has(&set, dev, Scope::environment("development"), Part::Env));
        assert!(has(&set, dev, Scope::environment("development"), Part::Meta));
        assert!(has(&set, dev, Scope::environment("staging"), Part::Env));
        assert!(has(&set, dev, Scope::environment("production"), Part::Meta));
        assert!(!has(&set, dev, Scope::environment("production"), Part::Env));
        assert!(!has(&set, dev, Scope::environment("production"), Part::Inherits));
        assert!(has(&set, dev, Scope::locals("payments", "alice"), Part::Env));

        // users without pubkeys hold nothing directly
        assert!(set.for_recipient(&"alice".into()).is_none());
    }

    #[test]
    fn test_history_requires_each_changeset() {
        let mut graph = payments();
        for v in 1..=2u64 {
            graph.upsert(GraphObject::ChangesetHeader(ChangesetHeader {
                meta: meta(&format!("cs-{}", v)),
                env_parent_id: "payments".into(),
                scope: Scope::locals("payments", "alice"),
                version: v,
                created_by_id: "alice-laptop".into(),
            }));
        }
        let set = required_keyset(&graph, 0);
        let locals = Scope::locals("payments", "alice");
        assert!(has(&set, "alice-laptop", locals.clone(), Part::Changeset("cs-1".into())));
        assert!(has(&set, "alice-laptop", locals, Part::Changeset("cs-2".into())));
    }

    #[test]
    fn test_expired_invite_gets_nothing() {
        let mut graph = payments();
        graph.upsert(keyholder(
            "invite-bob",
            KeyholderKind::Invite {
                invitee_id: "alice".into(),
                expires_at: 100,
                accepted_at: None,
            },
            key(2),
        ));
        assert!(!required_for_keyholder(&graph, &"invite-bob".into(), 50).is_empty());
        assert!(required_for_keyholder(&graph, &"invite-bob".into(), 100).is_empty());
    }

    #[test]
    fn test_override_follows_env_requirement() {
        let mut graph = payments();
        graph.upsert(GraphObject::InheritanceOverride(InheritanceOverride {
            meta: meta("io-staging-from-dev"),
            environment_id: "staging".into(),
            source_environment_id: "development".into(),
        }));
        graph.upsert(GraphObject::InheritanceOverride(InheritanceOverride {
            meta: meta("io-prod-from-dev"),
            environment_id: "production".into(),
            source_environment_id: "development".into(),
        }));
        let set = required_keyset(&graph, 0);
        let o = Part::InheritanceOverride("development".into());
        assert!(has(&set, "alice-laptop", Scope::environment("staging"), o.clone()));
        assert!(!has(&set, "alice-laptop", Scope::environment("production"), o));
    }

    #[test]
    fn test_generated_envkey_with_sub_environment_shadowing() {
        let mut graph = payments();
        graph.upsert(env("staging-feature", "payments", "role-staging", Some("staging")));
        for (id, owner, source) in [
            ("io-parent-dev", "staging", "development"),
            ("io-parent-prod", "staging", "production"),
            ("io-sub-dev", "staging-feature", "development"),
        ] {
            graph.upsert(GraphObject::InheritanceOverride(InheritanceOverride {
                meta: meta(id),
                environment_id: owner.into(),
                source_environment_id: source.into(),
            }));
        }
        graph.upsert(GraphObject::KeyableParent(KeyableParent {
            meta: meta("server-1"),
            kind: KeyableParentKind::Server,
            name: "web".into(),
            app_id: "payments".into(),
            environment_id: "staging-feature".into(),
        }));
        graph.upsert(keyholder(
            "envkey-1",
            KeyholderKind::GeneratedEnvkey {
                keyable_parent_id: "server-1".into(),
            },
            key(3),
        ));

        let set = required_for_keyholder(&graph, &"envkey-1".into(), 0);
        let sub = Scope::environment("staging-feature");
        let base = Scope::environment("staging");
        assert!(has(&set, "envkey-1", sub.clone(), Part::Env));
        assert!(has(&set, "envkey-1", sub, Part::InheritanceOverride("development".into())));
        assert!(has(&set, "envkey-1", base.clone(), Part::Env));
        assert!(has(&set, "envkey-1", base.clone(), Part::InheritanceOverride("production".into())));
        assert!(!has(&set, "envkey-1", base, Part::InheritanceOverride("development".into())));
        assert!(!has(&set, "envkey-1", Scope::environment("production"), Part::Env));
    }

    #[test]
    fn test_generated_envkey_includes_connected_block() {
        let mut graph = payments();
        graph.upsert(parent("shared", EnvParentKind::Block));
        graph.upsert(env("shared-staging", "shared", "role-staging", None));
        graph.upsert(GraphObject::AppBlock(AppBlock {
            meta: meta("link"),
            app_id: "payments".into(),
            block_id: "shared".into(),
            order_index: 0,
        }));
        graph.upsert(GraphObject::KeyableParent(KeyableParent {
            meta: meta("local-1"),
            kind: KeyableParentKind::LocalKey {
                user_id: "alice".into(),
            },
            name: "alice local".into(),
            app_id: "payments".into(),
            environment_id: "staging".into(),
        }));
        graph.upsert(keyholder(
            "envkey-local",
            KeyholderKind::GeneratedEnvkey {
                keyable_parent_id: "local-1".into(),
            },
            key(4),
        ));

        let set = required_for_keyholder(&graph, &"envkey-local".into(), 0);
        assert!(has(&set, "envkey-local", Scope::environment("staging"), Part::Env));
        assert!(has(&set, "envkey-local", Scope::environment("shared-staging"), Part::Env));
        assert!(has(&set, "envkey-local", Scope::locals("payments", "alice"), Part::Env));
        assert!(has(&set, "envkey-local", Scope::locals("shared", "alice"), Part::Env));

        // owner loses read on the bound environment: the local key goes dark
        graph.tombstone(&"grant-alice".into(), 1).unwrap();
        assert!(required_for_keyholder(&graph, &"envkey-local".into(), 0).is_empty());
    }

    #[test]
    fn test_deterministic() {
        let graph = payments();
        assert_eq!(required_keyset(&graph, 7), required_keyset(&graph, 7));
    }
}
