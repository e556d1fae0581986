//! Test fixtures and helpers.
//!
//! [`OrgFixture`] builds small but complete org graphs whose keyholders carry
//! real keys and valid signatures chaining to a pinned owner device.

use std::collections::{BTreeMap, BTreeSet};

use envsync_core::{
    pubkey_signing_bytes, AppBlock, AppRole, AppRoleEnvironmentRole, AppUserGrant, EnvCell,
    EnvMap, EnvParent, EnvParentKind, Environment, EnvironmentRole, GraphObject,
    InheritanceOverride, Keyholder, KeyholderKind, ObjectId, ObjectMeta, Org, OrgGraph, OrgRole,
    Permission, RoleDefinition, TrustedRoots,
};
use envsync_perms::PrivateKeyBundle;

pub const OWNER: &str = "owner";
pub const OWNER_DEVICE: &str = "owner-laptop";

pub const ORG_OWNER: &str = "org-owner";
pub const ORG_BASIC: &str = "org-basic";
pub const APP_ADMIN: &str = "app-admin";
pub const APP_DEVELOPER: &str = "app-dev";

pub const ROLE_DEVELOPMENT: &str = "role-development";
pub const ROLE_STAGING: &str = "role-staging";
pub const ROLE_PRODUCTION: &str = "role-production";

pub const PAYMENTS: &str = "payments";
pub const DEVELOPMENT: &str = "development";
pub const STAGING: &str = "staging";
pub const PRODUCTION: &str = "production";

/// An org graph plus the private key seeds of every keyholder in it.
#[derive(Debug, Clone)]
pub struct OrgFixture {
    graph: OrgGraph,
    seeds: BTreeMap<ObjectId, [u8; 32]>,
    roots: TrustedRoots,
    next_seed: u8,
}

impl OrgFixture {
    /// An org with owner and basic org roles, admin and developer app roles,
    /// the three standard environment roles, and an owner whose device is
    /// the pinned root.
    ///
    /// Developers may write development, read staging, and see only the keys
    /// of production.
    pub fn new() -> Self {
        let mut objects = vec![
            GraphObject::Org(Org {
                meta: meta("org"),
                name: "Acme".into(),
            }),
            GraphObject::OrgRole(OrgRole {
                meta: meta(ORG_OWNER),
                name: "Org Owner".into(),
                definition: RoleDefinition::fixed([
                    Permission::OrgManageSettings,
                    Permission::OrgManageUsers,
                    Permission::OrgManageCliUsers,
                    Permission::OrgManageDevices,
                    Permission::OrgManageRoles,
                    Permission::OrgCreateApps,
                    Permission::OrgReadAllBlocks,
                    Permission::OrgWriteAllBlocks,
                ]),
                auto_app_role_id: Some(APP_ADMIN.into()),
            }),
            GraphObject::OrgRole(OrgRole {
                meta: meta(ORG_BASIC),
                name: "Basic User".into(),
                definition: RoleDefinition::default(),
                auto_app_role_id: None,
            }),
            GraphObject::AppRole(AppRole {
                meta: meta(APP_ADMIN),
                name: "Admin".into(),
                definition: RoleDefinition::default(),
                has_full_permissions: true,
            }),
            GraphObject::AppRole(AppRole {
                meta: meta(APP_DEVELOPER),
                name: "Developer".into(),
                definition: RoleDefinition::fixed(Permission::ENVIRONMENT),
                has_full_permissions: false,
            }),
        ];
        for (role, name, permissions) in [
            (ROLE_DEVELOPMENT, "Development", vec![Permission::Write, Permission::ReadHistory]),
            (ROLE_STAGING, "Staging", vec![Permission::Read]),
            (ROLE_PRODUCTION, "Production", vec![Permission::ReadMeta]),
        ] {
            objects.push(GraphObject::EnvironmentRole(EnvironmentRole {
                meta: meta(role),
                name: name.into(),
                has_local_keys: role != ROLE_PRODUCTION,
                has_servers: true,
            }));
            objects.push(GraphObject::AppRoleEnvironmentRole(AppRoleEnvironmentRole {
                meta: meta(&format!("matrix-{}", role)),
                app_role_id: APP_DEVELOPER.into(),
                environment_role_id: role.into(),
                permissions: permissions.into_iter().collect(),
            }));
        }
        objects.push(GraphObject::Keyholder(Keyholder {
            meta: meta(OWNER),
            kind: KeyholderKind::User {
                org_role_id: ORG_OWNER.into(),
                email: "owner@example.com".into(),
            },
            pubkey: None,
            signed_by_id: None,
            signature: None,
        }));

        let mut fixture = Self {
            graph: OrgGraph::from_objects(objects),
            seeds: BTreeMap::new(),
            roots: TrustedRoots::new(),
            next_seed: 1,
        };
        let seed = fixture.fresh_seed();
        let keys = PrivateKeyBundle::from_seed(&seed);
        fixture.graph.upsert(GraphObject::Keyholder(Keyholder {
            meta: meta(OWNER_DEVICE),
            kind: KeyholderKind::Device {
                user_id: OWNER.into(),
                name: "laptop".into(),
            },
            pubkey: Some(keys.public_bundle()),
            signed_by_id: None,
            signature: None,
        }));
        fixture.roots.insert(OWNER_DEVICE.into(), keys.public_bundle());
        fixture.seeds.insert(OWNER_DEVICE.into(), seed);
        fixture
    }

    /// The Payments app with development, staging, and production.
    pub fn payments() -> Self {
        Self::new().with_app(PAYMENTS, [DEVELOPMENT, STAGING, PRODUCTION])
    }

    /// Add an app with one base environment per standard role, in
    /// development, staging, production order.
    pub fn with_app(self, app_id: &str, environment_ids: [&str; 3]) -> Self {
        self.with_env_parent(app_id, EnvParentKind::App, environment_ids)
    }

    /// Add a block with one base environment per standard role.
    pub fn with_block(self, block_id: &str, environment_ids: [&str; 3]) -> Self {
        self.with_env_parent(block_id, EnvParentKind::Block, environment_ids)
    }

    fn with_env_parent(mut self, id: &str, kind: EnvParentKind, environment_ids: [&str; 3]) -> Self {
        self.graph.upsert(GraphObject::EnvParent(EnvParent {
            meta: meta(id),
            kind,
            name: id.into(),
            envs_updated_at: None,
            locals_updated_at: BTreeMap::new(),
        }));
        for (env_id, role) in environment_ids
            .into_iter()
            .zip([ROLE_DEVELOPMENT, ROLE_STAGING, ROLE_PRODUCTION])
        {
            self.graph.upsert(environment(env_id, id, role, None));
        }
        self
    }

    /// Add a sub-environment of `parent_environment_id`.
    pub fn with_sub_environment(mut self, id: &str, parent_environment_id: &str) -> Self {
        let parent = self
            .graph
            .environment(&parent_environment_id.into())
            .cloned()
            .expect("parent environment exists");
        self.graph.upsert(environment(
            id,
            parent.env_parent_id.as_str(),
            parent.environment_role_id.as_str(),
            Some(parent_environment_id),
        ));
        self
    }

    /// Add a user with the given org role and one device, `{user_id}-laptop`,
    /// signed by the owner device.
    pub fn with_user(mut self, user_id: &str, org_role_id: &str) -> Self {
        self.graph.upsert(GraphObject::Keyholder(Keyholder {
            meta: meta(user_id),
            kind: KeyholderKind::User {
                org_role_id: org_role_id.into(),
                email: format!("{}@example.com", user_id),
            },
            pubkey: None,
            signed_by_id: None,
            signature: None,
        }));
        let device_id = device_of(user_id);
        self.with_signed_keyholder(
            &device_id,
            KeyholderKind::Device {
                user_id: user_id.into(),
                name: "laptop".into(),
            },
            OWNER_DEVICE,
        )
    }

    /// Add a keyholder with fresh keys, signed by `signer_id`.
    pub fn with_signed_keyholder(mut self, id: &str, kind: KeyholderKind, signer_id: &str) -> Self {
        let seed = self.fresh_seed();
        let keys = PrivateKeyBundle::from_seed(&seed);
        let bundle = keys.public_bundle();
        let signature = self
            .keys(signer_id)
            .signing
            .sign(&pubkey_signing_bytes(&id.into(), &bundle));
        self.graph.upsert(GraphObject::Keyholder(Keyholder {
            meta: meta(id),
            kind,
            pubkey: Some(bundle),
            signed_by_id: Some(signer_id.into()),
            signature: Some(signature),
        }));
        self.seeds.insert(id.into(), seed);
        self
    }

    /// Give `user_id` a role on an app.
    pub fn with_grant(mut self, app_id: &str, user_id: &str, app_role_id: &str) -> Self {
        self.graph.upsert(GraphObject::AppUserGrant(AppUserGrant {
            meta: meta(&format!("grant-{}-{}", app_id, user_id)),
            app_id: app_id.into(),
            user_id: user_id.into(),
            app_role_id: app_role_id.into(),
        }));
        self
    }

    pub fn with_block_connection(mut self, app_id: &str, block_id: &str) -> Self {
        let order_index = self.graph.blocks_of_app(&app_id.into()).len() as u32;
        self.graph.upsert(GraphObject::AppBlock(AppBlock {
            meta: meta(&format!("link-{}-{}", app_id, block_id)),
            app_id: app_id.into(),
            block_id: block_id.into(),
            order_index,
        }));
        self
    }

    pub fn with_override(mut self, environment_id: &str, source_environment_id: &str) -> Self {
        self.graph.upsert(GraphObject::InheritanceOverride(InheritanceOverride {
            meta: meta(&format!("override-{}-{}", environment_id, source_environment_id)),
            environment_id: environment_id.into(),
            source_environment_id: source_environment_id.into(),
        }));
        self
    }

    /// Flip a bit in a keyholder's signature so its chain no longer verifies.
    pub fn with_corrupt_signature(mut self, keyholder_id: &str) -> Self {
        let mut keyholder = self
            .graph
            .keyholder(&keyholder_id.into())
            .cloned()
            .expect("keyholder exists");
        if let Some(signature) = keyholder.signature.as_mut() {
            signature.0[0] ^= 0x01;
        }
        self.graph.upsert(GraphObject::Keyholder(keyholder));
        self
    }

    pub fn graph(&self) -> &OrgGraph {
        &self.graph
    }

    pub fn into_graph(self) -> OrgGraph {
        self.graph
    }

    /// Pinned roots: the owner device only.
    pub fn roots(&self) -> TrustedRoots {
        self.roots.clone()
    }

    /// Private key seed of a keyholder created by this fixture.
    pub fn seed(&self, keyholder_id: &str) -> [u8; 32] {
        *self
            .seeds
            .get(&ObjectId::new(keyholder_id))
            .unwrap_or_else(|| panic!("fixture has no keys for {}", keyholder_id))
    }

    pub fn keys(&self, keyholder_id: &str) -> PrivateKeyBundle {
        PrivateKeyBundle::from_seed(&self.seed(keyholder_id))
    }

    /// Keyholders with private keys.
    pub fn keyholder_ids(&self) -> BTreeSet<ObjectId> {
        self.seeds.keys().cloned().collect()
    }

    fn fresh_seed(&mut self) -> [u8; 32] {
        let seed = [self.next_seed; 32];
        self.next_seed = self.next_seed.wrapping_add(1);
        seed
    }
}

impl Default for OrgFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// The device [`OrgFixture::with_user`] creates for a user.
pub fn device_of(user_id: &str) -> String {
    format!("{}-laptop", user_id)
}

/// Metadata created at time zero.
pub fn meta(id: &str) -> ObjectMeta {
    ObjectMeta::new(id, 0)
}

pub fn environment(id: &str, env_parent_id: &str, role_id: &str, sub_of: Option<&str>) -> GraphObject {
    GraphObject::Environment(Environment {
        meta: meta(id),
        env_parent_id: env_parent_id.into(),
        environment_role_id: role_id.into(),
        is_sub: sub_of.is_some(),
        parent_environment_id: sub_of.map(ObjectId::new),
        sub_name: sub_of.map(|_| id.to_string()),
    })
}

/// An env of plain values.
pub fn env_map(entries: &[(&str, &str)]) -> EnvMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), EnvCell::value(*v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use envsync_core::{KeyTriple, Part, Scope};
    use envsync_keyset::required_for_keyholder;
    use envsync_perms::{CryptoPool, NativeProvider, PoolConfig, TrustVerifier};

    fn pool() -> CryptoPool<NativeProvider> {
        CryptoPool::new(NativeProvider, PoolConfig::default())
    }

    #[test]
    fn test_every_fixture_keyholder_is_trusted() {
        let fixture = OrgFixture::payments()
            .with_user("alice", ORG_BASIC)
            .with_user("bob", ORG_BASIC);
        let roots = fixture.roots();
        let pool = pool();
        let mut verifier = TrustVerifier::new(fixture.graph(), &roots, &pool);
        for id in fixture.keyholder_ids() {
            verifier.verify(&id).unwrap();
        }
    }

    #[test]
    fn test_corrupt_signature_breaks_chain() {
        let fixture = OrgFixture::payments()
            .with_user("bob", ORG_BASIC)
            .with_corrupt_signature("bob-laptop");
        let roots = fixture.roots();
        let pool = pool();
        let mut verifier = TrustVerifier::new(fixture.graph(), &roots, &pool);
        verifier.verify(&OWNER_DEVICE.into()).unwrap();
        assert!(verifier.verify(&"bob-laptop".into()).is_err());
    }

    #[test]
    fn test_developer_sees_production_meta_only() {
        let fixture = OrgFixture::payments()
            .with_user("alice", ORG_BASIC)
            .with_grant(PAYMENTS, "alice", APP_DEVELOPER);
        let set = required_for_keyholder(fixture.graph(), &"alice-laptop".into(), 0);

        let has = |scope: &str, part: Part| {
            set.contains_triple(&KeyTriple::new("alice-laptop", Scope::environment(scope), part))
        };
        assert!(has(DEVELOPMENT, Part::Env));
        assert!(has(STAGING, Part::Env));
        assert!(has(PRODUCTION, Part::Meta));
        assert!(!has(PRODUCTION, Part::Env));
    }

    #[test]
    fn test_seeds_are_distinct() {
        let fixture = OrgFixture::new().with_user("alice", ORG_BASIC);
        assert_ne!(fixture.seed(OWNER_DEVICE), fixture.seed("alice-laptop"));
    }
}
