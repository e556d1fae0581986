//! Authorized graph mutations.
//!
//! A [`Mutation`] is a user-level intent ("invite this user", "grant this
//! app role"). [`Mutation::authorize`] checks the actor against the current
//! graph before any crypto work, and [`Mutation::build`] turns the intent into
//! a [`GraphMutation`] plus any key seeds that must be handed to the new
//! keyholders out of band.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use envsync_core::{
    pubkey_signing_bytes, AppBlock, AppRoleEnvironmentRole, AppUserGrant, Environment, GraphMutation,
    GraphObject, InheritanceOverride, KeyableParent, KeyableParentKind, Keyholder, KeyholderKind,
    ObjectId, ObjectMeta, OrgGraph, Permission, PermissionSet,
};
use envsync_perms::{CryptoProvider, PermissionResolver, PrivateKeyBundle};

use crate::error::{ClientError, Result};

/// A change to the org graph requested by the session's actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
    CreateEnvironment {
        env_parent_id: ObjectId,
        environment_role_id: ObjectId,
    },
    CreateSubEnvironment {
        parent_environment_id: ObjectId,
        sub_name: String,
    },
    DeleteEnvironment {
        environment_id: ObjectId,
    },
    GrantAppAccess {
        app_id: ObjectId,
        user_id: ObjectId,
        app_role_id: ObjectId,
    },
    RevokeAppAccess {
        app_id: ObjectId,
        user_id: ObjectId,
    },
    ConnectBlock {
        app_id: ObjectId,
        block_id: ObjectId,
    },
    DisconnectBlock {
        app_id: ObjectId,
        block_id: ObjectId,
    },
    /// Create a user and an invite keyholder for them.
    InviteUser {
        email: String,
        org_role_id: ObjectId,
    },
    /// Let an existing user add a device.
    GrantDevice {
        user_id: ObjectId,
    },
    RemoveDevice {
        device_id: ObjectId,
    },
    /// Tombstone a user with their devices, pending invites and grants, app
    /// access, and local keys.
    RemoveUser {
        user_id: ObjectId,
    },
    CreateServer {
        app_id: ObjectId,
        environment_id: ObjectId,
        name: String,
    },
    /// A local development key owned by the actor.
    CreateLocalKey {
        app_id: ObjectId,
        environment_id: ObjectId,
        name: String,
    },
    AddInheritanceOverride {
        environment_id: ObjectId,
        source_environment_id: ObjectId,
    },
    SetMatrixEntry {
        app_role_id: ObjectId,
        environment_role_id: ObjectId,
        permissions: PermissionSet,
    },
    /// Re-sign a keyholder's existing pubkey with the actor's key, repairing
    /// a broken trust chain.
    ResignKeyholder {
        keyholder_id: ObjectId,
    },
}

/// A private key seed for a keyholder created by a mutation. The seed never
/// reaches the server.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedKey {
    pub keyholder_id: ObjectId,
    pub seed: [u8; 32],
}

impl std::fmt::Debug for IssuedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedKey")
            .field("keyholder_id", &self.keyholder_id)
            .finish_non_exhaustive()
    }
}

/// Output of [`Mutation::build`].
#[derive(Debug, Clone, Default)]
pub struct BuiltMutation {
    pub graph_mutation: GraphMutation,
    /// Ids of objects created, in creation order.
    pub created: Vec<ObjectId>,
    pub issued: Vec<IssuedKey>,
}

/// Everything `build` needs besides the mutation itself.
pub struct BuildContext<'a, P: CryptoProvider> {
    pub graph: &'a OrgGraph,
    /// Keyholder signing new pubkeys.
    pub signer_id: &'a ObjectId,
    pub signer_keys: &'a PrivateKeyBundle,
    pub provider: &'a P,
    pub now: i64,
    pub invite_ttl_ms: i64,
    pub device_grant_ttl_ms: i64,
}

impl<'a, P: CryptoProvider> BuildContext<'a, P> {
    /// A keyholder with fresh keys, signed by the session. The seed is
    /// recorded in `out.issued`.
    fn signed_keyholder(&self, kind: KeyholderKind, out: &mut BuiltMutation) -> ObjectId {
        let id = ObjectId::generate();
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let bundle = PrivateKeyBundle::from_seed(&seed).public_bundle();
        let signature = self.provider.sign(&pubkey_signing_bytes(&id, &bundle), self.signer_keys);

        out.graph_mutation.upserts.push(GraphObject::Keyholder(Keyholder {
            meta: ObjectMeta::new(id.clone(), self.now),
            kind,
            pubkey: Some(bundle),
            signed_by_id: Some(self.signer_id.clone()),
            signature: Some(signature),
        }));
        out.created.push(id.clone());
        out.issued.push(IssuedKey {
            keyholder_id: id.clone(),
            seed,
        });
        id
    }
}

impl Mutation {
    /// Short name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::CreateEnvironment { .. } => "create_environment",
            Mutation::CreateSubEnvironment { .. } => "create_sub_environment",
            Mutation::DeleteEnvironment { .. } => "delete_environment",
            Mutation::GrantAppAccess { .. } => "grant_app_access",
            Mutation::RevokeAppAccess { .. } => "revoke_app_access",
            Mutation::ConnectBlock { .. } => "connect_block",
            Mutation::DisconnectBlock { .. } => "disconnect_block",
            Mutation::InviteUser { .. } => "invite_user",
            Mutation::GrantDevice { .. } => "grant_device",
            Mutation::RemoveDevice { .. } => "remove_device",
            Mutation::RemoveUser { .. } => "remove_user",
            Mutation::CreateServer { .. } => "create_server",
            Mutation::CreateLocalKey { .. } => "create_local_key",
            Mutation::AddInheritanceOverride { .. } => "add_inheritance_override",
            Mutation::SetMatrixEntry { .. } => "set_matrix_entry",
            Mutation::ResignKeyholder { .. } => "resign_keyholder",
        }
    }

    /// The (scope id, permission) the actor must hold, or `None` for
    /// self-service changes.
    ///
    /// `actor_id` is the user or CLI user behind the session keyholder.
    pub fn required_permission(
        &self,
        graph: &OrgGraph,
        actor_id: &ObjectId,
    ) -> Result<Option<(String, Permission)>> {
        let required = match self {
            Mutation::CreateEnvironment { env_parent_id, .. } => {
                Some((env_parent_id.to_string(), Permission::AppManageEnvironments))
            }
            Mutation::CreateSubEnvironment {
                parent_environment_id,
                ..
            } => {
                let parent = live_environment(graph, parent_environment_id)?;
                Some((parent.env_parent_id.to_string(), Permission::AppManageEnvironments))
            }
            Mutation::DeleteEnvironment { environment_id } => {
                let env = live_environment(graph, environment_id)?;
                Some((env.env_parent_id.to_string(), Permission::AppManageEnvironments))
            }
            Mutation::GrantAppAccess { app_id, .. } | Mutation::RevokeAppAccess { app_id, .. } => {
                Some((app_id.to_string(), Permission::AppManageUsers))
            }
            Mutation::ConnectBlock { app_id, .. } | Mutation::DisconnectBlock { app_id, .. } => {
                Some((app_id.to_string(), Permission::AppManageEnvironments))
            }
            Mutation::InviteUser { .. } | Mutation::RemoveUser { .. } => {
                Some((String::new(), Permission::OrgManageUsers))
            }
            Mutation::GrantDevice { user_id } => {
                (user_id != actor_id).then(|| (String::new(), Permission::OrgManageDevices))
            }
            Mutation::RemoveDevice { device_id } => {
                let device = graph
                    .keyholder(device_id)
                    .ok_or_else(|| ClientError::UnknownObject(device_id.clone()))?;
                (device.actor_id() != Some(actor_id)).then(|| (String::new(), Permission::OrgManageDevices))
            }
            Mutation::CreateServer { app_id, .. } => Some((app_id.to_string(), Permission::AppManageServers)),
            Mutation::CreateLocalKey { environment_id, .. } => {
                Some((environment_id.to_string(), Permission::Read))
            }
            Mutation::AddInheritanceOverride { environment_id, .. } => {
                Some((environment_id.to_string(), Permission::Write))
            }
            Mutation::SetMatrixEntry { .. } => Some((String::new(), Permission::OrgManageRoles)),
            Mutation::ResignKeyholder { .. } => Some((String::new(), Permission::OrgManageDevices)),
        };
        Ok(required)
    }

    /// Fail with `PermissionDenied` unless `actor_keyholder_id` may perform
    /// this mutation on `graph`.
    pub fn authorize(&self, graph: &OrgGraph, actor_keyholder_id: &ObjectId) -> Result<()> {
        let actor_id = graph
            .keyholder(actor_keyholder_id)
            .and_then(|k| k.actor_id())
            .cloned()
            .ok_or_else(|| ClientError::NotLoaded(actor_keyholder_id.clone()))?;
        if let Some((scope_id, permission)) = self.required_permission(graph, &actor_id)? {
            PermissionResolver::new(graph).require(&scope_id, actor_keyholder_id, permission)?;
        }
        Ok(())
    }

    /// Build the graph mutation. Validates references against `ctx.graph`.
    pub fn build<P: CryptoProvider>(&self, ctx: &BuildContext<'_, P>) -> Result<BuiltMutation> {
        let graph = ctx.graph;
        let now = ctx.now;
        let mut out = BuiltMutation::default();

        match self {
            Mutation::CreateEnvironment {
                env_parent_id,
                environment_role_id,
            } => {
                graph
                    .env_parent(env_parent_id)
                    .ok_or_else(|| ClientError::UnknownObject(env_parent_id.clone()))?;
                graph
                    .environment_role(environment_role_id)
                    .ok_or_else(|| ClientError::UnknownObject(environment_role_id.clone()))?;
                if graph
                    .base_environment_with_role(env_parent_id, environment_role_id)
                    .is_some()
                {
                    return Err(ClientError::InvalidMutation(format!(
                        "{} already has an environment with role {}",
                        env_parent_id, environment_role_id
                    )));
                }
                let id = ObjectId::generate();
                out.graph_mutation.upserts.push(GraphObject::Environment(Environment {
                    meta: ObjectMeta::new(id.clone(), now),
                    env_parent_id: env_parent_id.clone(),
                    environment_role_id: environment_role_id.clone(),
                    is_sub: false,
                    parent_environment_id: None,
                    sub_name: None,
                }));
                out.created.push(id);
            }

            Mutation::CreateSubEnvironment {
                parent_environment_id,
                sub_name,
            } => {
                let parent = live_environment(graph, parent_environment_id)?;
                if parent.is_sub {
                    return Err(ClientError::InvalidMutation(
                        "sub-environments cannot be nested".to_string(),
                    ));
                }
                if graph.sub_environment_named(parent_environment_id, sub_name).is_some() {
                    return Err(ClientError::InvalidMutation(format!(
                        "sub-environment {} already exists",
                        sub_name
                    )));
                }
                let id = ObjectId::generate();
                out.graph_mutation.upserts.push(GraphObject::Environment(Environment {
                    meta: ObjectMeta::new(id.clone(), now),
                    env_parent_id: parent.env_parent_id.clone(),
                    environment_role_id: parent.environment_role_id.clone(),
                    is_sub: true,
                    parent_environment_id: Some(parent_environment_id.clone()),
                    sub_name: Some(sub_name.clone()),
                }));
                out.created.push(id);
            }

            Mutation::DeleteEnvironment { environment_id } => {
                live_environment(graph, environment_id)?;
                let mut mutation = GraphMutation::new().tombstone(environment_id.clone());
                for sub in graph
                    .environments()
                    .filter(|e| e.parent_environment_id.as_ref() == Some(environment_id))
                {
                    mutation = mutation.tombstone(sub.meta.id.clone());
                }
                out.graph_mutation = mutation;
            }

            Mutation::GrantAppAccess {
                app_id,
                user_id,
                app_role_id,
            } => {
                require_app(graph, app_id)?;
                graph
                    .keyholder(user_id)
                    .filter(|k| k.is_org_user())
                    .ok_or_else(|| ClientError::UnknownObject(user_id.clone()))?;
                graph
                    .app_role(app_role_id)
                    .ok_or_else(|| ClientError::UnknownObject(app_role_id.clone()))?;
                let grant = match graph.app_user_grant(app_id, user_id) {
                    Some(existing) => {
                        let mut grant = existing.clone();
                        grant.app_role_id = app_role_id.clone();
                        grant.meta.updated_at = now;
                        grant
                    }
                    None => AppUserGrant {
                        meta: ObjectMeta::new(ObjectId::generate(), now),
                        app_id: app_id.clone(),
                        user_id: user_id.clone(),
                        app_role_id: app_role_id.clone(),
                    },
                };
                out.created.push(grant.meta.id.clone());
                out.graph_mutation.upserts.push(GraphObject::AppUserGrant(grant));
            }

            Mutation::RevokeAppAccess { app_id, user_id } => {
                let grant = graph.app_user_grant(app_id, user_id).ok_or_else(|| {
                    ClientError::InvalidMutation(format!("{} has no grant on {}", user_id, app_id))
                })?;
                out.graph_mutation = GraphMutation::new().tombstone(grant.meta.id.clone());
            }

            Mutation::ConnectBlock { app_id, block_id } => {
                require_app(graph, app_id)?;
                let block = graph
                    .env_parent(block_id)
                    .filter(|p| p.is_block())
                    .ok_or_else(|| ClientError::UnknownObject(block_id.clone()))?;
                let existing = graph.blocks_of_app(app_id);
                if existing.iter().any(|b| &b.block_id == block_id) {
                    return Err(ClientError::InvalidMutation(format!(
                        "{} is already connected to {}",
                        block_id, app_id
                    )));
                }
                let id = ObjectId::generate();
                out.graph_mutation.upserts.push(GraphObject::AppBlock(AppBlock {
                    meta: ObjectMeta::new(id.clone(), now),
                    app_id: app_id.clone(),
                    block_id: block.meta.id.clone(),
                    order_index: existing.len() as u32,
                }));
                out.created.push(id);
            }

            Mutation::DisconnectBlock { app_id, block_id } => {
                let connection = graph
                    .blocks_of_app(app_id)
                    .into_iter()
                    .find(|b| &b.block_id == block_id)
                    .ok_or_else(|| {
                        ClientError::InvalidMutation(format!("{} is not connected to {}", block_id, app_id))
                    })?;
                out.graph_mutation = GraphMutation::new().tombstone(connection.meta.id.clone());
            }

            Mutation::InviteUser { email, org_role_id } => {
                graph
                    .org_role(org_role_id)
                    .ok_or_else(|| ClientError::UnknownObject(org_role_id.clone()))?;
                let user_id = ObjectId::generate();
                out.graph_mutation.upserts.push(GraphObject::Keyholder(Keyholder {
                    meta: ObjectMeta::new(user_id.clone(), now),
                    kind: KeyholderKind::User {
                        org_role_id: org_role_id.clone(),
                        email: email.clone(),
                    },
                    pubkey: None,
                    signed_by_id: None,
                    signature: None,
                }));
                out.created.push(user_id.clone());
                ctx.signed_keyholder(
                    KeyholderKind::Invite {
                        invitee_id: user_id,
                        expires_at: now + ctx.invite_ttl_ms,
                        accepted_at: None,
                    },
                    &mut out,
                );
            }

            Mutation::GrantDevice { user_id } => {
                graph
                    .keyholder(user_id)
                    .filter(|k| k.org_role_id().is_some())
                    .ok_or_else(|| ClientError::UnknownObject(user_id.clone()))?;
                ctx.signed_keyholder(
                    KeyholderKind::DeviceGrant {
                        grantee_id: user_id.clone(),
                        expires_at: now + ctx.device_grant_ttl_ms,
                        accepted_at: None,
                    },
                    &mut out,
                );
            }

            Mutation::RemoveDevice { device_id } => {
                graph
                    .keyholder(device_id)
                    .filter(|k| matches!(k.kind, KeyholderKind::Device { .. }))
                    .ok_or_else(|| ClientError::UnknownObject(device_id.clone()))?;
                if device_id == ctx.signer_id {
                    return Err(ClientError::InvalidMutation(
                        "a session cannot remove its own device".to_string(),
                    ));
                }
                out.graph_mutation = GraphMutation::new().tombstone(device_id.clone());
            }

            Mutation::RemoveUser { user_id } => {
                graph
                    .keyholder(user_id)
                    .filter(|k| k.is_org_user())
                    .ok_or_else(|| ClientError::UnknownObject(user_id.clone()))?;
                let mut mutation = GraphMutation::new().tombstone(user_id.clone());
                for keyholder in graph.keyholders() {
                    if keyholder.id() != user_id && keyholder.actor_id() == Some(user_id) {
                        mutation = mutation.tombstone(keyholder.id().clone());
                    }
                }
                for object in graph.live() {
                    match object {
                        GraphObject::AppUserGrant(g) if &g.user_id == user_id => {
                            mutation = mutation.tombstone(g.meta.id.clone());
                        }
                        GraphObject::KeyableParent(k)
                            if matches!(&k.kind, KeyableParentKind::LocalKey { user_id: owner } if owner == user_id) =>
                        {
                            mutation = mutation.tombstone(k.meta.id.clone());
                            if let Some(envkey) = graph.generated_envkey_for(&k.meta.id) {
                                mutation = mutation.tombstone(envkey.id().clone());
                            }
                        }
                        _ => {}
                    }
                }
                if mutation.tombstones.contains(ctx.signer_id) {
                    return Err(ClientError::InvalidMutation(
                        "a session cannot remove its own user".to_string(),
                    ));
                }
                out.graph_mutation = mutation;
            }

            Mutation::CreateServer {
                app_id,
                environment_id,
                name,
            } => {
                keyable_environment(graph, app_id, environment_id, |role| role.has_servers)?;
                let keyable_id = ObjectId::generate();
                out.graph_mutation.upserts.push(GraphObject::KeyableParent(KeyableParent {
                    meta: ObjectMeta::new(keyable_id.clone(), now),
                    kind: KeyableParentKind::Server,
                    name: name.clone(),
                    app_id: app_id.clone(),
                    environment_id: environment_id.clone(),
                }));
                out.created.push(keyable_id.clone());
                ctx.signed_keyholder(
                    KeyholderKind::GeneratedEnvkey {
                        keyable_parent_id: keyable_id,
                    },
                    &mut out,
                );
            }

            Mutation::CreateLocalKey {
                app_id,
                environment_id,
                name,
            } => {
                keyable_environment(graph, app_id, environment_id, |role| role.has_local_keys)?;
                let owner = graph
                    .keyholder(ctx.signer_id)
                    .and_then(|k| k.actor_id())
                    .cloned()
                    .ok_or_else(|| ClientError::NotLoaded(ctx.signer_id.clone()))?;
                let keyable_id = ObjectId::generate();
                out.graph_mutation.upserts.push(GraphObject::KeyableParent(KeyableParent {
                    meta: ObjectMeta::new(keyable_id.clone(), now),
                    kind: KeyableParentKind::LocalKey { user_id: owner },
                    name: name.clone(),
                    app_id: app_id.clone(),
                    environment_id: environment_id.clone(),
                }));
                out.created.push(keyable_id.clone());
                ctx.signed_keyholder(
                    KeyholderKind::GeneratedEnvkey {
                        keyable_parent_id: keyable_id,
                    },
                    &mut out,
                );
            }

            Mutation::AddInheritanceOverride {
                environment_id,
                source_environment_id,
            } => {
                let env = live_environment(graph, environment_id)?;
                let source = live_environment(graph, source_environment_id)?;
                if environment_id == source_environment_id || env.env_parent_id != source.env_parent_id {
                    return Err(ClientError::InvalidMutation(format!(
                        "{} cannot inherit from {}",
                        environment_id, source_environment_id
                    )));
                }
                if graph
                    .visible_overrides(environment_id)
                    .iter()
                    .any(|io| &io.source_environment_id == source_environment_id)
                {
                    return Err(ClientError::InvalidMutation(format!(
                        "{} already overrides {}",
                        environment_id, source_environment_id
                    )));
                }
                let id = ObjectId::generate();
                out.graph_mutation
                    .upserts
                    .push(GraphObject::InheritanceOverride(InheritanceOverride {
                        meta: ObjectMeta::new(id.clone(), now),
                        environment_id: environment_id.clone(),
                        source_environment_id: source_environment_id.clone(),
                    }));
                out.created.push(id);
            }

            Mutation::SetMatrixEntry {
                app_role_id,
                environment_role_id,
                permissions,
            } => {
                graph
                    .app_role(app_role_id)
                    .ok_or_else(|| ClientError::UnknownObject(app_role_id.clone()))?;
                graph
                    .environment_role(environment_role_id)
                    .ok_or_else(|| ClientError::UnknownObject(environment_role_id.clone()))?;
                if let Some(p) = permissions
                    .iter()
                    .find(|p| p.scope_kind() != envsync_core::ScopeKind::Environment)
                {
                    return Err(ClientError::InvalidMutation(format!(
                        "{} is not an environment permission",
                        p
                    )));
                }
                let entry = match graph.matrix_entry(app_role_id, environment_role_id) {
                    Some(existing) => {
                        let mut entry = existing.clone();
                        entry.permissions = permissions.clone();
                        entry.meta.updated_at = now;
                        entry
                    }
                    None => AppRoleEnvironmentRole {
                        meta: ObjectMeta::new(ObjectId::generate(), now),
                        app_role_id: app_role_id.clone(),
                        environment_role_id: environment_role_id.clone(),
                        permissions: permissions.clone(),
                    },
                };
                out.created.push(entry.meta.id.clone());
                out.graph_mutation
                    .upserts
                    .push(GraphObject::AppRoleEnvironmentRole(entry));
            }

            Mutation::ResignKeyholder { keyholder_id } => {
                let mut keyholder = graph
                    .keyholder(keyholder_id)
                    .cloned()
                    .ok_or_else(|| ClientError::UnknownObject(keyholder_id.clone()))?;
                let bundle = keyholder.pubkey.ok_or_else(|| {
                    ClientError::InvalidMutation(format!("{} has no pubkey to sign", keyholder_id))
                })?;
                if keyholder_id == ctx.signer_id {
                    return Err(ClientError::InvalidMutation(
                        "a keyholder cannot sign its own pubkey".to_string(),
                    ));
                }
                keyholder.signature = Some(
                    ctx.provider
                        .sign(&pubkey_signing_bytes(keyholder_id, &bundle), ctx.signer_keys),
                );
                keyholder.signed_by_id = Some(ctx.signer_id.clone());
                keyholder.meta.updated_at = now;
                out.graph_mutation.upserts.push(GraphObject::Keyholder(keyholder));
            }
        }

        Ok(out)
    }
}

fn live_environment<'g>(graph: &'g OrgGraph, id: &ObjectId) -> Result<&'g Environment> {
    graph
        .live_environment(id)
        .ok_or_else(|| ClientError::UnknownObject(id.clone()))
}

fn require_app(graph: &OrgGraph, app_id: &ObjectId) -> Result<()> {
    graph
        .env_parent(app_id)
        .filter(|p| p.is_app())
        .map(|_| ())
        .ok_or_else(|| ClientError::UnknownObject(app_id.clone()))
}

/// Check that `environment_id` belongs to app `app_id` and its role allows
/// the keyable parent kind.
fn keyable_environment(
    graph: &OrgGraph,
    app_id: &ObjectId,
    environment_id: &ObjectId,
    allowed: impl Fn(&envsync_core::EnvironmentRole) -> bool,
) -> Result<()> {
    require_app(graph, app_id)?;
    let env = live_environment(graph, environment_id)?;
    if &env.env_parent_id != app_id {
        return Err(ClientError::InvalidMutation(format!(
            "{} does not belong to {}",
            environment_id, app_id
        )));
    }
    let role = graph
        .environment_role(&env.environment_role_id)
        .ok_or_else(|| ClientError::UnknownObject(env.environment_role_id.clone()))?;
    if !allowed(role) {
        return Err(ClientError::InvalidMutation(format!(
            "environment role {} does not allow this key",
            role.name
        )));
    }
    Ok(())
}
