//! Role and membership management under the level hierarchy.
//!
//! Rules enforced here, for every actor at level `L`:
//! - roles at level `>= L` can be neither created, changed, deleted nor
//!   assigned, except that a super admin handles the super-admin role;
//! - nobody changes their own membership;
//! - at most one user holds the super-admin level;
//! - listings hide what sits at or above `L`, see [`member_visible_to`].

use serde::Deserialize;
use std::{collections::HashSet, sync::Arc, time::Duration};
use uuid::Uuid;

use super::{
    authorization::AuthorizationEngine, bounded, error::ServiceError, session::TokenService,
    store::Directory,
};
use crate::{
    context::RequestContext,
    models::{
        permission::is_valid_permission_name, MemberRecord, Membership, MembershipAction,
        MembershipHistoryEntry, Organization, OrganizationType, Role, RoleResponse,
        PLATFORM_MIN_LEVEL, SUPER_ADMIN_LEVEL,
    },
};

/// Whether a caller at `actor_level` sees a member holding `member_level`.
///
/// Platform staff belong to no single organization, so organization-scoped
/// callers still see platform-tier members. Platform callers get the plain
/// level rule.
pub fn member_visible_to(actor_level: i32, member_level: i32) -> bool {
    if member_level < actor_level {
        return true;
    }
    actor_level < PLATFORM_MIN_LEVEL && member_level >= PLATFORM_MIN_LEVEL
}

pub fn role_visible_to(actor_level: i32, role_level: i32) -> bool {
    role_level < actor_level
}

/// Whether an actor at `actor_level` may create, change or hand out a role at
/// `role_level`.
pub fn can_manage_level(actor_level: i32, role_level: i32) -> bool {
    if role_level == SUPER_ADMIN_LEVEL {
        return actor_level == SUPER_ADMIN_LEVEL;
    }
    role_level < actor_level
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRole {
    pub role_name: String,
    pub role_level: i32,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub organization_types: Vec<OrganizationType>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MemberAssignment {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role_id: Uuid,
}

#[derive(Clone)]
pub struct RoleService {
    directory: Arc<dyn Directory>,
    authz: AuthorizationEngine,
    tokens: TokenService,
    store_timeout: Duration,
}

impl RoleService {
    pub fn new(
        directory: Arc<dyn Directory>,
        authz: AuthorizationEngine,
        tokens: TokenService,
        store_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            authz,
            tokens,
            store_timeout,
        }
    }

    pub async fn create_role(
        &self,
        ctx: &RequestContext,
        new_role: NewRole,
    ) -> Result<RoleResponse, ServiceError> {
        let name = new_role.role_name.trim().to_string();
        if name.is_empty() {
            return Err(ServiceError::InvalidInput("Role name is required".to_string()));
        }
        if !(0..=SUPER_ADMIN_LEVEL).contains(&new_role.role_level) {
            return Err(ServiceError::InvalidInput(format!(
                "Role level must be between 0 and {}",
                SUPER_ADMIN_LEVEL
            )));
        }
        if let Some(bad) = new_role
            .organization_types
            .iter()
            .find(|t| !t.admits_level(new_role.role_level))
        {
            return Err(ServiceError::InvalidInput(format!(
                "Level {} is outside the {} tier",
                new_role.role_level, bad
            )));
        }

        let actor_level = self.actor_level(ctx).await?;
        if !can_manage_level(actor_level, new_role.role_level) {
            tracing::debug!(
                user_id = %ctx.user_id,
                actor_level,
                requested_level = new_role.role_level,
                "Role creation above actor level denied"
            );
            return Err(ServiceError::Forbidden(
                "Cannot create a role at or above your own level".to_string(),
            ));
        }

        let permissions = self.checked_permissions(ctx, &new_role.permissions).await?;
        let role = Role::new(name, new_role.role_level, &new_role.organization_types);
        bounded(
            ctx.budget(self.store_timeout),
            "insert role",
            self.directory.insert_role(&role, &permissions),
        )
        .await?;

        tracing::info!(
            role_id = %role.role_id,
            role_level = role.role_level,
            actor = %ctx.user_id,
            "Role created"
        );
        Ok(RoleResponse::new(role, permissions))
    }

    /// Replace a role's grants. The cache entry is gone before this returns.
    pub async fn update_role_permissions(
        &self,
        ctx: &RequestContext,
        role_id: Uuid,
        permissions: Vec<String>,
    ) -> Result<RoleResponse, ServiceError> {
        let role = self.authz.find_role(role_id).await?;
        self.ensure_can_manage(ctx, &role).await?;

        let permissions = self.checked_permissions(ctx, &permissions).await?;
        bounded(
            ctx.budget(self.store_timeout),
            "replace role permissions",
            self.directory.replace_role_permissions(role_id, &permissions),
        )
        .await?;
        self.authz.invalidate_role_permissions_cache(role_id).await?;

        tracing::info!(
            role_id = %role_id,
            permission_count = permissions.len(),
            actor = %ctx.user_id,
            "Role permissions replaced"
        );
        Ok(RoleResponse::new(role, permissions))
    }

    pub async fn delete_role(
        &self,
        ctx: &RequestContext,
        role_id: Uuid,
    ) -> Result<(), ServiceError> {
        let role = self.authz.find_role(role_id).await?;
        self.ensure_can_manage(ctx, &role).await?;

        bounded(
            ctx.budget(self.store_timeout),
            "delete role",
            self.directory.delete_role(role_id),
        )
        .await?;
        self.authz.invalidate_role_permissions_cache(role_id).await?;

        tracing::info!(role_id = %role_id, actor = %ctx.user_id, "Role deleted");
        Ok(())
    }

    pub async fn delete_permission(
        &self,
        ctx: &RequestContext,
        perm_name: &str,
    ) -> Result<(), ServiceError> {
        if !is_valid_permission_name(perm_name) {
            return Err(ServiceError::InvalidInput(format!(
                "Malformed permission name: {}",
                perm_name
            )));
        }
        bounded(
            ctx.budget(self.store_timeout),
            "delete permission",
            self.directory.delete_permission(perm_name),
        )
        .await?;

        tracing::info!(permission = %perm_name, actor = %ctx.user_id, "Permission deleted");
        Ok(())
    }

    /// Give `assignment.user_id` a role in an organization, creating the
    /// membership or changing its role. A role change revokes the target's
    /// sessions so old role claims cannot be refreshed.
    pub async fn assign_member_role(
        &self,
        ctx: &RequestContext,
        assignment: MemberAssignment,
    ) -> Result<Membership, ServiceError> {
        if assignment.user_id == ctx.user_id {
            return Err(ServiceError::Forbidden(
                "Cannot change your own role".to_string(),
            ));
        }

        let org = self.authz.find_organization(assignment.organization_id).await?;
        let org_type = org_type_of(&org)?;
        let actor_level = self.acting_level_in(ctx, org.org_id).await?;
        let role = self.authz.find_role(assignment.role_id).await?;
        if !can_manage_level(actor_level, role.role_level) {
            return Err(ServiceError::Forbidden(
                "Cannot assign a role at or above your own level".to_string(),
            ));
        }

        if !self
            .authz
            .validate_role_accessible_in_organization(role.role_id, org.org_id, org_type)
            .await?
        {
            return Err(ServiceError::InvalidInput(format!(
                "Role {} cannot be held in a {} organization",
                role.role_name, org_type
            )));
        }

        let target = bounded(
            ctx.budget(self.store_timeout),
            "load user",
            self.directory.find_user_by_id(assignment.user_id),
        )
        .await?
        .filter(|u| u.active_flag)
        .ok_or_else(|| ServiceError::NotFound("User".to_string()))?;

        if role.is_super_admin() {
            let holders = bounded(
                ctx.budget(self.store_timeout),
                "load super admins",
                self.directory.users_holding_level(SUPER_ADMIN_LEVEL),
            )
            .await?;
            if holders.iter().any(|u| *u != target.user_id) {
                return Err(ServiceError::Conflict(
                    "A super admin already exists".to_string(),
                ));
            }
        }

        let existing = bounded(
            ctx.budget(self.store_timeout),
            "load membership",
            self.directory
                .find_active_membership(target.user_id, org.org_id),
        )
        .await?;

        let membership = match existing {
            Some(mut current) => {
                let current_level =
                    self.authz.resolve_permissions(current.role_id).await?.role_level;
                if current_level >= actor_level {
                    return Err(ServiceError::Forbidden(
                        "Cannot change the role of a member at or above your level".to_string(),
                    ));
                }
                if current.role_id == role.role_id {
                    return Ok(current);
                }
                current.role_id = role.role_id;
                let entry = MembershipHistoryEntry::record(
                    &current,
                    MembershipAction::RoleChanged,
                    ctx.user_id,
                );
                bounded(
                    ctx.budget(self.store_timeout),
                    "change membership role",
                    self.directory
                        .change_membership_role(current.membership_id, role.role_id, &entry),
                )
                .await?;
                self.tokens.revoke_all(target.user_id).await?;
                current
            }
            None => {
                let membership = Membership::new(target.user_id, org.org_id, role.role_id);
                let entry = MembershipHistoryEntry::record(
                    &membership,
                    MembershipAction::Assigned,
                    ctx.user_id,
                );
                bounded(
                    ctx.budget(self.store_timeout),
                    "insert membership",
                    self.directory.insert_membership(&membership, &entry),
                )
                .await?;
                membership
            }
        };

        tracing::info!(
            user_id = %target.user_id,
            organization_id = %org.org_id,
            role_id = %role.role_id,
            actor = %ctx.user_id,
            "Member role assigned"
        );
        Ok(membership)
    }

    pub async fn deactivate_membership(
        &self,
        ctx: &RequestContext,
        membership_id: Uuid,
    ) -> Result<(), ServiceError> {
        let membership = bounded(
            ctx.budget(self.store_timeout),
            "load membership",
            self.directory.find_membership(membership_id),
        )
        .await?
        .filter(|m| m.active_flag)
        .ok_or_else(|| ServiceError::NotFound("Membership".to_string()))?;

        if membership.user_id == ctx.user_id {
            return Err(ServiceError::Forbidden(
                "Cannot change your own membership".to_string(),
            ));
        }

        let actor_level = self.acting_level_in(ctx, membership.org_id).await?;
        let member_level = self.authz.resolve_permissions(membership.role_id).await?.role_level;
        if member_level >= actor_level {
            return Err(ServiceError::Forbidden(
                "Cannot deactivate a member at or above your level".to_string(),
            ));
        }

        let entry =
            MembershipHistoryEntry::record(&membership, MembershipAction::Deactivated, ctx.user_id);
        bounded(
            ctx.budget(self.store_timeout),
            "deactivate membership",
            self.directory.deactivate_membership(membership_id, &entry),
        )
        .await?;
        self.tokens.revoke_all(membership.user_id).await?;

        tracing::info!(
            membership_id = %membership_id,
            user_id = %membership.user_id,
            actor = %ctx.user_id,
            "Membership deactivated"
        );
        Ok(())
    }

    /// Self-service join by organization code. Never grants a platform-tier role.
    pub async fn join_by_code(
        &self,
        ctx: &RequestContext,
        org_code: &str,
        role_id: Uuid,
    ) -> Result<Membership, ServiceError> {
        let org = bounded(
            ctx.budget(self.store_timeout),
            "load organization",
            self.directory.find_organization_by_code(org_code.trim()),
        )
        .await?
        .filter(|o| o.active_flag)
        .ok_or_else(|| ServiceError::NotFound("Organization".to_string()))?;
        let org_type = org_type_of(&org)?;

        let role = self.authz.find_role(role_id).await?;
        if role.role_level >= PLATFORM_MIN_LEVEL {
            return Err(ServiceError::Forbidden(
                "Platform roles cannot be self-assigned".to_string(),
            ));
        }
        if !self
            .authz
            .validate_role_accessible_in_organization(role_id, org.org_id, org_type)
            .await?
        {
            return Err(ServiceError::InvalidInput(format!(
                "Role {} cannot be held in a {} organization",
                role.role_name, org_type
            )));
        }

        let membership = Membership::new(ctx.user_id, org.org_id, role_id);
        let entry =
            MembershipHistoryEntry::record(&membership, MembershipAction::Joined, ctx.user_id);
        bounded(
            ctx.budget(self.store_timeout),
            "insert membership",
            self.directory.insert_membership(&membership, &entry),
        )
        .await?;

        tracing::info!(
            user_id = %ctx.user_id,
            organization_id = %org.org_id,
            role_id = %role_id,
            "Joined organization by code"
        );
        Ok(membership)
    }

    pub async fn list_roles(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<RoleResponse>, ServiceError> {
        let actor_level = self.actor_level(ctx).await?;
        let roles = bounded(
            ctx.budget(self.store_timeout),
            "list roles",
            self.directory.list_roles(),
        )
        .await?;

        let mut visible = Vec::new();
        for role in roles
            .into_iter()
            .filter(|r| role_visible_to(actor_level, r.role_level))
        {
            let permissions = self
                .authz
                .resolve_permissions(role.role_id)
                .await?
                .sorted_permissions();
            visible.push(RoleResponse::new(role, permissions));
        }
        Ok(visible)
    }

    /// Active members of an organization visible to the caller. Unless
    /// `direct_only`, platform-tier staff of platform ancestors are included.
    pub async fn list_members(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        direct_only: bool,
    ) -> Result<Vec<MemberRecord>, ServiceError> {
        let org = self.authz.find_organization(org_id).await?;
        let actor_level = self.acting_level_in(ctx, org.org_id).await?;

        let mut members = bounded(
            ctx.budget(self.store_timeout),
            "list members",
            self.directory.list_active_members(org.org_id),
        )
        .await?;

        if !direct_only {
            let mut seen: HashSet<Uuid> = members.iter().map(|m| m.user_id).collect();
            for ancestor in self.authz.ancestors(&org).await? {
                if ancestor.org_type() != Some(OrganizationType::Platform) {
                    continue;
                }
                let staff = bounded(
                    ctx.budget(self.store_timeout),
                    "list platform members",
                    self.directory.list_active_members(ancestor.org_id),
                )
                .await?;
                members.extend(
                    staff
                        .into_iter()
                        .filter(|m| m.role_level >= PLATFORM_MIN_LEVEL)
                        .filter(|m| seen.insert(m.user_id)),
                );
            }
        }

        members.retain(|m| member_visible_to(actor_level, m.role_level));
        Ok(members)
    }

    pub async fn membership_history(
        &self,
        ctx: &RequestContext,
        membership_id: Uuid,
    ) -> Result<Vec<MembershipHistoryEntry>, ServiceError> {
        let membership = bounded(
            ctx.budget(self.store_timeout),
            "load membership",
            self.directory.find_membership(membership_id),
        )
        .await?
        .ok_or_else(|| ServiceError::NotFound("Membership".to_string()))?;

        if membership.user_id != ctx.user_id {
            self.acting_level_in(ctx, membership.org_id).await?;
        }

        bounded(
            ctx.budget(self.store_timeout),
            "load membership history",
            self.directory.membership_history(membership_id),
        )
        .await
    }

    /// The caller's level in the session's organization, resolved live so a
    /// demotion takes effect before the access token expires.
    async fn actor_level(&self, ctx: &RequestContext) -> Result<i32, ServiceError> {
        match ctx.organization_id {
            Some(org_id) => self.acting_level_in(ctx, org_id).await,
            None => Ok(self.authz.resolve_permissions(ctx.role_id).await?.role_level),
        }
    }

    /// The caller's level inside `org_id`, taken from the membership that
    /// governs them there rather than from the session role.
    async fn acting_level_in(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
    ) -> Result<i32, ServiceError> {
        match self.authz.effective_membership(ctx.user_id, org_id).await? {
            Some(membership) => Ok(self
                .authz
                .resolve_permissions(membership.role_id)
                .await?
                .role_level),
            None => {
                tracing::debug!(
                    user_id = %ctx.user_id,
                    organization_id = %org_id,
                    "No membership governs caller in organization"
                );
                Err(ServiceError::Forbidden(
                    "No access to this organization".to_string(),
                ))
            }
        }
    }

    async fn ensure_can_manage(
        &self,
        ctx: &RequestContext,
        role: &Role,
    ) -> Result<(), ServiceError> {
        let actor_level = self.actor_level(ctx).await?;
        if can_manage_level(actor_level, role.role_level) {
            return Ok(());
        }
        tracing::debug!(
            user_id = %ctx.user_id,
            actor_level,
            role_level = role.role_level,
            "Role management above actor level denied"
        );
        Err(ServiceError::Forbidden(
            "Cannot manage a role at or above your own level".to_string(),
        ))
    }

    /// Deduplicate and check that every named permission exists.
    async fn checked_permissions(
        &self,
        ctx: &RequestContext,
        requested: &[String],
    ) -> Result<Vec<String>, ServiceError> {
        let mut unique: Vec<String> = requested.iter().map(|p| p.trim().to_string()).collect();
        unique.sort();
        unique.dedup();

        for name in &unique {
            if !is_valid_permission_name(name) {
                return Err(ServiceError::InvalidInput(format!(
                    "Malformed permission name: {}",
                    name
                )));
            }
            let found = bounded(
                ctx.budget(self.store_timeout),
                "load permission",
                self.directory.find_permission(name),
            )
            .await?;
            if found.is_none() {
                return Err(ServiceError::NotFound(format!("Permission {}", name)));
            }
        }
        Ok(unique)
    }
}

fn org_type_of(org: &Organization) -> Result<OrganizationType, ServiceError> {
    org.org_type().ok_or_else(|| {
        ServiceError::InvalidInput(format!(
            "Organization {} has unknown type {}",
            org.org_id, org.org_type_code
        ))
    })
}
