//! Permission decisions scoped by role level and the organization tree.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

use super::{
    bounded,
    error::ServiceError,
    permission_cache::{CachedPermissionSet, PermissionCache},
    store::Directory,
};
use crate::models::{Membership, Organization, OrganizationType, Role, SUPER_ADMIN_LEVEL};

/// Guard against malformed parent chains; a well-formed tree is four tiers deep.
const MAX_TREE_DEPTH: usize = 8;

/// Capability the request gate depends on.
#[async_trait]
pub trait AuthorizationChecker: Send + Sync {
    async fn check_permission(&self, role_id: Uuid, permission: &str)
        -> Result<bool, ServiceError>;

    async fn check_user_organization_access(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<bool, ServiceError>;

    async fn check_permission_in_organization(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        permission: &str,
    ) -> Result<bool, ServiceError>;

    /// Organization a membership belongs to, active or not.
    async fn membership_organization(&self, membership_id: Uuid) -> Result<Uuid, ServiceError>;
}

/// Resolves role permission sets through the cache and answers hierarchy
/// questions against the directory.
///
/// Every answer fails closed: if neither the cache nor the directory can
/// produce the role's permission set, the caller gets an error, never `true`.
#[derive(Clone)]
pub struct AuthorizationEngine {
    directory: Arc<dyn Directory>,
    cache: Arc<dyn PermissionCache>,
    store_timeout: Duration,
}

impl AuthorizationEngine {
    pub fn new(
        directory: Arc<dyn Directory>,
        cache: Arc<dyn PermissionCache>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            cache,
            store_timeout,
        }
    }

    /// The role's level and permission set, from cache or the directory.
    pub async fn resolve_permissions(
        &self,
        role_id: Uuid,
    ) -> Result<CachedPermissionSet, ServiceError> {
        if let Some(hit) = self.cache.get(role_id).await {
            metrics::counter!("permission_cache_hits_total").increment(1);
            return Ok(hit);
        }
        metrics::counter!("permission_cache_misses_total").increment(1);

        let role = self.find_role(role_id).await?;
        let permissions = bounded(
            self.store_timeout,
            "load role permissions",
            self.directory.role_permissions(role_id),
        )
        .await?;

        let entry = CachedPermissionSet::new(role.role_level, permissions);
        if let Err(e) = self.cache.set(role_id, &entry).await {
            tracing::warn!(role_id = %role_id, error = %e, "Failed to populate permission cache");
        }
        Ok(entry)
    }

    pub async fn check_permission(
        &self,
        role_id: Uuid,
        permission: &str,
    ) -> Result<bool, ServiceError> {
        let resolved = self.resolve_permissions(role_id).await?;
        Ok(resolved.grants(permission))
    }

    /// Must run after every write to a role's grants and before that write is
    /// reported as successful.
    pub async fn invalidate_role_permissions_cache(
        &self,
        role_id: Uuid,
    ) -> Result<(), ServiceError> {
        self.cache.invalidate(role_id).await?;
        tracing::debug!(role_id = %role_id, "Permission cache invalidated");
        Ok(())
    }

    pub async fn is_role_super_admin(&self, role_id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.resolve_permissions(role_id).await?.role_level == SUPER_ADMIN_LEVEL)
    }

    pub async fn check_user_organization_access(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<bool, ServiceError> {
        Ok(self.effective_membership(user_id, org_id).await?.is_some())
    }

    pub async fn check_permission_in_organization(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        permission: &str,
    ) -> Result<bool, ServiceError> {
        match self.effective_membership(user_id, org_id).await? {
            Some(membership) => self.check_permission(membership.role_id, permission).await,
            None => Ok(false),
        }
    }

    /// Whether `role_id` may be held in `org_id`: the role must list the
    /// organization's type and its level must sit in that tier's band.
    pub async fn validate_role_accessible_in_organization(
        &self,
        role_id: Uuid,
        org_id: Uuid,
        org_type: OrganizationType,
    ) -> Result<bool, ServiceError> {
        let role = self.find_role(role_id).await?;
        let org = self.find_organization(org_id).await?;
        if org.org_type() != Some(org_type) {
            return Err(ServiceError::InvalidInput(format!(
                "Organization {} is not of type {}",
                org_id, org_type
            )));
        }
        Ok(role.applies_to(org_type) && org_type.admits_level(role.role_level))
    }

    /// The membership that governs `user_id` inside `org_id`.
    ///
    /// A direct membership wins; otherwise the closest platform or holding
    /// ancestor the user belongs to; otherwise a super-admin membership
    /// anywhere. Inactive organizations grant nothing.
    pub async fn effective_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Option<Membership>, ServiceError> {
        let org = self.find_organization(org_id).await?;
        if !org.active_flag {
            return Ok(None);
        }

        let memberships = bounded(
            self.store_timeout,
            "load memberships",
            self.directory.active_memberships_for_user(user_id),
        )
        .await?;
        if memberships.is_empty() {
            return Ok(None);
        }

        if let Some(direct) = memberships.iter().find(|m| m.org_id == org.org_id) {
            return Ok(Some(direct.clone()));
        }

        for ancestor in self.ancestors(&org).await? {
            if !ancestor.active_flag {
                continue;
            }
            let scoped = ancestor
                .org_type()
                .is_some_and(|t| t.grants_descendant_access());
            if !scoped {
                continue;
            }
            if let Some(inherited) = memberships.iter().find(|m| m.org_id == ancestor.org_id) {
                return Ok(Some(inherited.clone()));
            }
        }

        for membership in &memberships {
            if self.is_role_super_admin(membership.role_id).await? {
                return Ok(Some(membership.clone()));
            }
        }

        Ok(None)
    }

    /// Parent chain of `org`, nearest first.
    pub async fn ancestors(&self, org: &Organization) -> Result<Vec<Organization>, ServiceError> {
        let mut chain = Vec::new();
        let mut next = org.parent_org_id;
        while let Some(parent_id) = next {
            if chain.len() >= MAX_TREE_DEPTH || parent_id == org.org_id {
                tracing::warn!(
                    org_id = %org.org_id,
                    "Organization parent chain too deep or cyclic"
                );
                break;
            }
            let Some(parent) = bounded(
                self.store_timeout,
                "load organization",
                self.directory.find_organization(parent_id),
            )
            .await?
            else {
                break;
            };
            next = parent.parent_org_id;
            chain.push(parent);
        }
        Ok(chain)
    }

    pub async fn find_role(&self, role_id: Uuid) -> Result<Role, ServiceError> {
        bounded(
            self.store_timeout,
            "load role",
            self.directory.find_role(role_id),
        )
        .await?
        .ok_or_else(|| ServiceError::NotFound("Role".to_string()))
    }

    pub async fn find_organization(&self, org_id: Uuid) -> Result<Organization, ServiceError> {
        bounded(
            self.store_timeout,
            "load organization",
            self.directory.find_organization(org_id),
        )
        .await?
        .ok_or_else(|| ServiceError::NotFound("Organization".to_string()))
    }
}

#[async_trait]
impl AuthorizationChecker for AuthorizationEngine {
    async fn check_permission(
        &self,
        role_id: Uuid,
        permission: &str,
    ) -> Result<bool, ServiceError> {
        AuthorizationEngine::check_permission(self, role_id, permission).await
    }

    async fn check_user_organization_access(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<bool, ServiceError> {
        AuthorizationEngine::check_user_organization_access(self, user_id, org_id).await
    }

    async fn check_permission_in_organization(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        permission: &str,
    ) -> Result<bool, ServiceError> {
        AuthorizationEngine::check_permission_in_organization(self, user_id, org_id, permission)
            .await
    }

    async fn membership_organization(&self, membership_id: Uuid) -> Result<Uuid, ServiceError> {
        bounded(
            self.store_timeout,
            "load membership",
            self.directory.find_membership(membership_id),
        )
        .await?
        .map(|m| m.org_id)
        .ok_or_else(|| ServiceError::NotFound("Membership".to_string()))
    }
}
