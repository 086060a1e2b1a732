//! Persistence seams for the authorization and session core.
//!
//! [`Directory`] holds users, roles, permissions, organizations and
//! memberships. [`SessionStore`] holds refresh sessions. Both are implemented
//! by [`Database`](super::database::Database) over PostgreSQL and by
//! [`MemoryStore`](super::memory_store::MemoryStore) for tests and
//! single-process deployments.

use async_trait::async_trait;
use uuid::Uuid;

use super::error::ServiceError;
use crate::models::{
    MemberRecord, Membership, MembershipHistoryEntry, Organization, Permission, RefreshSession,
    Role, User,
};

#[async_trait]
pub trait Directory: Send + Sync {
    async fn health_check(&self) -> Result<(), ServiceError>;

    // Users

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, ServiceError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError>;
    /// `Conflict` when the email is taken.
    async fn insert_user(&self, user: &User) -> Result<(), ServiceError>;

    // Permissions

    async fn find_permission(&self, perm_name: &str) -> Result<Option<Permission>, ServiceError>;
    async fn list_permissions(&self) -> Result<Vec<Permission>, ServiceError>;
    async fn insert_permission(&self, permission: &Permission) -> Result<(), ServiceError>;
    /// `NotFound` when absent, `Conflict` while any role still grants it.
    async fn delete_permission(&self, perm_name: &str) -> Result<(), ServiceError>;

    // Roles

    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, ServiceError>;
    async fn list_roles(&self) -> Result<Vec<Role>, ServiceError>;
    /// Inserts the role and its grants together. `Conflict` on a duplicate
    /// name or a second super-admin-level role.
    async fn insert_role(&self, role: &Role, permissions: &[String]) -> Result<(), ServiceError>;
    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, ServiceError>;
    /// Replace the role's whole grant set in one step.
    async fn replace_role_permissions(
        &self,
        role_id: Uuid,
        permissions: &[String],
    ) -> Result<(), ServiceError>;
    /// `Conflict` while an active membership references the role.
    async fn delete_role(&self, role_id: Uuid) -> Result<(), ServiceError>;

    // Organizations

    async fn find_organization(&self, org_id: Uuid) -> Result<Option<Organization>, ServiceError>;
    async fn find_organization_by_code(
        &self,
        org_code: &str,
    ) -> Result<Option<Organization>, ServiceError>;
    async fn insert_organization(&self, org: &Organization) -> Result<(), ServiceError>;

    // Memberships

    async fn find_membership(&self, membership_id: Uuid)
        -> Result<Option<Membership>, ServiceError>;
    async fn find_active_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Option<Membership>, ServiceError>;
    async fn active_memberships_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Membership>, ServiceError>;
    /// Insert a membership and its first history entry together. `Conflict`
    /// when the user already has an active membership in the organization.
    async fn insert_membership(
        &self,
        membership: &Membership,
        entry: &MembershipHistoryEntry,
    ) -> Result<(), ServiceError>;
    async fn change_membership_role(
        &self,
        membership_id: Uuid,
        role_id: Uuid,
        entry: &MembershipHistoryEntry,
    ) -> Result<(), ServiceError>;
    async fn deactivate_membership(
        &self,
        membership_id: Uuid,
        entry: &MembershipHistoryEntry,
    ) -> Result<(), ServiceError>;
    async fn list_active_members(&self, org_id: Uuid) -> Result<Vec<MemberRecord>, ServiceError>;
    async fn membership_history(
        &self,
        membership_id: Uuid,
    ) -> Result<Vec<MembershipHistoryEntry>, ServiceError>;
    /// Distinct users holding an active membership in a role of `role_level`.
    async fn users_holding_level(&self, role_level: i32) -> Result<Vec<Uuid>, ServiceError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &RefreshSession) -> Result<(), ServiceError>;
    async fn find_session(&self, session_id: Uuid)
        -> Result<Option<RefreshSession>, ServiceError>;
    /// Revoke `current_id` and insert `next` as one step. Returns `false`
    /// without writing anything when `current_id` is already revoked or expired.
    async fn rotate_session(
        &self,
        current_id: Uuid,
        next: &RefreshSession,
    ) -> Result<bool, ServiceError>;
    /// Returns whether a still-valid session was revoked.
    async fn revoke_session(&self, session_id: Uuid) -> Result<bool, ServiceError>;
    /// Whether any session in the lineage is still valid.
    async fn is_lineage_active(&self, lineage_id: Uuid) -> Result<bool, ServiceError>;
    async fn revoke_lineage(&self, lineage_id: Uuid) -> Result<u64, ServiceError>;
    async fn revoke_user_sessions(&self, user_id: Uuid) -> Result<u64, ServiceError>;
    /// Move a valid session to another organization context. Returns `false`
    /// when the session is no longer valid.
    async fn set_session_organization(
        &self,
        session_id: Uuid,
        org_id: Option<Uuid>,
    ) -> Result<bool, ServiceError>;
}
