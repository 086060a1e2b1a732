use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};
use uuid::Uuid;

use super::{
    error::ServiceError,
    store::{Directory, SessionStore},
};
use crate::models::{
    MemberRecord, Membership, MembershipHistoryEntry, Organization, Permission, RefreshSession,
    Role, User, SUPER_ADMIN_LEVEL,
};

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    permissions: HashMap<String, Permission>,
    roles: HashMap<Uuid, Role>,
    grants: HashMap<Uuid, Vec<String>>,
    organizations: HashMap<Uuid, Organization>,
    memberships: HashMap<Uuid, Membership>,
    history: Vec<MembershipHistoryEntry>,
    sessions: HashMap<Uuid, RefreshSession>,
}

/// Process-local [`Directory`] and [`SessionStore`].
///
/// Every operation runs under one lock, which gives multi-row writes such as
/// session rotation the same all-or-nothing behaviour as a transaction.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, ServiceError> {
        self.state
            .lock()
            .map_err(|_| ServiceError::Internal(anyhow::anyhow!("memory store lock poisoned")))
    }
}

#[async_trait]
impl Directory for MemoryStore {
    async fn health_check(&self) -> Result<(), ServiceError> {
        self.state().map(|_| ())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        Ok(self.state()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        let email = email.to_lowercase();
        Ok(self
            .state()?
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if state.users.values().any(|u| u.email == user.email) {
            return Err(ServiceError::Conflict("Email already registered".to_string()));
        }
        state.users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn find_permission(&self, perm_name: &str) -> Result<Option<Permission>, ServiceError> {
        Ok(self.state()?.permissions.get(perm_name).cloned())
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>, ServiceError> {
        let mut perms: Vec<Permission> = self.state()?.permissions.values().cloned().collect();
        perms.sort_by(|a, b| a.perm_name.cmp(&b.perm_name));
        Ok(perms)
    }

    async fn insert_permission(&self, permission: &Permission) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if state.permissions.contains_key(&permission.perm_name) {
            return Err(ServiceError::Conflict(format!(
                "Permission {} already exists",
                permission.perm_name
            )));
        }
        state
            .permissions
            .insert(permission.perm_name.clone(), permission.clone());
        Ok(())
    }

    async fn delete_permission(&self, perm_name: &str) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if !state.permissions.contains_key(perm_name) {
            return Err(ServiceError::NotFound("Permission".to_string()));
        }
        if state
            .grants
            .values()
            .any(|perms| perms.iter().any(|p| p == perm_name))
        {
            return Err(ServiceError::Conflict(format!(
                "Permission {} is still granted by a role",
                perm_name
            )));
        }
        state.permissions.remove(perm_name);
        Ok(())
    }

    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, ServiceError> {
        Ok(self.state()?.roles.get(&role_id).cloned())
    }

    async fn list_roles(&self) -> Result<Vec<Role>, ServiceError> {
        let mut roles: Vec<Role> = self.state()?.roles.values().cloned().collect();
        roles.sort_by(|a, b| b.role_level.cmp(&a.role_level).then(a.role_name.cmp(&b.role_name)));
        Ok(roles)
    }

    async fn insert_role(&self, role: &Role, permissions: &[String]) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if state.roles.values().any(|r| r.role_name == role.role_name) {
            return Err(ServiceError::Conflict(format!(
                "Role {} already exists",
                role.role_name
            )));
        }
        if role.role_level == SUPER_ADMIN_LEVEL
            && state.roles.values().any(|r| r.role_level == SUPER_ADMIN_LEVEL)
        {
            return Err(ServiceError::Conflict(
                "A super-admin role already exists".to_string(),
            ));
        }
        state.roles.insert(role.role_id, role.clone());
        state.grants.insert(role.role_id, permissions.to_vec());
        Ok(())
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, ServiceError> {
        Ok(self
            .state()?
            .grants
            .get(&role_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_role_permissions(
        &self,
        role_id: Uuid,
        permissions: &[String],
    ) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if !state.roles.contains_key(&role_id) {
            return Err(ServiceError::NotFound("Role".to_string()));
        }
        state.grants.insert(role_id, permissions.to_vec());
        Ok(())
    }

    async fn delete_role(&self, role_id: Uuid) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if !state.roles.contains_key(&role_id) {
            return Err(ServiceError::NotFound("Role".to_string()));
        }
        if state
            .memberships
            .values()
            .any(|m| m.active_flag && m.role_id == role_id)
        {
            return Err(ServiceError::Conflict(
                "Role is still assigned to members".to_string(),
            ));
        }
        state.roles.remove(&role_id);
        state.grants.remove(&role_id);
        Ok(())
    }

    async fn find_organization(&self, org_id: Uuid) -> Result<Option<Organization>, ServiceError> {
        Ok(self.state()?.organizations.get(&org_id).cloned())
    }

    async fn find_organization_by_code(
        &self,
        org_code: &str,
    ) -> Result<Option<Organization>, ServiceError> {
        Ok(self
            .state()?
            .organizations
            .values()
            .find(|o| o.org_code == org_code)
            .cloned())
    }

    async fn insert_organization(&self, org: &Organization) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if state.organizations.values().any(|o| o.org_code == org.org_code) {
            return Err(ServiceError::Conflict(format!(
                "Organization code {} already in use",
                org.org_code
            )));
        }
        state.organizations.insert(org.org_id, org.clone());
        Ok(())
    }

    async fn find_membership(
        &self,
        membership_id: Uuid,
    ) -> Result<Option<Membership>, ServiceError> {
        Ok(self.state()?.memberships.get(&membership_id).cloned())
    }

    async fn find_active_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Option<Membership>, ServiceError> {
        Ok(self
            .state()?
            .memberships
            .values()
            .find(|m| m.active_flag && m.user_id == user_id && m.org_id == org_id)
            .cloned())
    }

    async fn active_memberships_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Membership>, ServiceError> {
        let mut found: Vec<Membership> = self
            .state()?
            .memberships
            .values()
            .filter(|m| m.active_flag && m.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.created_utc);
        Ok(found)
    }

    async fn insert_membership(
        &self,
        membership: &Membership,
        entry: &MembershipHistoryEntry,
    ) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if state.memberships.values().any(|m| {
            m.active_flag && m.user_id == membership.user_id && m.org_id == membership.org_id
        }) {
            return Err(ServiceError::Conflict(
                "User is already a member of this organization".to_string(),
            ));
        }
        state
            .memberships
            .insert(membership.membership_id, membership.clone());
        state.history.push(entry.clone());
        Ok(())
    }

    async fn change_membership_role(
        &self,
        membership_id: Uuid,
        role_id: Uuid,
        entry: &MembershipHistoryEntry,
    ) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        let membership = state
            .memberships
            .get_mut(&membership_id)
            .filter(|m| m.active_flag)
            .ok_or_else(|| ServiceError::NotFound("Membership".to_string()))?;
        membership.role_id = role_id;
        membership.updated_utc = Utc::now();
        state.history.push(entry.clone());
        Ok(())
    }

    async fn deactivate_membership(
        &self,
        membership_id: Uuid,
        entry: &MembershipHistoryEntry,
    ) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        let membership = state
            .memberships
            .get_mut(&membership_id)
            .filter(|m| m.active_flag)
            .ok_or_else(|| ServiceError::NotFound("Membership".to_string()))?;
        membership.active_flag = false;
        membership.updated_utc = Utc::now();
        state.history.push(entry.clone());
        Ok(())
    }

    async fn list_active_members(&self, org_id: Uuid) -> Result<Vec<MemberRecord>, ServiceError> {
        let state = self.state()?;
        let mut members: Vec<MemberRecord> = state
            .memberships
            .values()
            .filter(|m| m.active_flag && m.org_id == org_id)
            .filter_map(|m| {
                let user = state.users.get(&m.user_id)?;
                let role = state.roles.get(&m.role_id)?;
                Some(MemberRecord {
                    membership_id: m.membership_id,
                    user_id: m.user_id,
                    email: user.email.clone(),
                    display_name: user.display_name.clone(),
                    org_id: m.org_id,
                    role_id: role.role_id,
                    role_name: role.role_name.clone(),
                    role_level: role.role_level,
                })
            })
            .collect();
        members.sort_by(|a, b| b.role_level.cmp(&a.role_level).then(a.email.cmp(&b.email)));
        Ok(members)
    }

    async fn membership_history(
        &self,
        membership_id: Uuid,
    ) -> Result<Vec<MembershipHistoryEntry>, ServiceError> {
        Ok(self
            .state()?
            .history
            .iter()
            .filter(|e| e.membership_id == membership_id)
            .cloned()
            .collect())
    }

    async fn users_holding_level(&self, role_level: i32) -> Result<Vec<Uuid>, ServiceError> {
        let state = self.state()?;
        let mut users: Vec<Uuid> = state
            .memberships
            .values()
            .filter(|m| m.active_flag)
            .filter(|m| {
                state
                    .roles
                    .get(&m.role_id)
                    .is_some_and(|r| r.role_level == role_level)
            })
            .map(|m| m.user_id)
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &RefreshSession) -> Result<(), ServiceError> {
        self.state()?
            .sessions
            .insert(session.session_id, session.clone());
        Ok(())
    }

    async fn find_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<RefreshSession>, ServiceError> {
        Ok(self.state()?.sessions.get(&session_id).cloned())
    }

    async fn rotate_session(
        &self,
        current_id: Uuid,
        next: &RefreshSession,
    ) -> Result<bool, ServiceError> {
        let mut state = self.state()?;
        match state.sessions.get_mut(&current_id) {
            Some(current) if current.is_valid() => {
                current.revoked_utc = Some(Utc::now());
            }
            _ => return Ok(false),
        }
        state.sessions.insert(next.session_id, next.clone());
        Ok(true)
    }

    async fn revoke_session(&self, session_id: Uuid) -> Result<bool, ServiceError> {
        let mut state = self.state()?;
        match state.sessions.get_mut(&session_id) {
            Some(session) if session.is_valid() => {
                session.revoked_utc = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_lineage_active(&self, lineage_id: Uuid) -> Result<bool, ServiceError> {
        Ok(self
            .state()?
            .sessions
            .values()
            .any(|s| s.lineage_id == lineage_id && s.is_valid()))
    }

    async fn revoke_lineage(&self, lineage_id: Uuid) -> Result<u64, ServiceError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut revoked = 0;
        for session in state
            .sessions
            .values_mut()
            .filter(|s| s.lineage_id == lineage_id && s.revoked_utc.is_none())
        {
            session.revoked_utc = Some(now);
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn revoke_user_sessions(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut revoked = 0;
        for session in state
            .sessions
            .values_mut()
            .filter(|s| s.user_id == user_id && s.revoked_utc.is_none())
        {
            session.revoked_utc = Some(now);
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn set_session_organization(
        &self,
        session_id: Uuid,
        org_id: Option<Uuid>,
    ) -> Result<bool, ServiceError> {
        let mut state = self.state()?;
        match state.sessions.get_mut(&session_id) {
            Some(session) if session.is_valid() => {
                session.org_id = org_id;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
