//! Role model - leveled roles with permission mappings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::organization::OrganizationType;

/// Level of the singleton super-admin role. Bypasses every permission check.
pub const SUPER_ADMIN_LEVEL: i32 = 100;

/// Lowest level of the platform tier.
pub const PLATFORM_MIN_LEVEL: i32 = 76;

pub const MIN_ROLE_LEVEL: i32 = 0;

/// Role entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub role_id: Uuid,
    pub role_name: String,
    pub role_level: i32,
    /// Organization types the role may be assigned in.
    pub org_type_codes: Vec<String>,
    pub created_utc: DateTime<Utc>,
}

impl Role {
    pub fn new(role_name: String, role_level: i32, org_types: &[OrganizationType]) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            role_name,
            role_level,
            org_type_codes: org_types.iter().map(|t| t.as_str().to_string()).collect(),
            created_utc: Utc::now(),
        }
    }

    pub fn is_super_admin(&self) -> bool {
        self.role_level == SUPER_ADMIN_LEVEL
    }

    pub fn is_platform_tier(&self) -> bool {
        self.role_level >= PLATFORM_MIN_LEVEL
    }

    pub fn applies_to(&self, org_type: OrganizationType) -> bool {
        self.org_type_codes.iter().any(|c| c == org_type.as_str())
    }
}

/// Role response for API.
#[derive(Debug, Serialize)]
pub struct RoleResponse {
    pub role_id: Uuid,
    pub role_name: String,
    pub role_level: i32,
    pub organization_types: Vec<String>,
    pub permissions: Vec<String>,
    pub created_utc: DateTime<Utc>,
}

impl RoleResponse {
    pub fn new(role: Role, mut permissions: Vec<String>) -> Self {
        permissions.sort();
        Self {
            role_id: role.role_id,
            role_name: role.role_name,
            role_level: role.role_level,
            organization_types: role.org_type_codes,
            permissions,
            created_utc: role.created_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_tiers() {
        let admin = Role::new("Super Admin".into(), 100, &[OrganizationType::Platform]);
        assert!(admin.is_super_admin());
        assert!(admin.is_platform_tier());

        let manager = Role::new("Store Manager".into(), 20, &[OrganizationType::Store]);
        assert!(!manager.is_super_admin());
        assert!(!manager.is_platform_tier());
        assert!(manager.applies_to(OrganizationType::Store));
        assert!(!manager.applies_to(OrganizationType::Company));
    }
}
