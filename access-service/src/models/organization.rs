//! Organization model - the platform / holding / company / store tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, ops::RangeInclusive, str::FromStr};
use uuid::Uuid;

use super::role::SUPER_ADMIN_LEVEL;

/// Tier of an organization node. Each tier owns a band of role levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrganizationType {
    Platform,
    Holding,
    Company,
    Store,
}

impl OrganizationType {
    pub const ALL: [OrganizationType; 4] = [
        OrganizationType::Platform,
        OrganizationType::Holding,
        OrganizationType::Company,
        OrganizationType::Store,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationType::Platform => "platform",
            OrganizationType::Holding => "holding",
            OrganizationType::Company => "company",
            OrganizationType::Store => "store",
        }
    }

    /// Role levels valid inside an organization of this type.
    pub fn level_band(&self) -> RangeInclusive<i32> {
        match self {
            OrganizationType::Platform => 76..=99,
            OrganizationType::Holding => 51..=75,
            OrganizationType::Company => 26..=50,
            OrganizationType::Store => 1..=25,
        }
    }

    /// Whether a role of `level` may be held inside this tier. The super-admin
    /// level exists only at platform scope.
    pub fn admits_level(&self, level: i32) -> bool {
        if level == SUPER_ADMIN_LEVEL {
            return *self == OrganizationType::Platform;
        }
        self.level_band().contains(&level)
    }

    /// Memberships at this tier extend to every descendant organization.
    pub fn grants_descendant_access(&self) -> bool {
        matches!(self, OrganizationType::Platform | OrganizationType::Holding)
    }
}

impl fmt::Display for OrganizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrganizationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "platform" => Ok(OrganizationType::Platform),
            "holding" => Ok(OrganizationType::Holding),
            "company" => Ok(OrganizationType::Company),
            "store" => Ok(OrganizationType::Store),
            _ => Err(format!("Invalid organization type: {}", s)),
        }
    }
}

/// Organization entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub org_id: Uuid,
    pub org_type_code: String,
    pub org_label: String,
    /// Join code handed out to prospective members.
    pub org_code: String,
    pub parent_org_id: Option<Uuid>,
    pub active_flag: bool,
    pub created_utc: DateTime<Utc>,
}

impl Organization {
    pub fn new(
        org_type: OrganizationType,
        org_label: String,
        org_code: String,
        parent_org_id: Option<Uuid>,
    ) -> Self {
        Self {
            org_id: Uuid::new_v4(),
            org_type_code: org_type.as_str().to_string(),
            org_label,
            org_code,
            parent_org_id,
            active_flag: true,
            created_utc: Utc::now(),
        }
    }

    /// Parsed tier. Unknown codes yield `None` and are treated as inaccessible.
    pub fn org_type(&self) -> Option<OrganizationType> {
        self.org_type_code.parse().ok()
    }
}
