//! Membership model - a user's role inside one organization, plus its history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Active or deactivated membership of a user in an organization.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Membership {
    pub membership_id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub role_id: Uuid,
    pub active_flag: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Membership {
    pub fn new(user_id: Uuid, org_id: Uuid, role_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            membership_id: Uuid::new_v4(),
            user_id,
            org_id,
            role_id,
            active_flag: true,
            created_utc: now,
            updated_utc: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipAction {
    Joined,
    Assigned,
    RoleChanged,
    Deactivated,
}

impl MembershipAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipAction::Joined => "joined",
            MembershipAction::Assigned => "assigned",
            MembershipAction::RoleChanged => "role_changed",
            MembershipAction::Deactivated => "deactivated",
        }
    }
}

impl fmt::Display for MembershipAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of a membership change.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MembershipHistoryEntry {
    pub entry_id: Uuid,
    pub membership_id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub role_id: Uuid,
    pub action_code: String,
    pub actor_user_id: Uuid,
    pub created_utc: DateTime<Utc>,
}

impl MembershipHistoryEntry {
    pub fn record(membership: &Membership, action: MembershipAction, actor_user_id: Uuid) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            membership_id: membership.membership_id,
            user_id: membership.user_id,
            org_id: membership.org_id,
            role_id: membership.role_id,
            action_code: action.as_str().to_string(),
            actor_user_id,
            created_utc: Utc::now(),
        }
    }
}

/// Member listing row: a membership joined with its user and role level.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MemberRecord {
    pub membership_id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub org_id: Uuid,
    pub role_id: Uuid,
    pub role_name: String,
    pub role_level: i32,
}
