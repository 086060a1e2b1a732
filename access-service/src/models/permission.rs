//! Permission model - named `resource:action` grants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Permission {
    pub perm_name: String,
    pub description: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl Permission {
    pub fn new(perm_name: String, description: Option<String>) -> Self {
        Self {
            perm_name,
            description,
            created_utc: Utc::now(),
        }
    }
}

/// A permission name must look like `resource:action`, lowercase, with both
/// halves non-empty.
pub fn is_valid_permission_name(name: &str) -> bool {
    let Some((resource, action)) = name.split_once(':') else {
        return false;
    };
    let part_ok = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    };
    part_ok(resource) && part_ok(action)
}
