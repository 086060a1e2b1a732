use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// User entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    /// Absent for users who only sign in through an external identity provider.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub active_flag: bool,
    pub created_utc: DateTime<Utc>,
}

impl User {
    pub fn new(email: String, display_name: Option<String>, password_hash: Option<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            email: email.to_lowercase(),
            display_name,
            password_hash,
            active_flag: true,
            created_utc: Utc::now(),
        }
    }
}
