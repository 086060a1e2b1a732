//! Refresh session model - one row per issued refresh token.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Refresh session entity.
///
/// Rotation replaces a session with a successor that keeps the same
/// `lineage_id`; at most one session per lineage is valid at any time.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshSession {
    pub session_id: Uuid,
    pub lineage_id: Uuid,
    pub user_id: Uuid,
    /// Organization context the session's access tokens are issued for.
    pub org_id: Option<Uuid>,
    pub token_hash_text: String,
    pub expiry_utc: DateTime<Utc>,
    pub revoked_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl RefreshSession {
    /// Start a new lineage.
    pub fn new(user_id: Uuid, org_id: Option<Uuid>, expiry_days: i64) -> Self {
        let session_id = Uuid::new_v4();
        Self {
            session_id,
            lineage_id: session_id,
            user_id,
            org_id,
            token_hash_text: String::new(),
            expiry_utc: Utc::now() + Duration::days(expiry_days),
            revoked_utc: None,
            created_utc: Utc::now(),
        }
    }

    /// Successor in the same lineage with a fresh expiry.
    pub fn successor(&self, expiry_days: i64) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            lineage_id: self.lineage_id,
            user_id: self.user_id,
            org_id: self.org_id,
            token_hash_text: String::new(),
            expiry_utc: Utc::now() + Duration::days(expiry_days),
            revoked_utc: None,
            created_utc: Utc::now(),
        }
    }

    /// Check if session is valid (not expired, not revoked).
    pub fn is_valid(&self) -> bool {
        self.revoked_utc.is_none() && self.expiry_utc > Utc::now()
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_utc.is_some()
    }
}
