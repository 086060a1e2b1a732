use axum::{extract::FromRequestParts, http::request::Parts};
use service_core::error::AppError;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::SUPER_ADMIN_LEVEL;

/// Identity of the caller for one request, built by the auth gate from a
/// validated access token and passed explicitly into every core call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub role_level: i32,
    pub organization_id: Option<Uuid>,
    /// Refresh session the access token was minted from.
    pub session_id: Uuid,
    pub request_id: String,
    /// Point after which store calls made on behalf of this request give up.
    pub deadline: Instant,
}

impl RequestContext {
    pub fn is_super_admin(&self) -> bool {
        self.role_level == SUPER_ADMIN_LEVEL
    }

    /// Time a store call may take: the smaller of `ceiling` and what is left
    /// before the deadline.
    pub fn budget(&self, ceiling: Duration) -> Duration {
        ceiling.min(self.deadline.saturating_duration_since(Instant::now()))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Authentication required")))
    }
}
