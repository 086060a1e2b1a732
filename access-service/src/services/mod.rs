//! Services layer for the access service.
//!
//! The authorization and session core: role/permission resolution with a
//! read-through cache, hierarchy-checked role management, and the token
//! lifecycle, over a pluggable authoritative store.

pub mod authorization;
mod database;
pub mod error;
mod jwt;
mod memory_store;
pub mod permission_cache;
pub mod redis;
pub mod roles;
pub mod session;
pub mod store;

pub use authorization::{AuthorizationChecker, AuthorizationEngine};
pub use database::Database;
pub use error::ServiceError;
pub use jwt::{AccessGrant, AccessTokenClaims, JwtService, RefreshTokenClaims};
pub use memory_store::MemoryStore;
pub use permission_cache::{
    build_permission_cache, CachedPermissionSet, MemoryPermissionCache, PermissionCache,
    PermissionCacheStorage, RedisPermissionCache,
};
pub use redis::RedisService;
pub use roles::{MemberAssignment, NewRole, RoleService};
pub use session::{Introspection, IssuedSession, SwitchedOrganization, TokenService, VerifiedAccess};
pub use store::{Directory, SessionStore};

use std::{future::Future, time::Duration};

/// Run a store call under a time limit; elapsing counts as the store being
/// unavailable.
pub(crate) async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::unavailable(what, "timed out")),
    }
}
