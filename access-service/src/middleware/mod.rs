pub mod auth;
pub mod permission;

pub use auth::auth_middleware;
pub use permission::{require_permission, PermissionGuard};
