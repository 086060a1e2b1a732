pub mod membership;
pub mod organization;
pub mod permission;
pub mod refresh_session;
pub mod role;
pub mod user;

pub use membership::{MemberRecord, Membership, MembershipAction, MembershipHistoryEntry};
pub use organization::{Organization, OrganizationType};
pub use permission::Permission;
pub use refresh_session::RefreshSession;
pub use role::{Role, RoleResponse, PLATFORM_MIN_LEVEL, SUPER_ADMIN_LEVEL};
pub use user::User;
