//! Managed role synchronization for PostgresCluster resources

pub mod catalog;
pub mod contract;
pub mod engine;
pub mod password;

pub use catalog::{RoleCatalog, RoleCatalogConnector};
pub use contract::{DatabaseRole, MembershipChanges, RoleExpiry};
pub use engine::{
    RESERVED_ROLES, RoleOperation, RoleSyncPolicy, RoleSyncReport, is_reserved_role, sync_roles,
};
pub use password::{PasswordAction, PasswordIntent, resolve_password_action};
