//! Role catalog interface
//!
//! The role engine talks to the database only through `RoleCatalog`. One
//! catalog handle serves a single synchronization pass and is dropped when
//! the pass ends.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::controller::roles::contract::DatabaseRole;
use crate::crd::PostgresCluster;
use crate::resources::sql::SqlError;

/// Role statements against the primary's catalog
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RoleCatalog: Send + Sync {
    /// All roles in the catalog, including reserved ones
    async fn list_roles(&self) -> Result<Vec<DatabaseRole>, SqlError>;

    async fn create_role(&self, role: &DatabaseRole) -> Result<(), SqlError>;

    /// `ALTER ROLE` with the role's attributes and expiry
    async fn update_role(&self, role: &DatabaseRole) -> Result<(), SqlError>;

    async fn update_comment(&self, role: &DatabaseRole) -> Result<(), SqlError>;

    async fn update_membership(
        &self,
        role: &str,
        grant: &[String],
        revoke: &[String],
    ) -> Result<(), SqlError>;

    /// Set the password, returning the row's new transaction id
    async fn set_password(&self, role: &str, password: &str) -> Result<i64, SqlError>;

    /// `PASSWORD NULL`, returning the row's new transaction id
    async fn clear_password(&self, role: &str) -> Result<i64, SqlError>;

    /// Current transaction id of the role row
    async fn transaction_id(&self, role: &str) -> Result<i64, SqlError>;

    async fn drop_role(&self, role: &str) -> Result<(), SqlError>;
}

/// Opens a catalog handle on a cluster's primary
#[async_trait]
pub trait RoleCatalogConnector: Send + Sync {
    async fn connect(&self, cluster: &PostgresCluster) -> Result<Box<dyn RoleCatalog>, SqlError>;
}
