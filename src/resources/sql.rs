//! Role catalog access over a PostgreSQL connection
//!
//! Statements are built here from `DatabaseRole` values, with identifiers
//! and literals escaped, and run against the primary through
//! `tokio-postgres`. DDL cannot take bind parameters, so every value that
//! reaches a statement goes through `quote_identifier` or
//! `escape_sql_string`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::{debug, warn};

use crate::controller::roles::{DatabaseRole, RoleCatalog, RoleCatalogConnector, RoleExpiry};
use crate::crd::PostgresCluster;
use crate::resources::common::FIELD_MANAGER;
use crate::resources::secret::{SecretError, SecretResolver};

/// PostgreSQL port exposed by the cluster services
pub const POSTGRES_PORT: u16 = 5432;

/// Errors that can occur during SQL execution
#[derive(Error, Debug)]
pub enum SqlError {
    /// Could not open a connection to the primary
    #[error("Failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: tokio_postgres::Error,
    },

    /// The server rejected a statement
    #[error("SQL error: {0}")]
    Statement(String),

    /// Driver-level failure
    #[error("PostgreSQL client error: {0}")]
    Client(#[from] tokio_postgres::Error),

    /// A catalog row did not have the expected shape
    #[error("Unexpected catalog row: {0}")]
    InvalidRow(String),

    /// Credentials for the connection could not be read
    #[error("Cannot read connection credentials: {0}")]
    Credentials(#[from] SecretError),
}

/// Result type for SQL operations
pub type SqlResult<T> = std::result::Result<T, SqlError>;

/// Surface the server's message rather than the driver's generic one
fn statement_error(err: tokio_postgres::Error) -> SqlError {
    match err.as_db_error() {
        Some(db) => SqlError::Statement(db.message().to_string()),
        None => SqlError::Client(err),
    }
}

/// Quote a PostgreSQL identifier
///
/// This prevents SQL injection by ensuring special characters in identifiers
/// are properly escaped. For example:
/// - `my_role` -> `"my_role"`
/// - `role"name` -> `"role""name"`
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape a SQL string literal
/// Uses PostgreSQL's standard single-quote escaping
///
/// For example:
/// - `hello` -> `hello`
/// - `it's` -> `it''s`
pub fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_identifier(n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn flag(enabled: bool, keyword: &str) -> String {
    if enabled {
        keyword.to_string()
    } else {
        format!("NO{keyword}")
    }
}

fn role_options(role: &DatabaseRole) -> String {
    [
        flag(role.superuser, "SUPERUSER"),
        flag(role.create_db, "CREATEDB"),
        flag(role.create_role, "CREATEROLE"),
        flag(role.inherit, "INHERIT"),
        flag(role.login, "LOGIN"),
        flag(role.replication, "REPLICATION"),
        flag(role.bypass_rls, "BYPASSRLS"),
        format!("CONNECTION LIMIT {}", role.connection_limit),
    ]
    .join(" ")
}

/// `VALID UNTIL` clause; when altering, an unset expiry resets to infinity
fn valid_until_clause(expiry: RoleExpiry, altering: bool) -> String {
    match expiry {
        RoleExpiry::At(at) => format!(" VALID UNTIL '{}'", at.to_rfc3339()),
        RoleExpiry::Infinity => " VALID UNTIL 'infinity'".to_string(),
        RoleExpiry::Expired => " VALID UNTIL '-infinity'".to_string(),
        RoleExpiry::Unset if altering => " VALID UNTIL 'infinity'".to_string(),
        RoleExpiry::Unset => String::new(),
    }
}

pub fn create_role_sql(role: &DatabaseRole) -> String {
    format!(
        "CREATE ROLE {} WITH {}{}",
        quote_identifier(&role.name),
        role_options(role),
        valid_until_clause(role.valid_until, false)
    )
}

pub fn alter_role_sql(role: &DatabaseRole) -> String {
    format!(
        "ALTER ROLE {} WITH {}{}",
        quote_identifier(&role.name),
        role_options(role),
        valid_until_clause(role.valid_until, true)
    )
}

pub fn comment_sql(role: &DatabaseRole) -> String {
    let comment = if role.comment.is_empty() {
        "NULL".to_string()
    } else {
        format!("'{}'", escape_sql_string(&role.comment))
    };
    format!("COMMENT ON ROLE {} IS {}", quote_identifier(&role.name), comment)
}

pub fn grant_sql(role: &str, parents: &[String]) -> String {
    format!("GRANT {} TO {}", quote_list(parents), quote_identifier(role))
}

pub fn revoke_sql(role: &str, parents: &[String]) -> String {
    format!("REVOKE {} FROM {}", quote_list(parents), quote_identifier(role))
}

/// Never log the output of this function
pub fn set_password_sql(role: &str, password: &str) -> String {
    format!(
        "ALTER ROLE {} WITH PASSWORD '{}'",
        quote_identifier(role),
        escape_sql_string(password)
    )
}

pub fn clear_password_sql(role: &str) -> String {
    format!("ALTER ROLE {} WITH PASSWORD NULL", quote_identifier(role))
}

pub fn drop_role_sql(role: &str) -> String {
    format!("DROP ROLE IF EXISTS {}", quote_identifier(role))
}

const LIST_ROLES: &str = r#"
SELECT
    a.rolname::text AS name,
    COALESCE(pg_catalog.shobj_description(a.oid, 'pg_authid'), '') AS comment,
    a.rolsuper AS superuser,
    a.rolcreatedb AS create_db,
    a.rolcreaterole AS create_role,
    a.rolinherit AS inherit,
    a.rolcanlogin AS login,
    a.rolreplication AS replication,
    a.rolbypassrls AS bypass_rls,
    a.rolconnlimit::bigint AS connection_limit,
    CASE WHEN a.rolvaliduntil IN ('infinity', '-infinity') THEN NULL
         ELSE a.rolvaliduntil END AS valid_until,
    COALESCE(a.rolvaliduntil = 'infinity', false) AS valid_until_infinity,
    COALESCE(a.rolvaliduntil = '-infinity', false) AS valid_until_expired,
    a.xmin::text::bigint AS transaction_id,
    ARRAY(
        SELECT b.rolname::text
        FROM pg_catalog.pg_auth_members m
        JOIN pg_catalog.pg_authid b ON m.roleid = b.oid
        WHERE m.member = a.oid
        ORDER BY 1
    ) AS in_roles
FROM pg_catalog.pg_authid a
ORDER BY a.rolname
"#;

const ROLE_TRANSACTION_ID: &str =
    "SELECT xmin::text::bigint FROM pg_catalog.pg_authid WHERE rolname = $1";

/// Expiry of a catalog row. The infinities come back as flags since they
/// have no `DateTime` representation.
fn expiry_from_catalog(
    infinity: bool,
    expired: bool,
    at: Option<chrono::DateTime<chrono::Utc>>,
) -> RoleExpiry {
    if infinity {
        RoleExpiry::Infinity
    } else if expired {
        RoleExpiry::Expired
    } else {
        at.into()
    }
}

fn role_from_row(row: &Row) -> SqlResult<DatabaseRole> {
    let valid_until = expiry_from_catalog(
        row.try_get("valid_until_infinity")?,
        row.try_get("valid_until_expired")?,
        row.try_get("valid_until")?,
    );

    Ok(DatabaseRole {
        name: row.try_get("name")?,
        comment: row.try_get("comment")?,
        superuser: row.try_get("superuser")?,
        create_db: row.try_get("create_db")?,
        create_role: row.try_get("create_role")?,
        inherit: row.try_get("inherit")?,
        login: row.try_get("login")?,
        replication: row.try_get("replication")?,
        bypass_rls: row.try_get("bypass_rls")?,
        connection_limit: row.try_get("connection_limit")?,
        valid_until,
        in_roles: row.try_get("in_roles")?,
        transaction_id: row.try_get("transaction_id")?,
    })
}

/// Role catalog over one connection to the primary.
///
/// The connection task is aborted when the catalog is dropped, so a pass
/// releases its connection on every exit path.
pub struct PgRoleCatalog {
    client: Client,
    connection: JoinHandle<()>,
}

impl PgRoleCatalog {
    pub async fn connect(config: &Config) -> SqlResult<Self> {
        let host = config
            .get_hosts()
            .first()
            .map(|h| format!("{h:?}"))
            .unwrap_or_default();
        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|source| SqlError::Connect { host, source })?;

        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "Catalog connection closed with error");
            }
        });

        Ok(Self { client, connection })
    }

    async fn execute(&self, sql: &str) -> SqlResult<()> {
        self.client.batch_execute(sql).await.map_err(statement_error)
    }
}

impl Drop for PgRoleCatalog {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

#[async_trait]
impl RoleCatalog for PgRoleCatalog {
    async fn list_roles(&self) -> SqlResult<Vec<DatabaseRole>> {
        let rows = self
            .client
            .query(LIST_ROLES, &[])
            .await
            .map_err(statement_error)?;
        rows.iter().map(role_from_row).collect()
    }

    async fn create_role(&self, role: &DatabaseRole) -> SqlResult<()> {
        let sql = create_role_sql(role);
        debug!(sql = %sql, "Creating role");
        self.execute(&sql).await
    }

    async fn update_role(&self, role: &DatabaseRole) -> SqlResult<()> {
        let sql = alter_role_sql(role);
        debug!(sql = %sql, "Altering role");
        self.execute(&sql).await
    }

    async fn update_comment(&self, role: &DatabaseRole) -> SqlResult<()> {
        self.execute(&comment_sql(role)).await
    }

    async fn update_membership(
        &self,
        role: &str,
        grant: &[String],
        revoke: &[String],
    ) -> SqlResult<()> {
        // One simple-query batch runs as a single implicit transaction
        let mut statements = Vec::new();
        if !grant.is_empty() {
            statements.push(grant_sql(role, grant));
        }
        if !revoke.is_empty() {
            statements.push(revoke_sql(role, revoke));
        }
        if statements.is_empty() {
            return Ok(());
        }
        self.execute(&statements.join("; ")).await
    }

    async fn set_password(&self, role: &str, password: &str) -> SqlResult<i64> {
        self.execute(&set_password_sql(role, password)).await?;
        self.transaction_id(role).await
    }

    async fn clear_password(&self, role: &str) -> SqlResult<i64> {
        self.execute(&clear_password_sql(role)).await?;
        self.transaction_id(role).await
    }

    async fn transaction_id(&self, role: &str) -> SqlResult<i64> {
        let row = self
            .client
            .query_opt(ROLE_TRANSACTION_ID, &[&role])
            .await
            .map_err(statement_error)?
            .ok_or_else(|| SqlError::InvalidRow(format!("role {role} not found in catalog")))?;
        Ok(row.try_get(0)?)
    }

    async fn drop_role(&self, role: &str) -> SqlResult<()> {
        self.execute(&drop_role_sql(role)).await
    }
}

/// Secret holding the superuser credentials of a cluster
pub fn superuser_secret_name(cluster_name: &str) -> String {
    format!("{cluster_name}-superuser")
}

/// Service routed to the current primary
pub fn primary_service_host(cluster_name: &str, namespace: &str) -> String {
    format!("{cluster_name}-rw.{namespace}.svc")
}

/// Connects to a cluster's primary with its superuser credentials
pub struct PgCatalogConnector {
    secrets: Arc<dyn SecretResolver>,
    connect_timeout: Duration,
}

impl PgCatalogConnector {
    pub fn new(secrets: Arc<dyn SecretResolver>, connect_timeout: Duration) -> Self {
        Self {
            secrets,
            connect_timeout,
        }
    }
}

#[async_trait]
impl RoleCatalogConnector for PgCatalogConnector {
    async fn connect(&self, cluster: &PostgresCluster) -> SqlResult<Box<dyn RoleCatalog>> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        let credentials = self
            .secrets
            .resolve(&namespace, &superuser_secret_name(&name))
            .await?;

        let host = primary_service_host(&name, &namespace);
        let mut config = Config::new();
        config
            .host(&host)
            .port(POSTGRES_PORT)
            .dbname("postgres")
            .user(credentials.username.as_deref().unwrap_or("postgres"))
            .password(credentials.password.as_bytes())
            .application_name(FIELD_MANAGER)
            .connect_timeout(self.connect_timeout);

        debug!(host = %host, "Connecting to cluster primary");
        Ok(Box::new(PgRoleCatalog::connect(&config).await?))
    }
}
