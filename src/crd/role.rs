//! Managed role configuration for PostgresCluster resources
//!
//! A `RoleConfiguration` declares one PostgreSQL role that the operator keeps
//! in sync with the live catalog of the cluster's primary. Passwords are never
//! stored in the custom resource: they are sourced from a referenced Secret,
//! and `PasswordState` records which Secret version was last applied.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Whether a managed role should exist in the database
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnsureOption {
    /// The role is created (or kept) in the database
    #[default]
    Present,
    /// The role is dropped from the database if it exists
    Absent,
}

/// Reference to a Secret in the cluster's namespace
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    /// Name of the Secret
    pub name: String,
}

/// Declarative configuration of a database role
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleConfiguration {
    /// Name of the role
    pub name: String,

    /// Description of the role, stored as the role comment
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,

    /// Whether the role should exist or be removed
    #[serde(default)]
    pub ensure: EnsureOption,

    /// Secret holding the role password (`username` and `password` keys)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<SecretReference>,

    /// Set the role password to NULL, disabling password authentication
    #[serde(default)]
    pub disable_password: bool,

    /// Whether the role is a superuser
    #[serde(default)]
    pub superuser: bool,

    /// Whether the role can create databases
    #[serde(default, rename = "createdb")]
    pub create_db: bool,

    /// Whether the role can create other roles
    #[serde(default, rename = "createrole")]
    pub create_role: bool,

    /// Whether the role inherits the privileges of roles it is a member of.
    /// Defaults to true when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit: Option<bool>,

    /// Whether the role is allowed to log in
    #[serde(default)]
    pub login: bool,

    /// Whether the role is a replication role
    #[serde(default)]
    pub replication: bool,

    /// Whether the role bypasses row-level security policies
    #[serde(default, rename = "bypassrls")]
    pub bypass_rls: bool,

    /// Maximum concurrent connections (-1 for unlimited)
    #[serde(default = "default_connection_limit")]
    pub connection_limit: i64,

    /// Date and time after which the role password is no longer valid.
    /// When unset the password never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,

    /// Roles this role is a member of
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub in_roles: Vec<String>,
}

fn default_connection_limit() -> i64 {
    -1
}

impl RoleConfiguration {
    /// Create a role configuration with PostgreSQL defaults
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comment: String::new(),
            ensure: EnsureOption::Present,
            password_secret: None,
            disable_password: false,
            superuser: false,
            create_db: false,
            create_role: false,
            inherit: None,
            login: false,
            replication: false,
            bypass_rls: false,
            connection_limit: default_connection_limit(),
            valid_until: None,
            in_roles: Vec::new(),
        }
    }

    /// Effective INHERIT attribute (PostgreSQL defaults to INHERIT)
    pub fn inherit(&self) -> bool {
        self.inherit.unwrap_or(true)
    }

    /// Name of the password Secret, if one is referenced
    pub fn password_secret_name(&self) -> Option<&str> {
        self.password_secret
            .as_ref()
            .map(|s| s.name.as_str())
            .filter(|name| !name.is_empty())
    }
}

/// Last password applied to a role
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PasswordState {
    /// Transaction ID of the catalog row after the password was written
    #[serde(default, rename = "transactionID")]
    pub transaction_id: i64,

    /// Resource version of the Secret the password came from
    #[serde(default)]
    pub resource_version: String,
}
