//! PostgresDatabase CRD definition
//!
//! A PostgresDatabase declares a database inside a parent PostgresCluster.
//! Each one carries the `pgcluster.io/database-finalizer` token, which the
//! operator releases once the parent cluster is deleted.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::role::EnsureOption;

/// Finalizer registered on every PostgresDatabase
pub const DATABASE_FINALIZER: &str = "pgcluster.io/database-finalizer";

/// PostgresDatabase is the Schema for the postgresdatabases API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgcluster.io",
    version = "v1",
    kind = "PostgresDatabase",
    plural = "postgresdatabases",
    shortname = "pgdb",
    namespaced,
    status = "PostgresDatabaseStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.cluster.name"}"#,
    printcolumn = r#"{"name":"Database", "type":"string", "jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDatabaseSpec {
    /// Reference to the parent PostgresCluster
    pub cluster: ClusterRef,

    /// Name of the database
    pub name: String,

    /// Owner role of the database
    pub owner: String,

    /// Whether the database should exist or be removed
    #[serde(default)]
    pub ensure: EnsureOption,
}

/// Reference to a PostgresCluster in the same namespace
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct ClusterRef {
    /// Name of the PostgresCluster
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDatabaseStatus {
    /// Whether the database was applied
    #[serde(default)]
    pub applied: bool,

    /// Last error message, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PostgresDatabase {
    /// Whether this database belongs to the named cluster
    pub fn belongs_to(&self, cluster_name: &str) -> bool {
        self.spec.cluster.name == cluster_name
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|f| f == DATABASE_FINALIZER))
    }

    /// Drop the database finalizer, returning whether it was present
    pub fn remove_finalizer(&mut self) -> bool {
        let Some(finalizers) = self.metadata.finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != DATABASE_FINALIZER);
        before != finalizers.len()
    }
}
