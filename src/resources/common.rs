//! Common utilities for Kubernetes resource generation
//!
//! Shared constants and helpers used by every object the operator creates,
//! so ownership and labelling stay consistent.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::PostgresCluster;

/// API version for PostgresCluster CRD
pub const API_VERSION: &str = "pgcluster.io/v1";

/// Kind for PostgresCluster CRD
pub const KIND: &str = "PostgresCluster";

/// Operator field manager name
pub const FIELD_MANAGER: &str = "pgcluster-operator";

/// Label carrying the owning cluster name
pub const CLUSTER_LABEL: &str = "pgcluster.io/cluster";

/// Label carrying the role of an operator-created job
pub const JOB_ROLE_LABEL: &str = "pgcluster.io/jobRole";

/// Generate an owner reference for a PostgresCluster
///
/// Child objects carrying this reference are garbage collected with the
/// cluster.
pub fn owner_reference(cluster: &PostgresCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Standard labels for all resources belonging to a PostgresCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "postgresql".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels for a job run on behalf of a cluster
pub fn job_labels(cluster_name: &str, job_role: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert(JOB_ROLE_LABEL.to_string(), job_role.to_string());
    labels
}

/// Label selector matching every object of a cluster
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}={}", CLUSTER_LABEL, cluster_name)
}
