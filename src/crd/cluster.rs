use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements as K8sResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::fencing::{FENCED_INSTANCES_ANNOTATION, FencingSet};
use super::role::{PasswordState, RoleConfiguration};

/// PostgresCluster is the Schema for the postgresclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgcluster.io",
    version = "v1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.currentPrimary"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Number of instances (primary plus replicas)
    #[serde(default = "default_instances")]
    pub instances: i32,

    /// Container image running PostgreSQL
    pub image_name: String,

    /// Image pull policy for instance and job containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Resource requirements for PostgreSQL pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Seccomp profile type applied to pods (defaults to RuntimeDefault)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<String>,

    /// Database objects managed declaratively by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed: Option<ManagedConfiguration>,
}

fn default_instances() -> i32 {
    1
}

/// Declarative configuration of database objects
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedConfiguration {
    /// Roles kept in sync with the database catalog
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleConfiguration>,
}

/// Resource requirements for PostgreSQL pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// CPU and memory limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// CPU and memory requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceList {
    fn to_quantities(&self) -> Option<BTreeMap<String, Quantity>> {
        let mut map = BTreeMap::new();
        if let Some(cpu) = &self.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &self.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        (!map.is_empty()).then_some(map)
    }
}

impl From<&ResourceRequirements> for K8sResourceRequirements {
    fn from(resources: &ResourceRequirements) -> Self {
        K8sResourceRequirements {
            limits: resources.limits.as_ref().and_then(ResourceList::to_quantities),
            requests: resources
                .requests
                .as_ref()
                .and_then(ResourceList::to_quantities),
            ..Default::default()
        }
    }
}

/// Status of the PostgresCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Names of the instances known to the cluster, in serial order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_names: Vec<String>,

    /// Name of the instance currently acting as primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_primary: Option<String>,

    /// Image the cluster is being upgraded from, while a major upgrade is pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_version_upgrade_from_image: Option<String>,

    /// Progress of the current major upgrade attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_upgrade: Option<MajorUpgradeStatus>,

    /// Outcome of the last managed role synchronization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_roles_status: Option<ManagedRolesStatus>,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Cluster has not been reconciled yet
    #[default]
    Pending,
    /// Cluster is running and in sync
    Running,
    /// A major version upgrade job is in progress
    UpgradingMajorVersion,
    /// The last reconciliation failed
    Failed,
    /// Cluster is being deleted
    Deleting,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::UpgradingMajorVersion => write!(f, "UpgradingMajorVersion"),
            ClusterPhase::Failed => write!(f, "Failed"),
            ClusterPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Phase of one major upgrade attempt
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum UpgradePhase {
    #[default]
    NotStarted,
    JobCreated,
    Succeeded,
    Failed,
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradePhase::NotStarted => write!(f, "NotStarted"),
            UpgradePhase::JobCreated => write!(f, "JobCreated"),
            UpgradePhase::Succeeded => write!(f, "Succeeded"),
            UpgradePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Major upgrade attempt recorded in the status
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MajorUpgradeStatus {
    pub phase: UpgradePhase,

    /// Name of the upgrade job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    /// Image the job upgrades to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_image: Option<String>,
}

/// Report of the last managed role synchronization
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedRolesStatus {
    /// Roles that are in sync with their configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reconciled: Vec<String>,

    /// Roles present in the database but not declared
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_managed: Vec<String>,

    /// Roles that failed to reconcile, with the error messages
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cannot_reconcile: BTreeMap<String, Vec<String>>,

    /// Last password applied per role
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub password_status: BTreeMap<String, PasswordState>,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl PostgresCluster {
    /// Whether the instance is a member of the cluster
    pub fn has_instance(&self, instance: &str) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.instance_names.iter().any(|n| n == instance))
    }

    /// Decode the fenced-instance annotation
    pub fn fencing_set(&self) -> Result<FencingSet, serde_json::Error> {
        FencingSet::from_annotation(
            self.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(FENCED_INSTANCES_ANNOTATION))
                .map(String::as_str),
        )
    }

    /// Whether the instance is fenced; a malformed annotation fences nothing
    pub fn is_instance_fenced(&self, instance: &str) -> bool {
        self.fencing_set()
            .map(|set| set.contains(instance))
            .unwrap_or(false)
    }

    /// Declared managed roles
    pub fn managed_roles(&self) -> &[RoleConfiguration] {
        self.spec
            .managed
            .as_ref()
            .map(|m| m.roles.as_slice())
            .unwrap_or_default()
    }

    /// Source image of a pending major upgrade.
    ///
    /// Returns `None` once the source image matches the desired image.
    pub fn pending_major_upgrade(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.major_version_upgrade_from_image.as_deref())
            .filter(|from| !from.is_empty() && *from != self.spec.image_name)
    }

    /// Whether the recorded upgrade attempt still has a job running
    pub fn has_running_upgrade_job(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.major_upgrade.as_ref())
            .is_some_and(|u| u.phase == UpgradePhase::JobCreated)
    }

    /// Name of the current primary instance
    pub fn current_primary(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.current_primary.as_deref())
            .filter(|p| !p.is_empty())
    }

    /// Serial number of an instance named `<cluster>-<serial>`
    pub fn instance_serial(&self, instance: &str) -> Option<u32> {
        let name = self.metadata.name.as_deref()?;
        instance
            .strip_prefix(name)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
