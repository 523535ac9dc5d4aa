//! Fenced-instance set and its annotation encoding
//!
//! The set of fenced instances is persisted on the PostgresCluster as a JSON
//! array in the `pgcluster.io/fencedInstances` annotation. The wildcard `*`
//! stands for every instance of the cluster, including instances added after
//! fencing was requested.

use std::collections::BTreeSet;

/// Annotation holding the JSON-encoded list of fenced instances
pub const FENCED_INSTANCES_ANNOTATION: &str = "pgcluster.io/fencedInstances";

/// Wildcard that fences every instance of a cluster
pub const FENCE_ALL_INSTANCES: &str = "*";

/// Instances currently fenced on a cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FencingSet {
    /// Every instance is fenced, whatever the membership
    All,
    /// Only the named instances are fenced (empty means none)
    Instances(BTreeSet<String>),
}

impl Default for FencingSet {
    fn default() -> Self {
        FencingSet::Instances(BTreeSet::new())
    }
}

impl FencingSet {
    /// Decode the annotation value.
    ///
    /// A missing or blank annotation means nothing is fenced. Both the JSON
    /// array form and a bare `*` are accepted.
    pub fn from_annotation(value: Option<&str>) -> Result<Self, serde_json::Error> {
        let value = match value.map(str::trim) {
            None | Some("") => return Ok(Self::default()),
            Some(v) => v,
        };

        if value == FENCE_ALL_INSTANCES {
            return Ok(FencingSet::All);
        }

        let names: Vec<String> = serde_json::from_str(value)?;
        if names.iter().any(|n| n == FENCE_ALL_INSTANCES) {
            return Ok(FencingSet::All);
        }
        Ok(FencingSet::Instances(names.into_iter().collect()))
    }

    /// Encode to the annotation value; `None` means the annotation is removed
    pub fn to_annotation(&self) -> Result<Option<String>, serde_json::Error> {
        match self {
            FencingSet::All => serde_json::to_string(&[FENCE_ALL_INSTANCES]).map(Some),
            FencingSet::Instances(names) if names.is_empty() => Ok(None),
            FencingSet::Instances(names) => serde_json::to_string(names).map(Some),
        }
    }

    /// Whether the given instance is fenced
    pub fn contains(&self, instance: &str) -> bool {
        match self {
            FencingSet::All => true,
            FencingSet::Instances(names) => names.contains(instance),
        }
    }

    /// Whether the named instance appears explicitly in the set
    pub fn lists(&self, instance: &str) -> bool {
        match self {
            FencingSet::All => instance == FENCE_ALL_INSTANCES,
            FencingSet::Instances(names) => names.contains(instance),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, FencingSet::All)
    }

    /// Whether nothing is fenced
    pub fn is_empty(&self) -> bool {
        matches!(self, FencingSet::Instances(names) if names.is_empty())
    }

    /// Add an instance, or every instance for the wildcard
    pub fn fence(&mut self, instance: &str) {
        if instance == FENCE_ALL_INSTANCES {
            *self = FencingSet::All;
            return;
        }
        if let FencingSet::Instances(names) = self {
            names.insert(instance.to_string());
        }
    }

    /// Remove an instance, or clear the set for the wildcard.
    ///
    /// Returns false when the instance was not listed. A single instance can
    /// not be removed while the whole cluster is fenced.
    pub fn unfence(&mut self, instance: &str) -> bool {
        if instance == FENCE_ALL_INSTANCES {
            let changed = !self.is_empty();
            *self = FencingSet::default();
            return changed;
        }
        match self {
            FencingSet::All => false,
            FencingSet::Instances(names) => names.remove(instance),
        }
    }
}
