//! Versioned access to cluster, database and job objects
//!
//! `ClusterStore` is the seam between the reconcile logic and the Kubernetes
//! API. Updates are full replacements carrying the object's resource
//! version, so a concurrent writer surfaces as `Error::Conflict` instead of a
//! lost update.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::controller::error::{Error, Result};
use crate::crd::{PostgresCluster, PostgresDatabase};
use crate::resources::common::cluster_selector;

/// Get, update, list and delete operations over the operator's objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<PostgresCluster>;

    /// Replace metadata and spec; fails with `Conflict` on a stale resource version
    async fn update_cluster(&self, cluster: &PostgresCluster) -> Result<PostgresCluster>;

    /// Replace the status subresource; fails with `Conflict` on a stale resource version
    async fn update_cluster_status(&self, cluster: &PostgresCluster) -> Result<PostgresCluster>;

    async fn list_databases(&self, namespace: &str) -> Result<Vec<PostgresDatabase>>;

    async fn get_database(&self, namespace: &str, name: &str) -> Result<PostgresDatabase>;

    /// Replace a database; fails with `Conflict` on a stale resource version
    async fn update_database(&self, database: &PostgresDatabase) -> Result<PostgresDatabase>;

    /// Jobs labelled as belonging to the cluster
    async fn list_jobs(&self, namespace: &str, cluster_name: &str) -> Result<Vec<Job>>;

    /// Create a job; fails with `AlreadyExists` when the name is taken
    async fn create_job(&self, job: &Job) -> Result<Job>;

    /// Delete a job and its pods; a missing job is not an error
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Cluster store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Map API errors onto the controller taxonomy
fn map_api_error(err: kube::Error, what: impl Into<String>) -> Error {
    if let kube::Error::Api(resp) = &err {
        match resp.code {
            404 => return Error::NotFound(what.into()),
            409 if resp.reason == "AlreadyExists" => return Error::AlreadyExists(what.into()),
            409 => return Error::Conflict(format!("{}: {}", what.into(), resp.message)),
            _ => {}
        }
    }
    Error::KubeError(err)
}

fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<PostgresCluster> {
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_api_error(e, format!("PostgresCluster {namespace}/{name}")))
    }

    async fn update_cluster(&self, cluster: &PostgresCluster) -> Result<PostgresCluster> {
        let ns = namespace_of(cluster)?;
        let name = cluster.name_any();
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), &ns);
        api.replace(&name, &PostParams::default(), cluster)
            .await
            .map_err(|e| map_api_error(e, format!("PostgresCluster {ns}/{name}")))
    }

    async fn update_cluster_status(&self, cluster: &PostgresCluster) -> Result<PostgresCluster> {
        let ns = namespace_of(cluster)?;
        let name = cluster.name_any();
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), &ns);
        let body = serde_json::to_vec(cluster)?;
        api.replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| map_api_error(e, format!("PostgresCluster {ns}/{name} status")))
    }

    async fn list_databases(&self, namespace: &str) -> Result<Vec<PostgresDatabase>> {
        let api: Api<PostgresDatabase> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get_database(&self, namespace: &str, name: &str) -> Result<PostgresDatabase> {
        let api: Api<PostgresDatabase> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_api_error(e, format!("PostgresDatabase {namespace}/{name}")))
    }

    async fn update_database(&self, database: &PostgresDatabase) -> Result<PostgresDatabase> {
        let ns = namespace_of(database)?;
        let name = database.name_any();
        let api: Api<PostgresDatabase> = Api::namespaced(self.client.clone(), &ns);
        api.replace(&name, &PostParams::default(), database)
            .await
            .map_err(|e| map_api_error(e, format!("PostgresDatabase {ns}/{name}")))
    }

    async fn list_jobs(&self, namespace: &str, cluster_name: &str) -> Result<Vec<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&cluster_selector(cluster_name));
        let list = api.list(&params).await?;
        Ok(list.items)
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        let ns = namespace_of(job)?;
        let name = job.name_any();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &ns);
        api.create(&PostParams::default(), job)
            .await
            .map_err(|e| map_api_error(e, format!("Job {ns}/{name}")))
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => {
                debug!(job = %name, namespace = %namespace, "Deleted job");
                Ok(())
            }
            Err(e) => match map_api_error(e, format!("Job {namespace}/{name}")) {
                Error::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
