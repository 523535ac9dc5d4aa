pub mod common;
pub mod secret;
pub mod sql;
pub mod store;

pub use common::{
    API_VERSION, CLUSTER_LABEL, FIELD_MANAGER, JOB_ROLE_LABEL, KIND, cluster_selector, job_labels,
    owner_reference, standard_labels,
};
pub use secret::{KubeSecretResolver, ResolvedSecret, SecretError, SecretResolver};
pub use sql::{PgCatalogConnector, PgRoleCatalog, SqlError};
pub use store::{ClusterStore, KubeClusterStore};
