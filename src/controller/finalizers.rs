//! Release of dependent finalizers when a cluster goes away

use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::context::ReconcileContext;
use crate::controller::error::Result;
use crate::controller::retry::retry_on_conflict;

/// Remove the database finalizer from every PostgresDatabase of a cluster.
///
/// Dependents of other clusters are left alone, and a dependent deleted
/// mid-sweep is skipped. Returns how many finalizers were released, so a
/// second sweep over the same namespace returns zero.
pub async fn delete_dependent_finalizers(
    ctx: &ReconcileContext,
    cluster_name: &str,
) -> Result<usize> {
    let databases = ctx
        .bounded("list databases", ctx.store.list_databases(&ctx.namespace))
        .await?;

    let mut released = 0;
    for database in databases
        .into_iter()
        .filter(|db| db.belongs_to(cluster_name) && db.has_finalizer())
    {
        let name = database.name_any();
        let name_ref = name.as_str();
        let mut listed = Some(database);

        let outcome = retry_on_conflict(&ctx.retry, "release database finalizer", move || {
            // The listed copy serves the first attempt; retries re-read
            let cached = listed.take();
            async move {
                let mut database = match cached {
                    Some(database) => database,
                    None => {
                        ctx.bounded(
                            "get database",
                            ctx.store.get_database(&ctx.namespace, name_ref),
                        )
                        .await?
                    }
                };
                if !database.remove_finalizer() {
                    return Ok(false);
                }
                ctx.bounded("update database", ctx.store.update_database(&database))
                    .await?;
                Ok(true)
            }
        })
        .await;

        match outcome {
            Ok(true) => {
                released += 1;
                debug!(database = %name, cluster = %cluster_name, "Released database finalizer");
            }
            Ok(false) => {}
            Err(e) if e.is_not_found() => {
                debug!(database = %name, "Database disappeared during finalizer sweep");
            }
            Err(e) => return Err(e),
        }
    }

    if released > 0 {
        info!(
            cluster = %cluster_name,
            namespace = %ctx.namespace,
            released,
            "Released dependent database finalizers"
        );
    }
    Ok(released)
}
