//! Managed role synchronization
//!
//! One pass diffs the declared roles against the live catalog and applies
//! the smallest set of statements that closes the gap. Each role is its own
//! unit of work: a failed statement stops the remaining steps for that role
//! only, and the failure is reported alongside the roles that succeeded.
//! Within a role the steps run in a fixed order: create or alter, membership,
//! comment, then password, so the recorded transaction id is taken after the
//! last write to the role row.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;

use tracing::{debug, info, warn};

use crate::controller::context::ReconcileContext;
use crate::controller::error::{Error, Result, RoleFailure};
use crate::controller::roles::catalog::RoleCatalog;
use crate::controller::roles::contract::DatabaseRole;
use crate::controller::roles::password::{PasswordAction, PasswordIntent, resolve_password_action};
use crate::crd::{EnsureOption, PasswordState, RoleConfiguration};
use crate::resources::secret::SecretResolver;
use crate::resources::sql::SqlError;

/// Roles owned by the database or the operator itself
pub const RESERVED_ROLES: &[&str] = &["postgres", "streaming_replica"];

/// Whether a role is outside the operator's management
pub fn is_reserved_role(name: &str) -> bool {
    RESERVED_ROLES.contains(&name) || name.starts_with("pg_")
}

/// What to do with live roles that are not declared
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoleSyncPolicy {
    /// Drop them instead of reporting them as unmanaged
    pub drop_unmanaged: bool,
}

/// Kind of statement applied to a role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoleOperation {
    Validate,
    Create,
    Alter,
    Membership,
    Comment,
    Password,
    Drop,
}

impl RoleOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleOperation::Validate => "validate",
            RoleOperation::Create => "create",
            RoleOperation::Alter => "alter",
            RoleOperation::Membership => "membership",
            RoleOperation::Comment => "comment",
            RoleOperation::Password => "password",
            RoleOperation::Drop => "drop",
        }
    }
}

impl fmt::Display for RoleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one synchronization pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoleSyncReport {
    pub created: Vec<String>,
    pub altered: Vec<String>,
    pub dropped: Vec<String>,
    pub passwords_rotated: Vec<String>,
    /// Live roles that are neither declared nor reserved
    pub unmanaged: Vec<String>,
    /// Declared roles that ended the pass without a failure
    pub reconciled: Vec<String>,
    /// Password state to persist, keyed by role
    pub password_states: BTreeMap<String, PasswordState>,
    pub failures: Vec<RoleFailure>,
}

impl RoleSyncReport {
    /// Whether the pass changed anything in the database
    pub fn wrote(&self) -> bool {
        !(self.created.is_empty()
            && self.altered.is_empty()
            && self.dropped.is_empty()
            && self.passwords_rotated.is_empty())
    }

    /// `PartialFailure` when any role failed
    pub fn partial_failure(&self) -> Option<Error> {
        (!self.failures.is_empty()).then(|| Error::PartialFailure(self.failures.clone()))
    }

    /// Failure messages grouped by role
    pub fn failures_by_role(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for failure in &self.failures {
            grouped
                .entry(failure.role.clone())
                .or_default()
                .push(format!("{}: {}", failure.operation, failure.message));
        }
        grouped
    }

    fn fail(&mut self, role: &str, operation: RoleOperation, error: &Error) {
        warn!(role = %role, operation = %operation, error = %error, "Role operation failed");
        self.failures.push(RoleFailure {
            role: role.to_string(),
            operation: operation.to_string(),
            message: error.to_string(),
        });
    }
}

/// A failed step of a single role
struct StepError {
    operation: RoleOperation,
    error: Error,
}

async fn step<T, F>(ctx: &ReconcileContext, operation: RoleOperation, fut: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, SqlError>>,
{
    ctx.bounded(operation.as_str(), fut)
        .await
        .map_err(|error| StepError { operation, error })
}

/// Synchronize the declared roles with the catalog.
///
/// Returns an error only for problems that affect the whole pass: a
/// contradictory password configuration on a present role (checked before
/// any write), a failure to read the catalog, or the deadline. Per-role
/// failures are collected in the report.
pub async fn sync_roles(
    ctx: &ReconcileContext,
    catalog: &dyn RoleCatalog,
    secrets: &dyn SecretResolver,
    desired: &[RoleConfiguration],
    stored: &BTreeMap<String, PasswordState>,
    policy: RoleSyncPolicy,
) -> Result<RoleSyncReport> {
    // Absent roles are only dropped
    for config in desired.iter().filter(|c| c.ensure == EnsureOption::Present) {
        PasswordIntent::of(config).check(&config.name)?;
    }

    let mut report = RoleSyncReport::default();

    let live_roles = ctx.bounded("list roles", catalog.list_roles()).await?;
    let live: BTreeMap<&str, &DatabaseRole> = live_roles
        .iter()
        .filter(|r| !is_reserved_role(&r.name))
        .map(|r| (r.name.as_str(), r))
        .collect();

    let mut declared: BTreeSet<&str> = BTreeSet::new();
    for config in desired {
        let name = config.name.as_str();
        if is_reserved_role(name) {
            report.fail(
                name,
                RoleOperation::Validate,
                &Error::InvalidConfig(format!("role {name} is reserved and cannot be managed")),
            );
            continue;
        }
        if !declared.insert(name) {
            report.fail(
                name,
                RoleOperation::Validate,
                &Error::InvalidConfig(format!("role {name} is declared more than once")),
            );
            continue;
        }

        let outcome = match config.ensure {
            EnsureOption::Absent => match live.get(name) {
                Some(_) => drop_role(ctx, catalog, name, &mut report).await.map(|()| None),
                None => Ok(None),
            },
            EnsureOption::Present => {
                apply_role(
                    ctx,
                    catalog,
                    secrets,
                    config,
                    live.get(name).copied(),
                    stored.get(name),
                    &mut report,
                )
                .await
            }
        };

        match outcome {
            Ok(state) => {
                if let Some(state) = state {
                    report.password_states.insert(name.to_string(), state);
                }
                report.reconciled.push(name.to_string());
            }
            Err(StepError {
                error: Error::Timeout(what),
                ..
            }) => return Err(Error::Timeout(what)),
            Err(StepError { operation, error }) => {
                report.fail(name, operation, &error);
                if config.ensure == EnsureOption::Present
                    && let Some(previous) = stored.get(name)
                {
                    report
                        .password_states
                        .insert(name.to_string(), previous.clone());
                }
            }
        }
    }

    for name in live.keys().filter(|name| !declared.contains(*name)) {
        if !policy.drop_unmanaged {
            report.unmanaged.push(name.to_string());
            continue;
        }
        match drop_role(ctx, catalog, name, &mut report).await {
            Ok(()) => {}
            Err(StepError {
                error: Error::Timeout(what),
                ..
            }) => return Err(Error::Timeout(what)),
            Err(StepError { operation, error }) => report.fail(name, operation, &error),
        }
    }

    debug!(
        created = report.created.len(),
        altered = report.altered.len(),
        dropped = report.dropped.len(),
        passwords_rotated = report.passwords_rotated.len(),
        unmanaged = report.unmanaged.len(),
        failures = report.failures.len(),
        "Role synchronization pass finished"
    );

    Ok(report)
}

async fn drop_role(
    ctx: &ReconcileContext,
    catalog: &dyn RoleCatalog,
    name: &str,
    report: &mut RoleSyncReport,
) -> Result<(), StepError> {
    step(ctx, RoleOperation::Drop, catalog.drop_role(name)).await?;
    info!(role = %name, "Dropped role");
    report.dropped.push(name.to_string());
    Ok(())
}

/// Bring one present role in line, returning the password state to keep
async fn apply_role(
    ctx: &ReconcileContext,
    catalog: &dyn RoleCatalog,
    secrets: &dyn SecretResolver,
    config: &RoleConfiguration,
    live: Option<&DatabaseRole>,
    stored: Option<&PasswordState>,
    report: &mut RoleSyncReport,
) -> Result<Option<PasswordState>, StepError> {
    let desired = DatabaseRole::from_configuration(config);
    let name = desired.name.as_str();
    let mut row_written = false;

    // A freshly created role has no membership and no comment
    let baseline = match live {
        Some(current) => {
            if !desired.is_equivalent_to(current) {
                step(ctx, RoleOperation::Alter, catalog.update_role(&desired)).await?;
                info!(role = %name, "Altered role");
                report.altered.push(name.to_string());
                row_written = true;
            }
            current.clone()
        }
        None => {
            step(ctx, RoleOperation::Create, catalog.create_role(&desired)).await?;
            info!(role = %name, "Created role");
            report.created.push(name.to_string());
            row_written = true;
            DatabaseRole {
                comment: String::new(),
                in_roles: Vec::new(),
                ..desired.clone()
            }
        }
    };

    let changes = desired.membership_changes(&baseline);
    if !changes.is_empty() {
        step(
            ctx,
            RoleOperation::Membership,
            catalog.update_membership(name, &changes.grant, &changes.revoke),
        )
        .await?;
        debug!(role = %name, grant = ?changes.grant, revoke = ?changes.revoke, "Updated role membership");
        if live.is_some() && !row_written {
            report.altered.push(name.to_string());
        }
    }

    if !desired.has_same_comment_as(&baseline) {
        step(ctx, RoleOperation::Comment, catalog.update_comment(&desired)).await?;
        debug!(role = %name, "Updated role comment");
    }

    let action = resolve_password_action(ctx, secrets, config)
        .await
        .map_err(|error| StepError {
            operation: RoleOperation::Password,
            error,
        })?;

    let latest_version = match &action {
        PasswordAction::Untouched => return Ok(None),
        PasswordAction::Conflict { secret_name } => {
            return Err(StepError {
                operation: RoleOperation::Password,
                error: Error::ConfigurationConflict {
                    role: name.to_string(),
                    secret: secret_name.clone(),
                },
            });
        }
        PasswordAction::Cleared | PasswordAction::Rotate { .. } => {
            action.latest_version().unwrap_or_default().to_string()
        }
    };

    let needs_update = live.is_none() || baseline.password_needs_updating(stored, &latest_version);

    let transaction_id = if needs_update {
        let txid = match &action {
            PasswordAction::Rotate { password, .. } => {
                step(ctx, RoleOperation::Password, catalog.set_password(name, password)).await?
            }
            _ => step(ctx, RoleOperation::Password, catalog.clear_password(name)).await?,
        };
        info!(role = %name, "Applied role password");
        report.passwords_rotated.push(name.to_string());
        txid
    } else if row_written {
        step(ctx, RoleOperation::Password, catalog.transaction_id(name)).await?
    } else {
        return Ok(stored.cloned());
    };

    Ok(Some(PasswordState {
        transaction_id,
        resource_version: latest_version,
    }))
}
