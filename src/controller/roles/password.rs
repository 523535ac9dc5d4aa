//! Password handling for managed roles
//!
//! A role's password is driven by two fields, `passwordSecret` and
//! `disablePassword`, giving four mutually exclusive cases:
//!
//! | secret | disabled | action                                   |
//! |--------|----------|------------------------------------------|
//! | no     | no       | leave the live password alone            |
//! | no     | yes      | `PASSWORD NULL`                          |
//! | yes    | yes      | contradictory, reported as a conflict    |
//! | yes    | no       | apply the secret when it changed         |

use std::fmt;

use crate::controller::context::ReconcileContext;
use crate::controller::error::{Error, Result};
use crate::crd::RoleConfiguration;
use crate::resources::secret::SecretResolver;

/// What the configuration asks for, before any secret is read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PasswordIntent<'a> {
    Untouched,
    Cleared,
    Conflict { secret_name: &'a str },
    FromSecret { secret_name: &'a str },
}

impl<'a> PasswordIntent<'a> {
    pub fn of(config: &'a RoleConfiguration) -> Self {
        match (config.password_secret_name(), config.disable_password) {
            (None, false) => PasswordIntent::Untouched,
            (None, true) => PasswordIntent::Cleared,
            (Some(secret_name), true) => PasswordIntent::Conflict { secret_name },
            (Some(secret_name), false) => PasswordIntent::FromSecret { secret_name },
        }
    }

    /// Fail with `ConfigurationConflict` for the contradictory case
    pub fn check(self, role: &str) -> Result<Self> {
        match self {
            PasswordIntent::Conflict { secret_name } => Err(Error::ConfigurationConflict {
                role: role.to_string(),
                secret: secret_name.to_string(),
            }),
            other => Ok(other),
        }
    }
}

/// Password step for one role, with the secret material resolved
#[derive(Clone, PartialEq, Eq)]
pub enum PasswordAction {
    Untouched,
    Cleared,
    Conflict { secret_name: String },
    Rotate {
        password: String,
        resource_version: String,
    },
}

impl fmt::Debug for PasswordAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasswordAction::Untouched => write!(f, "Untouched"),
            PasswordAction::Cleared => write!(f, "Cleared"),
            PasswordAction::Conflict { secret_name } => f
                .debug_struct("Conflict")
                .field("secret_name", secret_name)
                .finish(),
            PasswordAction::Rotate {
                resource_version, ..
            } => f
                .debug_struct("Rotate")
                .field("password", &"<redacted>")
                .field("resource_version", resource_version)
                .finish(),
        }
    }
}

impl PasswordAction {
    /// Version recorded in the password state once this action is applied.
    ///
    /// A cleared password is tracked with an empty version.
    pub fn latest_version(&self) -> Option<&str> {
        match self {
            PasswordAction::Cleared => Some(""),
            PasswordAction::Rotate {
                resource_version, ..
            } => Some(resource_version),
            PasswordAction::Untouched | PasswordAction::Conflict { .. } => None,
        }
    }
}

/// Resolve the password step for a role, reading its secret if needed
pub async fn resolve_password_action(
    ctx: &ReconcileContext,
    secrets: &dyn SecretResolver,
    config: &RoleConfiguration,
) -> Result<PasswordAction> {
    match PasswordIntent::of(config) {
        PasswordIntent::Untouched => Ok(PasswordAction::Untouched),
        PasswordIntent::Cleared => Ok(PasswordAction::Cleared),
        PasswordIntent::Conflict { secret_name } => Ok(PasswordAction::Conflict {
            secret_name: secret_name.to_string(),
        }),
        PasswordIntent::FromSecret { secret_name } => {
            let resolved = ctx
                .bounded(
                    "password secret",
                    secrets.resolve(&ctx.namespace, secret_name),
                )
                .await?;
            resolved.ensure_user(secret_name, &config.name)?;
            Ok(PasswordAction::Rotate {
                password: resolved.password,
                resource_version: resolved.resource_version,
            })
        }
    }
}
