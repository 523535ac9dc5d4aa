//! Password secret lookup
//!
//! Role passwords live in Kubernetes Secrets with `username` and `password`
//! keys. Only the password and the Secret's resource version leave this
//! module; the resource version is what tells the role engine whether a
//! rotation has already been applied.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Key holding the role name
pub const USERNAME_KEY: &str = "username";

/// Key holding the password
pub const PASSWORD_KEY: &str = "password";

/// Errors that can occur while resolving a Secret
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Secret {0} not found")]
    NotFound(String),

    #[error("Secret {secret} has no {key} key")]
    MissingKey { secret: String, key: &'static str },

    #[error("Secret {secret} key {key} is not valid UTF-8")]
    InvalidEncoding { secret: String, key: &'static str },

    #[error("Secret {secret} is for user {found}, expected {expected}")]
    UsernameMismatch {
        secret: String,
        expected: String,
        found: String,
    },

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),
}

/// Credential read from a Secret
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    pub username: Option<String>,
    pub password: String,
    pub resource_version: String,
}

impl fmt::Debug for ResolvedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSecret")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("resource_version", &self.resource_version)
            .finish()
    }
}

impl ResolvedSecret {
    /// Check that the Secret belongs to `role`, when it names a user at all
    pub fn ensure_user(&self, secret: &str, role: &str) -> Result<(), SecretError> {
        match self.username.as_deref() {
            Some(found) if found != role => Err(SecretError::UsernameMismatch {
                secret: secret.to_string(),
                expected: role.to_string(),
                found: found.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Resolves a named Secret to a credential plus its version token
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<ResolvedSecret, SecretError>;
}

/// Secret resolver backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeSecretResolver {
    client: Client,
}

impl KubeSecretResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretResolver for KubeSecretResolver {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<ResolvedSecret, SecretError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await?
            .ok_or_else(|| SecretError::NotFound(format!("{namespace}/{name}")))?;
        resolve_secret(&secret)
    }
}

/// Extract the credential from a fetched Secret
pub fn resolve_secret(secret: &Secret) -> Result<ResolvedSecret, SecretError> {
    let name = secret.name_any();
    let password = read_key(secret, &name, PASSWORD_KEY)?.ok_or(SecretError::MissingKey {
        secret: name.clone(),
        key: PASSWORD_KEY,
    })?;

    Ok(ResolvedSecret {
        username: read_key(secret, &name, USERNAME_KEY)?,
        password,
        resource_version: secret.resource_version().unwrap_or_default(),
    })
}

fn read_key(secret: &Secret, name: &str, key: &'static str) -> Result<Option<String>, SecretError> {
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(value.0.clone())
            .map(Some)
            .map_err(|_| SecretError::InvalidEncoding {
                secret: name.to_string(),
                key,
            });
    }
    Ok(secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned())
}
