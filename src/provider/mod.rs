//! # Provider Modules
//!
//! Seams to the Azure platform.
//!
//! - [`CloudApi`] - control plane (resource groups, registry, cluster, vault,
//!   managed identities, role assignments, federated credentials)
//! - [`VaultStore`] - Key Vault data plane (secret writes)
//!
//! The production implementations live in [`azure`]; core algorithms are
//! tested against the in-memory fakes in `fake`.

use crate::identity::{FederatedCredential, ManagedIdentity, RoleBinding};
use crate::reconciler::ResourceDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod azure;

#[cfg(test)]
pub(crate) mod fake;

/// Observed state of a provisioned resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceState {
    /// Fully-qualified platform resource id
    pub id: String,
    /// Current tier, for resources that have one
    pub sku: Option<String>,
    /// Public endpoint (registry login server, vault URI, cluster FQDN)
    pub endpoint: Option<String>,
    /// Raw platform metadata, exported verbatim by backups
    pub raw: serde_json::Value,
}

/// Key Vault secret metadata; never carries a value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSecretInfo {
    pub name: String,
    pub enabled: Option<bool>,
    pub content_type: Option<String>,
    pub updated: Option<String>,
}

/// Registry repository with its tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRepository {
    pub name: String,
    pub tags: Vec<String>,
}

/// Azure control plane operations used by provisioning and backup
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Existence check; `Ok(None)` when the resource is absent
    async fn show(&self, descriptor: &ResourceDescriptor)
        -> Result<Option<ResourceState>, AzureError>;

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<ResourceState, AzureError>;

    /// Move a resource to a higher tier in place
    async fn upgrade_sku(
        &self,
        descriptor: &ResourceDescriptor,
        sku: &str,
    ) -> Result<ResourceState, AzureError>;

    /// Current OIDC issuer URL of a cluster, `None` while not enabled
    async fn oidc_issuer(
        &self,
        resource_group: &str,
        cluster: &str,
    ) -> Result<Option<String>, AzureError>;

    async fn enable_oidc_issuer(&self, resource_group: &str, cluster: &str)
        -> Result<(), AzureError>;

    async fn show_identity(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<Option<ManagedIdentity>, AzureError>;

    async fn create_identity(
        &self,
        resource_group: &str,
        name: &str,
        location: &str,
    ) -> Result<ManagedIdentity, AzureError>;

    /// Assignments held by a principal on a scope
    async fn list_role_assignments(
        &self,
        principal_id: &str,
        scope: &str,
    ) -> Result<Vec<RoleBinding>, AzureError>;

    async fn create_role_assignment(&self, binding: &RoleBinding) -> Result<(), AzureError>;

    async fn list_federated_credentials(
        &self,
        resource_group: &str,
        identity_name: &str,
    ) -> Result<Vec<FederatedCredential>, AzureError>;

    async fn create_federated_credential(
        &self,
        resource_group: &str,
        identity_name: &str,
        credential: &FederatedCredential,
    ) -> Result<(), AzureError>;

    async fn delete_federated_credential(
        &self,
        resource_group: &str,
        identity_name: &str,
        name: &str,
    ) -> Result<(), AzureError>;

    async fn tenant_id(&self) -> Result<String, AzureError>;

    /// Names and attributes of vault secrets (values are never read)
    async fn list_vault_secrets(&self, vault_name: &str)
        -> Result<Vec<VaultSecretInfo>, AzureError>;

    async fn list_registry_repositories(
        &self,
        registry_name: &str,
    ) -> Result<Vec<RegistryRepository>, AzureError>;
}

/// Key Vault data plane
#[async_trait]
pub trait VaultStore: Send + Sync {
    /// Create or update a secret by name
    /// Returns true if the secret was written, false if the stored value already matched
    async fn create_or_update_secret(
        &self,
        secret_name: &str,
        secret_value: &str,
        content_type: Option<&str>,
    ) -> anyhow::Result<bool>;
}

/// A failed control plane call, classified
#[derive(Debug, Clone, Error)]
#[error("{operation} failed ({reason}): {message}")]
pub struct AzureError {
    pub operation: String,
    pub reason: AzureFailureReason,
    /// Platform error code when one was reported (`RoleAssignmentExists`, `QuotaExceeded`, ...)
    pub code: Option<String>,
    pub message: String,
}

impl AzureError {
    /// Build an error, classifying it from the platform code and message
    pub fn new(operation: impl Into<String>, code: Option<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let reason = classify_azure_error(code.as_deref(), &message);
        Self {
            operation: operation.into(),
            reason,
            code,
            message,
        }
    }

    /// Build an error from raw `az` stderr, extracting the error code
    pub fn from_stderr(operation: impl Into<String>, stderr: &str) -> Self {
        Self::new(operation, extract_error_code(stderr), stderr.trim())
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.reason.is_transient()
    }

    /// Whether the platform reported exactly this error code
    #[must_use]
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(code))
    }

    pub fn remediation(&self) -> &'static str {
        self.reason.remediation()
    }
}

/// Classification of Azure control plane failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AzureFailureReason {
    /// Resource or parent does not exist
    NotFound,
    /// Resource already exists (typically a create race)
    Conflict,
    /// Globally-unique name is taken by another owner
    NameCollision,
    /// Subscription quota or capacity exhausted
    QuotaExceeded,
    /// Caller lacks the required role
    PermissionDenied,
    /// Throttling, timeouts, in-flight operations (retry)
    Transient,
    Other,
}

impl AzureFailureReason {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, AzureFailureReason::Transient)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AzureFailureReason::NotFound => "not_found",
            AzureFailureReason::Conflict => "conflict",
            AzureFailureReason::NameCollision => "name_collision",
            AzureFailureReason::QuotaExceeded => "quota_exceeded",
            AzureFailureReason::PermissionDenied => "permission_denied",
            AzureFailureReason::Transient => "transient",
            AzureFailureReason::Other => "other",
        }
    }

    #[must_use]
    pub fn remediation(&self) -> &'static str {
        match self {
            AzureFailureReason::NotFound => {
                "Verify the parent resource group and resource names, then re-run provisioning."
            }
            AzureFailureReason::Conflict => {
                "Another writer created the resource concurrently; re-run to converge."
            }
            AzureFailureReason::NameCollision => {
                "The name is globally taken by another owner. Choose a different name via VOCARE_* overrides."
            }
            AzureFailureReason::QuotaExceeded => {
                "Request a quota increase for the subscription/region or pick a smaller node size."
            }
            AzureFailureReason::PermissionDenied => {
                "The signed-in principal lacks the required role. Owner or User Access Administrator is needed for role assignments."
            }
            AzureFailureReason::Transient => {
                "Transient platform failure; retried automatically. Re-run if it persists."
            }
            AzureFailureReason::Other => "Inspect the platform error message above.",
        }
    }
}

impl fmt::Display for AzureFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an Azure failure from its error code and message
///
/// The platform error code is checked first since it is stable; the message
/// is only consulted when no code was reported or the code is not recognised.
pub fn classify_azure_error(code: Option<&str>, message: &str) -> AzureFailureReason {
    if let Some(code) = code {
        match code {
            "ResourceNotFound" | "ResourceGroupNotFound" | "ParentResourceNotFound"
            | "NotFound" | "SecretNotFound" | "VaultNotFound" => {
                return AzureFailureReason::NotFound
            }
            "Conflict" | "RoleAssignmentExists" | "ResourceExists" | "AlreadyExists" => {
                return AzureFailureReason::Conflict
            }
            "AlreadyInUse" | "StorageAccountAlreadyTaken" | "VaultAlreadyExists"
            | "RegistryNameNotAvailable" | "NameNotAvailable" => {
                return AzureFailureReason::NameCollision
            }
            "QuotaExceeded" | "OperationNotAllowed" | "SkuNotAvailable" => {
                return AzureFailureReason::QuotaExceeded
            }
            "AuthorizationFailed" | "LinkedAuthorizationFailed" | "Forbidden"
            | "AuthorizationPermissionMismatch" => return AzureFailureReason::PermissionDenied,
            "TooManyRequests" | "RetryableError" | "InternalServerError"
            | "ServiceUnavailable" | "GatewayTimeout" | "AnotherOperationInProgress"
            | "OperationPreempted" | "PrincipalNotFound" => return AzureFailureReason::Transient,
            _ => {}
        }
    }

    let lower = message.to_lowercase();
    if lower.contains("already taken")
        || lower.contains("already in use")
        || lower.contains("is not available")
    {
        AzureFailureReason::NameCollision
    } else if lower.contains("already exists") || lower.contains("(409)") {
        AzureFailureReason::Conflict
    } else if lower.contains("quota") {
        AzureFailureReason::QuotaExceeded
    } else if lower.contains("does not have authorization")
        || lower.contains("authorizationfailed")
        || lower.contains("forbidden")
        || lower.contains("(403)")
    {
        AzureFailureReason::PermissionDenied
    } else if lower.contains("not found")
        || lower.contains("could not be found")
        || lower.contains("(404)")
    {
        AzureFailureReason::NotFound
    } else if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection reset")
        || lower.contains("temporarily unavailable")
        || lower.contains("too many requests")
        || lower.contains("toomanyrequests")
        || lower.contains("serviceunavailable")
        || lower.contains("(429)")
        || lower.contains("(503)")
    {
        AzureFailureReason::Transient
    } else {
        AzureFailureReason::Other
    }
}

/// Extract the error code from `az` stderr
///
/// `az` reports failures as `ERROR: (Code) message` and/or a `Code: X` line.
fn extract_error_code(stderr: &str) -> Option<String> {
    for line in stderr.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Code:") {
            let code = rest.trim();
            if !code.is_empty() {
                return Some(code.to_string());
            }
        }
    }
    let rest = stderr.trim().strip_prefix("ERROR:")?.trim_start();
    let inner = rest.strip_prefix('(')?;
    let end = inner.find(')')?;
    let code = &inner[..end];
    (!code.is_empty() && code.chars().all(|c| c.is_ascii_alphanumeric()))
        .then(|| code.to_string())
}
