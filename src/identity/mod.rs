//! # Identity Federation Setup
//!
//! Links a Kubernetes service account to an Azure user-assigned managed
//! identity so workloads can read Key Vault secrets without any long-lived
//! credential.
//!
//! ## Steps
//!
//! Every step is idempotent and safe to re-run:
//!
//! 1. **OIDC issuer** - read the cluster issuer; enable and poll for it when absent
//! 2. **Managed identity** - reuse by name or create
//! 3. **Role binding** - `Key Vault Secrets User` on the vault scope, granted only
//!    when no structurally equal assignment is listed
//! 4. **Federated credential** - skip if an identical credential exists, recreate
//!    when the name is bound to another issuer or subject
//!
//! The identifiers resolved along the way are returned as an updated
//! [`ResolvedConfig`].

use crate::config::resolved::{keys, ResolvedConfig};
use crate::config::DeployerConfig;
use crate::constants::{KEY_VAULT_SECRETS_USER_ROLE, WORKLOAD_IDENTITY_AUDIENCE};
use crate::error::{Component, Condition, DeployerError, Result};
use crate::provider::{AzureError, CloudApi};
use crate::retry::{poll_until, retry, PollError, RetryPolicy};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Annotation carrying the managed identity client id on the service account
pub const CLIENT_ID_ANNOTATION: &str = "azure.workload.identity/client-id";
pub const TENANT_ID_ANNOTATION: &str = "azure.workload.identity/tenant-id";
/// Label that opts pods using the service account into token projection
pub const USE_LABEL: &str = "azure.workload.identity/use";

/// Kubernetes service account a federated credential trusts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceAccountSubject {
    pub namespace: String,
    pub name: String,
}

impl ServiceAccountSubject {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse `system:serviceaccount:<namespace>:<name>`
    pub fn parse(subject: &str) -> Option<Self> {
        let rest = subject.strip_prefix("system:serviceaccount:")?;
        let (namespace, name) = rest.split_once(':')?;
        if namespace.is_empty() || name.is_empty() || name.contains(':') {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ServiceAccountSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "system:serviceaccount:{}:{}", self.namespace, self.name)
    }
}

/// Trust relationship between a cluster issuer and a service account
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FederatedCredential {
    pub name: String,
    pub issuer_url: String,
    pub subject: ServiceAccountSubject,
    pub audience: String,
}

impl FederatedCredential {
    pub fn new(name: &str, issuer_url: &str, subject: ServiceAccountSubject) -> Self {
        Self {
            name: name.to_string(),
            issuer_url: issuer_url.to_string(),
            subject,
            audience: WORKLOAD_IDENTITY_AUDIENCE.to_string(),
        }
    }

    /// Whether both credentials trust the same (issuer, subject) pair
    #[must_use]
    pub fn binds_same(&self, other: &FederatedCredential) -> bool {
        normalize_issuer(&self.issuer_url) == normalize_issuer(&other.issuer_url)
            && self.subject == other.subject
    }
}

fn normalize_issuer(url: &str) -> &str {
    url.trim_end_matches('/')
}

/// User-assigned managed identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedIdentity {
    pub name: String,
    pub id: String,
    pub client_id: String,
    pub principal_id: String,
    pub federated_credentials: BTreeSet<FederatedCredential>,
}

/// A role granted to a principal on a scope
///
/// Equality is structural: scopes and role names compare case-insensitively and
/// ignore trailing slashes, as the platform does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleBinding {
    pub principal_id: String,
    pub role_name: String,
    pub scope: String,
}

impl PartialEq for RoleBinding {
    fn eq(&self, other: &Self) -> bool {
        self.principal_id.eq_ignore_ascii_case(&other.principal_id)
            && self.role_name.eq_ignore_ascii_case(&other.role_name)
            && self
                .scope
                .trim_end_matches('/')
                .eq_ignore_ascii_case(other.scope.trim_end_matches('/'))
    }
}

impl Eq for RoleBinding {}

/// Everything `bind` needs to know
#[derive(Debug, Clone)]
pub struct BindRequest {
    pub resource_group: String,
    pub cluster: String,
    pub location: String,
    pub identity_name: String,
    pub credential_name: String,
    pub subject: ServiceAccountSubject,
    pub role_name: String,
    /// Resource id of the vault the role is granted on
    pub vault_scope: String,
}

impl BindRequest {
    /// Build the request for the voice stack; the vault id comes from provisioning
    pub fn from_config(config: &DeployerConfig, resolved: &ResolvedConfig) -> Result<Self> {
        let vault_scope = resolved.get(keys::KEY_VAULT_ID).ok_or_else(|| {
            DeployerError::prerequisite(
                Component::IdentityFederation,
                format!(
                    "{} not resolved; run `vocarectl provision` first",
                    keys::KEY_VAULT_ID
                ),
            )
        })?;
        Ok(Self {
            resource_group: config.resource_group.clone(),
            cluster: resolved
                .get(keys::AKS_CLUSTER_NAME)
                .unwrap_or(&config.cluster_name)
                .to_string(),
            location: config.location.clone(),
            identity_name: config.identity_name.clone(),
            credential_name: config.federated_credential_name.clone(),
            subject: ServiceAccountSubject::new(&config.namespace, &config.service_account),
            role_name: KEY_VAULT_SECRETS_USER_ROLE.to_string(),
            vault_scope: vault_scope.to_string(),
        })
    }
}

/// What happened to the federated credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CredentialAction {
    Created,
    Existing,
    /// Name was bound to another issuer or subject
    Recreated,
}

/// Result of a successful `bind`
#[derive(Debug, Clone)]
pub struct IdentityBinding {
    pub identity: ManagedIdentity,
    pub credential: FederatedCredential,
    pub credential_action: CredentialAction,
    pub role_granted: bool,
    pub resolved: ResolvedConfig,
}

/// Workload identity federation steps
pub struct IdentityFederation {
    cloud: Arc<dyn CloudApi>,
    policy: RetryPolicy,
    issuer_poll: RetryPolicy,
}

impl std::fmt::Debug for IdentityFederation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityFederation")
            .field("policy", &self.policy)
            .field("issuer_poll", &self.issuer_poll)
            .finish_non_exhaustive()
    }
}

impl IdentityFederation {
    pub fn new(cloud: Arc<dyn CloudApi>, policy: RetryPolicy, issuer_poll: RetryPolicy) -> Self {
        Self {
            cloud,
            policy,
            issuer_poll,
        }
    }

    /// Run the four federation steps in order
    pub async fn bind(
        &self,
        request: &BindRequest,
        resolved: ResolvedConfig,
    ) -> Result<IdentityBinding> {
        let span = info_span!(
            "azure.identity.bind",
            identity.name = %request.identity_name,
            subject = %request.subject
        );
        self.bind_steps(request, resolved).instrument(span).await
    }

    async fn bind_steps(
        &self,
        request: &BindRequest,
        resolved: ResolvedConfig,
    ) -> Result<IdentityBinding> {
        let issuer_url = self.ensure_issuer(request).await?;
        info!("OIDC issuer: {}", issuer_url);

        let identity = self.ensure_identity(request).await?;
        info!(
            "Managed identity {} (client id {})",
            identity.name, identity.client_id
        );

        let role_granted = self.ensure_role(request, &identity).await?;

        let desired =
            FederatedCredential::new(&request.credential_name, &issuer_url, request.subject.clone());
        let (credential, credential_action) =
            self.ensure_federated_credential(request, desired).await?;

        let cloud = &self.cloud;
        let tenant_id = retry(&self.policy, "tenant lookup", AzureError::is_transient, move || {
            cloud.tenant_id()
        })
        .await
        .map_err(|e| failure(Condition::ProvisioningFailure, &e))?;

        let resolved = resolved
            .with(keys::OIDC_ISSUER_URL, issuer_url.as_str())
            .with(keys::IDENTITY_NAME, identity.name.as_str())
            .with(keys::CLIENT_ID, identity.client_id.as_str())
            .with(keys::PRINCIPAL_ID, identity.principal_id.as_str())
            .with(keys::TENANT_ID, tenant_id)
            .with(keys::SERVICE_ACCOUNT_SUBJECT, request.subject.to_string());

        Ok(IdentityBinding {
            identity,
            credential,
            credential_action,
            role_granted,
            resolved,
        })
    }

    async fn ensure_issuer(&self, request: &BindRequest) -> Result<String> {
        let cloud = &self.cloud;
        let (group, cluster) = (request.resource_group.as_str(), request.cluster.as_str());

        let current = retry(&self.policy, "issuer lookup", AzureError::is_transient, move || {
            cloud.oidc_issuer(group, cluster)
        })
        .await
        .map_err(|e| failure(Condition::ProvisioningFailure, &e))?;
        if let Some(url) = current.filter(|u| !u.trim().is_empty()) {
            return Ok(url);
        }

        info!("Enabling OIDC issuer on cluster {}", cluster);
        retry(&self.policy, "issuer enable", AzureError::is_transient, move || {
            cloud.enable_oidc_issuer(group, cluster)
        })
        .await
        .map_err(|e| failure(Condition::ProvisioningFailure, &e))?;

        poll_until(&self.issuer_poll, "OIDC issuer activation", move || async move {
            match cloud.oidc_issuer(group, cluster).await {
                Ok(url) => Ok(url.filter(|u| !u.trim().is_empty())),
                Err(e) if e.is_transient() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| match e {
            PollError::Timeout { what, attempts } => DeployerError::new(
                Condition::Timeout,
                Component::IdentityFederation,
                format!("{what} did not complete after {attempts} polls"),
            ),
            PollError::Failed { source, .. } => failure(Condition::ProvisioningFailure, &source),
        })
    }

    async fn ensure_identity(&self, request: &BindRequest) -> Result<ManagedIdentity> {
        let cloud = &self.cloud;
        let (group, name) = (request.resource_group.as_str(), request.identity_name.as_str());
        let show = move || cloud.show_identity(group, name);

        if let Some(identity) = retry(&self.policy, "identity show", AzureError::is_transient, show)
            .await
            .map_err(|e| failure(Condition::ProvisioningFailure, &e))?
        {
            debug!("Reusing managed identity {}", name);
            return Ok(identity);
        }

        info!("Creating managed identity {}", name);
        let location = request.location.as_str();
        match retry(&self.policy, "identity create", AzureError::is_transient, move || {
            cloud.create_identity(group, name, location)
        })
        .await
        {
            Ok(identity) => Ok(identity),
            Err(e) if e.reason == crate::provider::AzureFailureReason::Conflict => {
                warn!("Managed identity {} created concurrently, re-reading", name);
                retry(&self.policy, "identity show", AzureError::is_transient, show)
                    .await
                    .map_err(|e| failure(Condition::ProvisioningFailure, &e))?
                    .ok_or_else(|| failure(Condition::ProvisioningFailure, &e))
            }
            Err(e) => Err(failure(Condition::ProvisioningFailure, &e)),
        }
    }

    /// Grant the role unless an equal binding is already listed
    /// Returns true when a new assignment was created
    async fn ensure_role(&self, request: &BindRequest, identity: &ManagedIdentity) -> Result<bool> {
        let desired = RoleBinding {
            principal_id: identity.principal_id.clone(),
            role_name: request.role_name.clone(),
            scope: request.vault_scope.clone(),
        };

        let cloud = &self.cloud;
        let (principal, scope) = (desired.principal_id.as_str(), desired.scope.as_str());
        let existing = retry(&self.policy, "role assignment list", AzureError::is_transient, move || {
            cloud.list_role_assignments(principal, scope)
        })
        .await
        .map_err(|e| failure(Condition::ProvisioningFailure, &e))?;

        if existing.contains(&desired) {
            debug!("Role '{}' already granted on {}", desired.role_name, desired.scope);
            return Ok(false);
        }

        info!("Granting '{}' on {}", desired.role_name, desired.scope);
        let binding = &desired;
        match retry(&self.policy, "role assignment create", AzureError::is_transient, move || {
            cloud.create_role_assignment(binding)
        })
        .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.has_code("RoleAssignmentExists") => {
                debug!("Role assignment already exists: {}", e.message);
                Ok(false)
            }
            Err(e) => Err(failure(Condition::ProvisioningFailure, &e)),
        }
    }

    async fn ensure_federated_credential(
        &self,
        request: &BindRequest,
        desired: FederatedCredential,
    ) -> Result<(FederatedCredential, CredentialAction)> {
        let cloud = &self.cloud;
        let (group, identity) = (request.resource_group.as_str(), request.identity_name.as_str());

        let existing = retry(&self.policy, "federated credential list", AzureError::is_transient, move || {
            cloud.list_federated_credentials(group, identity)
        })
        .await
        .map_err(|e| failure(Condition::ProvisioningFailure, &e))?;

        let mut action = CredentialAction::Created;
        if let Some(current) = existing.iter().find(|c| c.name == desired.name) {
            if current.binds_same(&desired) {
                debug!("Federated credential {} already present", desired.name);
                return Ok((current.clone(), CredentialAction::Existing));
            }
            warn!(
                "Federated credential {} binds {} via {}, recreating for {} via {}",
                current.name, current.subject, current.issuer_url, desired.subject, desired.issuer_url
            );
            let name = current.name.as_str();
            retry(&self.policy, "federated credential delete", AzureError::is_transient, move || {
                cloud.delete_federated_credential(group, identity, name)
            })
            .await
            .map_err(|e| failure(Condition::ProvisioningFailure, &e))?;
            action = CredentialAction::Recreated;
        } else if let Some(other) = existing.iter().find(|c| c.binds_same(&desired)) {
            // The platform allows one credential per (issuer, subject)
            debug!(
                "Federated credential {} already trusts {}",
                other.name, desired.subject
            );
            return Ok((other.clone(), CredentialAction::Existing));
        }

        info!("Creating federated credential {} for {}", desired.name, desired.subject);
        let credential = &desired;
        retry(&self.policy, "federated credential create", AzureError::is_transient, move || {
            cloud.create_federated_credential(group, identity, credential)
        })
        .await
        .map_err(|e| failure(Condition::ProvisioningFailure, &e))?;

        Ok((desired, action))
    }
}

fn failure(condition: Condition, error: &AzureError) -> DeployerError {
    DeployerError::new(
        condition,
        Component::IdentityFederation,
        format!("{error}. {}", error.remediation()),
    )
}

/// Service account manifest annotated for workload identity
pub fn render_service_account(
    subject: &ServiceAccountSubject,
    client_id: &str,
    tenant_id: Option<&str>,
) -> ServiceAccount {
    let mut annotations = BTreeMap::from([(CLIENT_ID_ANNOTATION.to_string(), client_id.to_string())]);
    if let Some(tenant_id) = tenant_id {
        annotations.insert(TENANT_ID_ANNOTATION.to_string(), tenant_id.to_string());
    }

    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(subject.name.clone()),
            namespace: Some(subject.namespace.clone()),
            annotations: Some(annotations),
            labels: Some(BTreeMap::from([(USE_LABEL.to_string(), "true".to_string())])),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeCloud;

    const VAULT_ID: &str =
        "/subscriptions/0000/resourceGroups/vocare-rg/providers/Microsoft.KeyVault/vaults/vocare-kv";

    fn request() -> BindRequest {
        let resolved = ResolvedConfig::new().with(keys::KEY_VAULT_ID, VAULT_ID);
        BindRequest::from_config(&DeployerConfig::default(), &resolved).unwrap()
    }

    fn federation(cloud: &Arc<FakeCloud>) -> IdentityFederation {
        IdentityFederation::new(cloud.clone(), RetryPolicy::immediate(3), RetryPolicy::immediate(5))
    }

    #[test]
    fn test_subject_rendering_and_parsing() {
        let subject = ServiceAccountSubject::new("vocare", "vocare-workload");
        assert_eq!(subject.to_string(), "system:serviceaccount:vocare:vocare-workload");
        assert_eq!(ServiceAccountSubject::parse(&subject.to_string()), Some(subject));
        assert_eq!(ServiceAccountSubject::parse("system:serviceaccount:only-ns"), None);
    }

    #[test]
    fn test_role_binding_structural_equality() {
        let a = RoleBinding {
            principal_id: "abc".to_string(),
            role_name: "Key Vault Secrets User".to_string(),
            scope: VAULT_ID.to_string(),
        };
        let b = RoleBinding {
            scope: format!("{}/", VAULT_ID.to_uppercase()),
            role_name: "key vault secrets user".to_string(),
            ..a.clone()
        };
        assert_eq!(a, b);
        assert_ne!(
            a,
            RoleBinding {
                role_name: "Key Vault Secrets Officer".to_string(),
                ..a.clone()
            }
        );
    }

    #[test]
    fn test_bind_request_requires_vault_id() {
        let err = BindRequest::from_config(&DeployerConfig::default(), &ResolvedConfig::new())
            .unwrap_err();
        assert_eq!(err.condition, Condition::PrerequisiteMissing);
    }

    #[tokio::test]
    async fn test_bind_from_scratch() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.issuer_after_polls(2);

        let binding = federation(&cloud).bind(&request(), ResolvedConfig::new()).await.unwrap();

        assert_eq!(binding.credential_action, CredentialAction::Created);
        assert!(binding.role_granted);
        assert_eq!(
            binding.credential.subject.to_string(),
            "system:serviceaccount:vocare:vocare-workload"
        );
        assert_eq!(binding.credential.audience, WORKLOAD_IDENTITY_AUDIENCE);
        assert_eq!(binding.resolved.get(keys::CLIENT_ID), Some(binding.identity.client_id.as_str()));
        assert!(binding.resolved.get(keys::OIDC_ISSUER_URL).is_some());
        assert!(binding.resolved.get(keys::TENANT_ID).is_some());
    }

    #[tokio::test]
    async fn test_second_bind_changes_nothing() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.issuer_after_polls(0);
        let federation = federation(&cloud);

        federation.bind(&request(), ResolvedConfig::new()).await.unwrap();
        let second = federation.bind(&request(), ResolvedConfig::new()).await.unwrap();

        assert_eq!(second.credential_action, CredentialAction::Existing);
        assert!(!second.role_granted);
        assert_eq!(cloud.role_assignment_count(), 1);
        assert_eq!(cloud.identity_create_calls(), 1);
    }

    #[tokio::test]
    async fn test_issuer_poll_timeout() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.issuer_after_polls(100);

        let err = federation(&cloud)
            .bind(&request(), ResolvedConfig::new())
            .await
            .unwrap_err();
        assert_eq!(err.condition, Condition::Timeout);
        assert_eq!(err.component, Component::IdentityFederation);
    }

    #[tokio::test]
    async fn test_role_assignment_exists_code_is_success() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.issuer_after_polls(0);
        cloud.fail_next_role_assignment(AzureError::from_stderr(
            "role assignment create",
            "ERROR: (RoleAssignmentExists) The role assignment already exists.",
        ));

        let binding = federation(&cloud).bind(&request(), ResolvedConfig::new()).await.unwrap();
        assert!(!binding.role_granted);
    }

    #[tokio::test]
    async fn test_role_assignment_permission_denied_is_fatal() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.issuer_after_polls(0);
        cloud.fail_next_role_assignment(AzureError::from_stderr(
            "role assignment create",
            "ERROR: (AuthorizationFailed) The client does not have authorization to perform action 'Microsoft.Authorization/roleAssignments/write'",
        ));

        let err = federation(&cloud)
            .bind(&request(), ResolvedConfig::new())
            .await
            .unwrap_err();
        assert_eq!(err.condition, Condition::ProvisioningFailure);
        assert!(err.message.contains("AuthorizationFailed"));
    }

    #[tokio::test]
    async fn test_subject_change_recreates_credential() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.issuer_after_polls(0);
        let federation = federation(&cloud);
        federation.bind(&request(), ResolvedConfig::new()).await.unwrap();

        let mut moved = request();
        moved.subject = ServiceAccountSubject::new("vocare-staging", "vocare-workload");
        let binding = federation.bind(&moved, ResolvedConfig::new()).await.unwrap();

        assert_eq!(binding.credential_action, CredentialAction::Recreated);
        let credentials = cloud.federated_credentials(&moved.identity_name);
        assert_eq!(credentials.len(), 1);
        assert_eq!(credentials[0].subject.namespace, "vocare-staging");
    }

    #[test]
    fn test_render_service_account() {
        let subject = ServiceAccountSubject::new("vocare", "vocare-workload");
        let sa = render_service_account(&subject, "client-123", Some("tenant-1"));
        let annotations = sa.metadata.annotations.unwrap();
        assert_eq!(annotations.get(CLIENT_ID_ANNOTATION).map(String::as_str), Some("client-123"));
        assert_eq!(annotations.get(TENANT_ID_ANNOTATION).map(String::as_str), Some("tenant-1"));
        assert_eq!(
            sa.metadata.labels.unwrap().get(USE_LABEL).map(String::as_str),
            Some("true")
        );
    }
}
