//! In-memory provider fakes for unit tests.

use super::{
    AzureError, CloudApi, RegistryRepository, ResourceState, VaultSecretInfo, VaultStore,
};
use crate::identity::{FederatedCredential, ManagedIdentity, RoleBinding};
use crate::reconciler::{ResourceDescriptor, ResourceKind};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct CloudState {
    resources: HashMap<(ResourceKind, String), ResourceState>,
    create_calls: u32,
    create_failures: VecDeque<AzureError>,
    failing_kinds: HashMap<ResourceKind, AzureError>,
    race_next_create: bool,
    issuer_enabled: bool,
    issuer_pending_polls: u32,
    identities: HashMap<String, ManagedIdentity>,
    identity_create_calls: u32,
    role_assignments: Vec<RoleBinding>,
    role_failures: VecDeque<AzureError>,
    credentials: HashMap<String, Vec<FederatedCredential>>,
    vault_secrets: Vec<VaultSecretInfo>,
    repositories: Vec<RegistryRepository>,
    fail_listings: bool,
}

/// Control plane fake backed by a mutex-guarded state
#[derive(Default)]
pub(crate) struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    fn with_state<T>(&self, f: impl FnOnce(&mut CloudState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub(crate) fn insert_resource(&self, descriptor: &ResourceDescriptor, sku: Option<&str>) {
        let resource = state_for(descriptor, sku);
        self.with_state(|s| {
            s.resources
                .insert((descriptor.kind, descriptor.name.clone()), resource)
        });
    }

    pub(crate) fn create_calls(&self) -> u32 {
        self.with_state(|s| s.create_calls)
    }

    pub(crate) fn fail_next_create(&self, error: AzureError) {
        self.with_state(|s| s.create_failures.push_back(error));
    }

    /// Every create of `kind` fails with `error`
    pub(crate) fn fail_create_of(&self, kind: ResourceKind, error: AzureError) {
        self.with_state(|s| s.failing_kinds.insert(kind, error));
    }

    /// The next create finds the resource created by someone else
    pub(crate) fn race_next_create(&self) {
        self.with_state(|s| s.race_next_create = true);
    }

    /// 0: issuer already enabled; n: enabled on request, visible after n polls
    pub(crate) fn issuer_after_polls(&self, polls: u32) {
        self.with_state(|s| {
            s.issuer_enabled = polls == 0;
            s.issuer_pending_polls = polls;
        });
    }

    pub(crate) fn fail_next_role_assignment(&self, error: AzureError) {
        self.with_state(|s| s.role_failures.push_back(error));
    }

    pub(crate) fn role_assignment_count(&self) -> usize {
        self.with_state(|s| s.role_assignments.len())
    }

    pub(crate) fn identity_create_calls(&self) -> u32 {
        self.with_state(|s| s.identity_create_calls)
    }

    pub(crate) fn federated_credentials(&self, identity: &str) -> Vec<FederatedCredential> {
        self.with_state(|s| s.credentials.get(identity).cloned().unwrap_or_default())
    }

    pub(crate) fn set_vault_secrets(&self, names: &[&str]) {
        self.with_state(|s| {
            s.vault_secrets = names
                .iter()
                .map(|name| VaultSecretInfo {
                    name: (*name).to_string(),
                    enabled: Some(true),
                    content_type: None,
                    updated: None,
                })
                .collect();
        });
    }

    pub(crate) fn set_repositories(&self, repositories: Vec<RegistryRepository>) {
        self.with_state(|s| s.repositories = repositories);
    }

    /// Vault and registry listings fail from now on
    pub(crate) fn fail_listings(&self) {
        self.with_state(|s| s.fail_listings = true);
    }
}

fn state_for(descriptor: &ResourceDescriptor, sku: Option<&str>) -> ResourceState {
    let group = &descriptor.parent_group;
    let name = &descriptor.name;
    let (id, endpoint) = match descriptor.kind {
        ResourceKind::ResourceGroup => (format!("/subscriptions/0000/resourceGroups/{name}"), None),
        ResourceKind::Registry => (
            format!("/subscriptions/0000/resourceGroups/{group}/providers/Microsoft.ContainerRegistry/registries/{name}"),
            Some(format!("{name}.azurecr.io")),
        ),
        ResourceKind::Vault => (
            format!("/subscriptions/0000/resourceGroups/{group}/providers/Microsoft.KeyVault/vaults/{name}"),
            Some(format!("https://{name}.vault.azure.net/")),
        ),
        ResourceKind::Storage => (
            format!("/subscriptions/0000/resourceGroups/{group}/providers/Microsoft.Storage/storageAccounts/{name}"),
            None,
        ),
        ResourceKind::Cluster => (
            format!("/subscriptions/0000/resourceGroups/{group}/providers/Microsoft.ContainerService/managedClusters/{name}"),
            Some(format!("{name}-dns.hcp.{}.azmk8s.io", descriptor.region)),
        ),
    };
    ResourceState {
        raw: serde_json::json!({
            "id": id,
            "name": name,
            "location": descriptor.region,
        }),
        id,
        sku: sku.map(str::to_string),
        endpoint,
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn show(
        &self,
        descriptor: &ResourceDescriptor,
    ) -> Result<Option<ResourceState>, AzureError> {
        Ok(self.with_state(|s| {
            s.resources
                .get(&(descriptor.kind, descriptor.name.clone()))
                .cloned()
        }))
    }

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<ResourceState, AzureError> {
        self.with_state(|s| {
            s.create_calls += 1;
            if let Some(error) = s.create_failures.pop_front() {
                return Err(error);
            }
            if let Some(error) = s.failing_kinds.get(&descriptor.kind) {
                return Err(error.clone());
            }
            let resource = state_for(descriptor, descriptor.sku.as_deref());
            s.resources
                .insert((descriptor.kind, descriptor.name.clone()), resource.clone());
            if std::mem::take(&mut s.race_next_create) {
                return Err(AzureError::new(
                    "create",
                    Some("Conflict".to_string()),
                    "resource already exists",
                ));
            }
            Ok(resource)
        })
    }

    async fn upgrade_sku(
        &self,
        descriptor: &ResourceDescriptor,
        sku: &str,
    ) -> Result<ResourceState, AzureError> {
        self.with_state(|s| {
            let resource = s
                .resources
                .get_mut(&(descriptor.kind, descriptor.name.clone()))
                .ok_or_else(|| AzureError::new("update", Some("ResourceNotFound".to_string()), "missing"))?;
            resource.sku = Some(sku.to_string());
            Ok(resource.clone())
        })
    }

    async fn oidc_issuer(
        &self,
        _resource_group: &str,
        cluster: &str,
    ) -> Result<Option<String>, AzureError> {
        Ok(self.with_state(|s| {
            if !s.issuer_enabled {
                return None;
            }
            if s.issuer_pending_polls > 0 {
                s.issuer_pending_polls -= 1;
                return None;
            }
            Some(format!("https://eastus.oic.prod-aks.azure.com/tenant-0000/{cluster}/"))
        }))
    }

    async fn enable_oidc_issuer(
        &self,
        _resource_group: &str,
        _cluster: &str,
    ) -> Result<(), AzureError> {
        self.with_state(|s| s.issuer_enabled = true);
        Ok(())
    }

    async fn show_identity(
        &self,
        _resource_group: &str,
        name: &str,
    ) -> Result<Option<ManagedIdentity>, AzureError> {
        Ok(self.with_state(|s| {
            s.identities.get(name).cloned().map(|mut identity| {
                identity.federated_credentials = s
                    .credentials
                    .get(name)
                    .map(|c| c.iter().cloned().collect())
                    .unwrap_or_default();
                identity
            })
        }))
    }

    async fn create_identity(
        &self,
        resource_group: &str,
        name: &str,
        _location: &str,
    ) -> Result<ManagedIdentity, AzureError> {
        let identity = ManagedIdentity {
            name: name.to_string(),
            id: format!("/subscriptions/0000/resourceGroups/{resource_group}/providers/Microsoft.ManagedIdentity/userAssignedIdentities/{name}"),
            client_id: format!("client-{name}"),
            principal_id: format!("principal-{name}"),
            federated_credentials: BTreeSet::new(),
        };
        self.with_state(|s| {
            s.identity_create_calls += 1;
            s.identities.insert(name.to_string(), identity.clone());
        });
        Ok(identity)
    }

    async fn list_role_assignments(
        &self,
        principal_id: &str,
        scope: &str,
    ) -> Result<Vec<RoleBinding>, AzureError> {
        Ok(self.with_state(|s| {
            s.role_assignments
                .iter()
                .filter(|r| r.principal_id == principal_id && r.scope.eq_ignore_ascii_case(scope))
                .cloned()
                .collect()
        }))
    }

    async fn create_role_assignment(&self, binding: &RoleBinding) -> Result<(), AzureError> {
        self.with_state(|s| {
            if let Some(error) = s.role_failures.pop_front() {
                return Err(error);
            }
            s.role_assignments.push(binding.clone());
            Ok(())
        })
    }

    async fn list_federated_credentials(
        &self,
        _resource_group: &str,
        identity_name: &str,
    ) -> Result<Vec<FederatedCredential>, AzureError> {
        Ok(self.federated_credentials(identity_name))
    }

    async fn create_federated_credential(
        &self,
        _resource_group: &str,
        identity_name: &str,
        credential: &FederatedCredential,
    ) -> Result<(), AzureError> {
        self.with_state(|s| {
            let credentials = s.credentials.entry(identity_name.to_string()).or_default();
            if credentials.iter().any(|c| c.name == credential.name) {
                return Err(AzureError::new(
                    "federated credential create",
                    Some("Conflict".to_string()),
                    "already exists",
                ));
            }
            credentials.push(credential.clone());
            Ok(())
        })
    }

    async fn delete_federated_credential(
        &self,
        _resource_group: &str,
        identity_name: &str,
        name: &str,
    ) -> Result<(), AzureError> {
        self.with_state(|s| {
            if let Some(credentials) = s.credentials.get_mut(identity_name) {
                credentials.retain(|c| c.name != name);
            }
        });
        Ok(())
    }

    async fn tenant_id(&self) -> Result<String, AzureError> {
        Ok("tenant-0000".to_string())
    }

    async fn list_vault_secrets(
        &self,
        _vault_name: &str,
    ) -> Result<Vec<VaultSecretInfo>, AzureError> {
        self.with_state(|s| {
            if s.fail_listings {
                return Err(AzureError::new("keyvault secret list", None, "connection reset"));
            }
            Ok(s.vault_secrets.clone())
        })
    }

    async fn list_registry_repositories(
        &self,
        _registry_name: &str,
    ) -> Result<Vec<RegistryRepository>, AzureError> {
        self.with_state(|s| {
            if s.fail_listings {
                return Err(AzureError::new("acr repository list", None, "connection reset"));
            }
            Ok(s.repositories.clone())
        })
    }
}

/// Vault data plane fake
#[derive(Default)]
pub(crate) struct FakeVault {
    secrets: Mutex<HashMap<String, (String, Option<String>)>>,
    failing: Mutex<HashSet<String>>,
    /// Writes left to fail with a throttling error, per name
    throttled: Mutex<HashMap<String, u32>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl FakeVault {
    /// Every write of this secret name fails
    pub(crate) fn fail_secret(&self, name: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
    }

    /// The next `times` writes of this secret name are throttled
    pub(crate) fn throttle_secret(&self, name: &str, times: u32) {
        self.throttled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), times);
    }

    pub(crate) fn attempts(&self, name: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn get(&self, name: &str) -> Option<String> {
        self.secrets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|(value, _)| value.clone())
    }

    pub(crate) fn content_type(&self, name: &str) -> Option<String> {
        self.secrets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .and_then(|(_, content_type)| content_type.clone())
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .secrets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl VaultStore for FakeVault {
    async fn create_or_update_secret(
        &self,
        secret_name: &str,
        secret_value: &str,
        content_type: Option<&str>,
    ) -> anyhow::Result<bool> {
        *self
            .attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(secret_name.to_string())
            .or_default() += 1;
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(secret_name)
        {
            return Err(AzureError::new(
                "keyvault secret set",
                Some("Forbidden".to_string()),
                format!("write to {secret_name} denied"),
            )
            .into());
        }
        if let Some(left) = self
            .throttled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(secret_name)
            .filter(|left| **left > 0)
        {
            *left -= 1;
            return Err(AzureError::new(
                "keyvault secret set",
                Some("TooManyRequests".to_string()),
                "rate limit exceeded",
            )
            .into());
        }
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        let entry = (secret_value.to_string(), content_type.map(str::to_string));
        if secrets.get(secret_name) == Some(&entry) {
            return Ok(false);
        }
        secrets.insert(secret_name.to_string(), entry);
        Ok(true)
    }
}
