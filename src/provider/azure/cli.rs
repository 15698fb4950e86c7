//! # Azure CLI Control Plane
//!
//! [`CloudApi`] implementation that drives the `az` CLI with `--output json`.
//!
//! Reuses the operator's `az login` session so no service principal secret is
//! ever handled by the deployer. Failures are classified from the CLI's
//! `ERROR: (Code) message` output.

use crate::identity::{FederatedCredential, ManagedIdentity, RoleBinding, ServiceAccountSubject};
use crate::provider::{
    AzureError, AzureFailureReason, CloudApi, RegistryRepository, ResourceState, VaultSecretInfo,
};
use crate::reconciler::{ResourceDescriptor, ResourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// `az` CLI driver
#[derive(Debug, Clone)]
pub struct AzCli {
    binary: PathBuf,
    subscription: Option<String>,
}

impl AzCli {
    /// Locate `az` on PATH
    pub fn discover(subscription: Option<String>) -> anyhow::Result<Self> {
        let binary = which::which("az")
            .map_err(|e| anyhow::anyhow!("Azure CLI (az) not found on PATH: {e}"))?;
        Ok(Self {
            binary,
            subscription,
        })
    }

    /// Run an `az` command and parse its JSON output (`Null` when empty)
    async fn run(&self, operation: &str, args: &[&str]) -> Result<Value, AzureError> {
        let mut command = Command::new(&self.binary);
        command.args(args).args(["--output", "json", "--only-show-errors"]);
        if let Some(subscription) = &self.subscription {
            command.args(["--subscription", subscription]);
        }
        debug!("az {}", args.join(" "));

        let output = command.output().await.map_err(|e| {
            AzureError::new(operation, None, format!("failed to execute az: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AzureError::from_stderr(operation, &stderr));
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout).map_err(|e| {
            AzureError::new(operation, None, format!("unparseable az output: {e}"))
        })
    }

    /// Like `run`, but a not-found failure is `Ok(None)`
    async fn run_optional(&self, operation: &str, args: &[&str]) -> Result<Option<Value>, AzureError> {
        match self.run(operation, args).await {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(e) if e.reason == AzureFailureReason::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run_typed<T: for<'de> Deserialize<'de>>(
        &self,
        operation: &str,
        args: &[&str],
    ) -> Result<T, AzureError> {
        let value = self.run(operation, args).await?;
        serde_json::from_value(value).map_err(|e| {
            AzureError::new(operation, None, format!("unexpected az output shape: {e}"))
        })
    }
}

fn show_args(descriptor: &ResourceDescriptor) -> Vec<&str> {
    let name = descriptor.name.as_str();
    let group = descriptor.parent_group.as_str();
    match descriptor.kind {
        ResourceKind::ResourceGroup => vec!["group", "show", "--name", name],
        ResourceKind::Registry => vec!["acr", "show", "--name", name, "--resource-group", group],
        ResourceKind::Vault => vec!["keyvault", "show", "--name", name, "--resource-group", group],
        ResourceKind::Storage => vec![
            "storage", "account", "show", "--name", name, "--resource-group", group,
        ],
        ResourceKind::Cluster => vec!["aks", "show", "--name", name, "--resource-group", group],
    }
}

/// Arguments for `az <kind> create`
fn create_args(descriptor: &ResourceDescriptor) -> Vec<String> {
    let name = descriptor.name.as_str();
    let group = descriptor.parent_group.as_str();
    let region = descriptor.region.as_str();

    let args: Vec<&str> = match descriptor.kind {
        ResourceKind::ResourceGroup => {
            vec!["group", "create", "--name", name, "--location", region]
        }
        ResourceKind::Registry => vec![
            "acr",
            "create",
            "--name",
            name,
            "--resource-group",
            group,
            "--location",
            region,
            "--sku",
            descriptor.sku.as_deref().unwrap_or("Standard"),
        ],
        ResourceKind::Vault => vec![
            "keyvault",
            "create",
            "--name",
            name,
            "--resource-group",
            group,
            "--location",
            region,
            "--enable-rbac-authorization",
            "true",
        ],
        ResourceKind::Storage => vec![
            "storage",
            "account",
            "create",
            "--name",
            name,
            "--resource-group",
            group,
            "--location",
            region,
            "--sku",
            "Standard_LRS",
            "--kind",
            "StorageV2",
            "--min-tls-version",
            "TLS1_2",
        ],
        ResourceKind::Cluster => {
            let settings = descriptor.cluster.as_ref();
            let node_count = settings
                .map(|s| s.node_count)
                .unwrap_or(crate::constants::DEFAULT_NODE_COUNT)
                .to_string();
            let mut args: Vec<String> = [
                "aks",
                "create",
                "--name",
                name,
                "--resource-group",
                group,
                "--location",
                region,
                "--node-count",
                node_count.as_str(),
                "--enable-managed-identity",
                "--enable-oidc-issuer",
                "--enable-workload-identity",
                "--enable-addons",
                "azure-keyvault-secrets-provider",
                "--generate-ssh-keys",
            ]
            .into_iter()
            .map(str::to_string)
            .collect();
            if let Some(size) = settings.map(|s| s.node_vm_size.as_str()) {
                args.extend(["--node-vm-size".to_string(), size.to_string()]);
            }
            if let Some(registry) = settings.and_then(|s| s.attach_registry.as_deref()) {
                args.extend(["--attach-acr".to_string(), registry.to_string()]);
            }
            return args;
        }
    };
    args.into_iter().map(str::to_string).collect()
}

/// Arguments for `az role assignment create`; the principal type skips a Graph lookup
fn role_assignment_args(binding: &RoleBinding) -> Vec<&str> {
    vec![
        "role",
        "assignment",
        "create",
        "--assignee-object-id",
        &binding.principal_id,
        "--assignee-principal-type",
        "ServicePrincipal",
        "--role",
        &binding.role_name,
        "--scope",
        &binding.scope,
    ]
}

/// Extract id, tier and endpoint from `az <kind> show` output
fn resource_state(kind: ResourceKind, raw: Value) -> ResourceState {
    let text = |pointer: &str| raw.pointer(pointer).and_then(Value::as_str).map(str::to_string);
    let (sku, endpoint) = match kind {
        ResourceKind::ResourceGroup => (None, None),
        ResourceKind::Registry => (text("/sku/name"), text("/loginServer")),
        ResourceKind::Vault => (text("/properties/sku/name"), text("/properties/vaultUri")),
        ResourceKind::Storage => (text("/sku/name"), text("/primaryEndpoints/blob")),
        ResourceKind::Cluster => (text("/sku/tier"), text("/fqdn")),
    };
    ResourceState {
        id: text("/id").unwrap_or_default(),
        sku,
        endpoint,
        raw,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityOutput {
    name: String,
    id: String,
    client_id: String,
    principal_id: String,
}

impl From<IdentityOutput> for ManagedIdentity {
    fn from(output: IdentityOutput) -> Self {
        Self {
            name: output.name,
            id: output.id,
            client_id: output.client_id,
            principal_id: output.principal_id,
            federated_credentials: BTreeSet::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleAssignmentOutput {
    principal_id: String,
    role_definition_name: String,
    scope: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FederatedCredentialOutput {
    name: String,
    issuer: String,
    subject: String,
    #[serde(default)]
    audiences: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretListOutput {
    name: Option<String>,
    id: Option<String>,
    content_type: Option<String>,
    #[serde(default)]
    attributes: Option<SecretAttributesOutput>,
}

#[derive(Deserialize)]
struct SecretAttributesOutput {
    enabled: Option<bool>,
    updated: Option<String>,
}

#[async_trait]
impl CloudApi for AzCli {
    async fn show(
        &self,
        descriptor: &ResourceDescriptor,
    ) -> Result<Option<ResourceState>, AzureError> {
        let operation = format!("{} show", descriptor.kind);
        Ok(self
            .run_optional(&operation, &show_args(descriptor))
            .await?
            .map(|raw| resource_state(descriptor.kind, raw)))
    }

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<ResourceState, AzureError> {
        let args = create_args(descriptor);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let operation = format!("{} create", descriptor.kind);
        self.run(&operation, &args).await?;
        // Create output shapes differ per kind; re-read for a uniform state
        self.show(descriptor).await?.ok_or_else(|| {
            AzureError::new(
                operation,
                Some("ResourceNotFound".to_string()),
                format!("{} not visible after create", descriptor.name),
            )
        })
    }

    async fn upgrade_sku(
        &self,
        descriptor: &ResourceDescriptor,
        sku: &str,
    ) -> Result<ResourceState, AzureError> {
        let name = descriptor.name.as_str();
        let group = descriptor.parent_group.as_str();
        let args: Vec<&str> = match descriptor.kind {
            ResourceKind::Registry => {
                vec!["acr", "update", "--name", name, "--resource-group", group, "--sku", sku]
            }
            ResourceKind::Vault => vec![
                "keyvault", "update", "--name", name, "--resource-group", group, "--sku", sku,
            ],
            kind => {
                return Err(AzureError::new(
                    format!("{kind} update"),
                    None,
                    format!("tier changes are not supported for {kind}"),
                ))
            }
        };
        let raw = self.run(&format!("{} update", descriptor.kind), &args).await?;
        Ok(resource_state(descriptor.kind, raw))
    }

    async fn oidc_issuer(
        &self,
        resource_group: &str,
        cluster: &str,
    ) -> Result<Option<String>, AzureError> {
        let value = self
            .run(
                "aks oidc issuer show",
                &[
                    "aks",
                    "show",
                    "--name",
                    cluster,
                    "--resource-group",
                    resource_group,
                    "--query",
                    "oidcIssuerProfile.issuerUrl",
                ],
            )
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn enable_oidc_issuer(
        &self,
        resource_group: &str,
        cluster: &str,
    ) -> Result<(), AzureError> {
        self.run(
            "aks oidc issuer enable",
            &[
                "aks",
                "update",
                "--name",
                cluster,
                "--resource-group",
                resource_group,
                "--enable-oidc-issuer",
                "--enable-workload-identity",
            ],
        )
        .await?;
        Ok(())
    }

    async fn show_identity(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<Option<ManagedIdentity>, AzureError> {
        let Some(raw) = self
            .run_optional(
                "identity show",
                &["identity", "show", "--name", name, "--resource-group", resource_group],
            )
            .await?
        else {
            return Ok(None);
        };
        let output: IdentityOutput = serde_json::from_value(raw).map_err(|e| {
            AzureError::new("identity show", None, format!("unexpected az output shape: {e}"))
        })?;
        let mut identity = ManagedIdentity::from(output);
        identity.federated_credentials = self
            .list_federated_credentials(resource_group, name)
            .await?
            .into_iter()
            .collect();
        Ok(Some(identity))
    }

    async fn create_identity(
        &self,
        resource_group: &str,
        name: &str,
        location: &str,
    ) -> Result<ManagedIdentity, AzureError> {
        let output: IdentityOutput = self
            .run_typed(
                "identity create",
                &[
                    "identity",
                    "create",
                    "--name",
                    name,
                    "--resource-group",
                    resource_group,
                    "--location",
                    location,
                ],
            )
            .await?;
        Ok(output.into())
    }

    async fn list_role_assignments(
        &self,
        principal_id: &str,
        scope: &str,
    ) -> Result<Vec<RoleBinding>, AzureError> {
        let assignments: Vec<RoleAssignmentOutput> = self
            .run_typed(
                "role assignment list",
                &["role", "assignment", "list", "--assignee", principal_id, "--scope", scope],
            )
            .await?;
        Ok(assignments
            .into_iter()
            .map(|a| RoleBinding {
                principal_id: a.principal_id,
                role_name: a.role_definition_name,
                scope: a.scope,
            })
            .collect())
    }

    async fn create_role_assignment(&self, binding: &RoleBinding) -> Result<(), AzureError> {
        self.run("role assignment create", &role_assignment_args(binding))
            .await?;
        Ok(())
    }

    async fn list_federated_credentials(
        &self,
        resource_group: &str,
        identity_name: &str,
    ) -> Result<Vec<FederatedCredential>, AzureError> {
        let credentials: Vec<FederatedCredentialOutput> = self
            .run_typed(
                "federated credential list",
                &[
                    "identity",
                    "federated-credential",
                    "list",
                    "--identity-name",
                    identity_name,
                    "--resource-group",
                    resource_group,
                ],
            )
            .await?;

        Ok(credentials
            .into_iter()
            .filter_map(|c| {
                // Credentials for non-Kubernetes subjects are not ours to manage
                let subject = ServiceAccountSubject::parse(&c.subject)?;
                let mut credential = FederatedCredential::new(&c.name, &c.issuer, subject);
                if let Some(audience) = c.audiences.into_iter().next() {
                    credential.audience = audience;
                }
                Some(credential)
            })
            .collect())
    }

    async fn create_federated_credential(
        &self,
        resource_group: &str,
        identity_name: &str,
        credential: &FederatedCredential,
    ) -> Result<(), AzureError> {
        let subject = credential.subject.to_string();
        self.run(
            "federated credential create",
            &[
                "identity",
                "federated-credential",
                "create",
                "--name",
                &credential.name,
                "--identity-name",
                identity_name,
                "--resource-group",
                resource_group,
                "--issuer",
                &credential.issuer_url,
                "--subject",
                &subject,
                "--audiences",
                &credential.audience,
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_federated_credential(
        &self,
        resource_group: &str,
        identity_name: &str,
        name: &str,
    ) -> Result<(), AzureError> {
        match self
            .run(
                "federated credential delete",
                &[
                    "identity",
                    "federated-credential",
                    "delete",
                    "--name",
                    name,
                    "--identity-name",
                    identity_name,
                    "--resource-group",
                    resource_group,
                    "--yes",
                ],
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.reason == AzureFailureReason::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn tenant_id(&self) -> Result<String, AzureError> {
        let value = self
            .run("account show", &["account", "show", "--query", "tenantId"])
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AzureError::new("account show", None, "no tenantId in az account output"))
    }

    async fn list_vault_secrets(
        &self,
        vault_name: &str,
    ) -> Result<Vec<VaultSecretInfo>, AzureError> {
        let secrets: Vec<SecretListOutput> = self
            .run_typed(
                "keyvault secret list",
                &["keyvault", "secret", "list", "--vault-name", vault_name],
            )
            .await?;
        Ok(secrets
            .into_iter()
            .filter_map(|s| {
                let name = s.name.or_else(|| {
                    s.id.as_deref()
                        .and_then(|id| id.trim_end_matches('/').rsplit('/').next())
                        .map(str::to_string)
                })?;
                let attributes = s.attributes;
                Some(VaultSecretInfo {
                    name,
                    enabled: attributes.as_ref().and_then(|a| a.enabled),
                    content_type: s.content_type,
                    updated: attributes.and_then(|a| a.updated),
                })
            })
            .collect())
    }

    async fn list_registry_repositories(
        &self,
        registry_name: &str,
    ) -> Result<Vec<RegistryRepository>, AzureError> {
        let names: Vec<String> = self
            .run_typed(
                "acr repository list",
                &["acr", "repository", "list", "--name", registry_name],
            )
            .await?;

        let mut repositories = Vec::with_capacity(names.len());
        for name in names {
            let tags: Vec<String> = self
                .run_typed(
                    "acr repository show-tags",
                    &[
                        "acr",
                        "repository",
                        "show-tags",
                        "--name",
                        registry_name,
                        "--repository",
                        &name,
                    ],
                )
                .await?;
            repositories.push(RegistryRepository { name, tags });
        }
        Ok(repositories)
    }
}
