//! # Azure Key Vault Client
//!
//! Key Vault data plane used by the secret synchronizer.
//!
//! This module provides functionality to:
//! - Create and update secrets (a new version per changed value)
//! - Skip writes whose value already matches the latest version
//! - Authenticate with the `az login` session, a managed identity or a
//!   federated workload identity

use crate::config::AzureAuthMode;
use crate::provider::{AzureError, VaultStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use azure_core::credentials::TokenCredential;
use azure_identity::{AzureCliCredential, ManagedIdentityCredential, WorkloadIdentityCredential};
use azure_security_keyvault_secrets::{models::SetSecretParameters, SecretClient};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use zeroize::Zeroizing;

/// Azure Key Vault secret store
pub struct AzureKeyVault {
    client: SecretClient,
    vault_url: String,
}

impl std::fmt::Debug for AzureKeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureKeyVault")
            .field("vault_url", &self.vault_url)
            .finish_non_exhaustive()
    }
}

/// Vault URL from a vault name or an already-qualified URL
#[must_use]
pub fn vault_url(vault: &str) -> String {
    if vault.starts_with("https://") {
        vault.to_string()
    } else {
        format!("https://{vault}.vault.azure.net/")
    }
}

impl AzureKeyVault {
    /// Create a new Azure Key Vault client
    /// # Errors
    /// Returns an error if credential or client initialization fails
    pub fn new(vault: &str, auth: AzureAuthMode) -> Result<Self> {
        let vault_url = vault_url(vault);

        let credential: Arc<dyn TokenCredential> = match auth {
            AzureAuthMode::Cli => {
                debug!("Using Azure CLI credential for Key Vault");
                AzureCliCredential::new(None).context("Failed to create AzureCliCredential")?
            }
            AzureAuthMode::ManagedIdentity => {
                info!("Using Managed Identity authentication for Key Vault");
                ManagedIdentityCredential::new(None)
                    .context("Failed to create ManagedIdentityCredential")?
            }
            AzureAuthMode::WorkloadIdentity => {
                let client_id = std::env::var("AZURE_CLIENT_ID").ok();
                info!(
                    "Using Azure Workload Identity authentication with client ID: {}",
                    client_id.as_deref().unwrap_or("<from token file>")
                );
                let options = azure_identity::WorkloadIdentityCredentialOptions {
                    client_id,
                    ..Default::default()
                };
                WorkloadIdentityCredential::new(Some(options))
                    .context("Failed to create WorkloadIdentityCredential")?
            }
        };

        let client = SecretClient::new(&vault_url, credential, None)
            .context("Failed to create Azure Key Vault SecretClient")?;

        Ok(Self { client, vault_url })
    }

    async fn get_secret_value(&self, secret_name: &str) -> Result<Option<Zeroizing<String>>> {
        match self.client.get_secret(secret_name, None).await {
            Ok(response) => {
                use azure_security_keyvault_secrets::models::Secret;
                let secret = serde_json::from_slice::<Secret>(&response.into_body())
                    .context("Failed to deserialize Azure secret response")?;
                Ok(secret.value.map(Zeroizing::new))
            }
            Err(e) => {
                let error_msg = e.to_string();
                if error_msg.contains("SecretNotFound")
                    || error_msg.contains("404")
                    || error_msg.contains("not found")
                {
                    Ok(None)
                } else {
                    Err(AzureError::new(
                        "keyvault secret get",
                        None,
                        format!("Failed to get Azure secret {secret_name}: {error_msg}"),
                    )
                    .into())
                }
            }
        }
    }
}

#[async_trait]
impl VaultStore for AzureKeyVault {
    async fn create_or_update_secret(
        &self,
        secret_name: &str,
        secret_value: &str,
        content_type: Option<&str>,
    ) -> Result<bool> {
        let span = info_span!(
            "azure.keyvault.secret.create_or_update",
            secret.name = secret_name,
            vault.url = %self.vault_url
        );
        let start = Instant::now();

        async move {
            if let Some(current) = self.get_secret_value(secret_name).await? {
                if current.as_str() == secret_value {
                    debug!("Azure secret {} unchanged, skipping update", secret_name);
                    return Ok(false);
                }
            }

            let parameters = SetSecretParameters {
                value: Some(secret_value.to_string()),
                content_type: content_type.map(str::to_string),
                ..Default::default()
            };
            self.client
                .set_secret(secret_name, parameters.try_into()?, None)
                .await
                .map_err(|e| {
                    AzureError::new(
                        "keyvault secret set",
                        None,
                        format!("Failed to set Azure secret {secret_name}: {e}"),
                    )
                })?;

            debug!(
                duration_ms = start.elapsed().as_millis() as u64,
                "Wrote Azure secret {}", secret_name
            );
            Ok(true)
        }
        .instrument(span)
        .await
    }
}
