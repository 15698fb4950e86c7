//! # Resolved Configuration Record
//!
//! Identifiers resolved while provisioning (registry login server, OIDC issuer
//! URL, managed identity client id, ...) are collected in a [`ResolvedConfig`]
//! that is passed explicitly through the provisioning chain.
//!
//! The record is append-only: [`ResolvedConfig::with`] adds or refreshes a
//! field but an empty value never replaces a resolved one, and
//! [`ResolvedConfig::save`] merges with what is already on disk so a later run
//! that only re-runs one step never drops fields resolved by an earlier run.
//!
//! Persisted as a dotenv file so it can be `source`d by operators.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Well-known record keys
pub mod keys {
    pub const SUBSCRIPTION_ID: &str = "AZURE_SUBSCRIPTION_ID";
    pub const TENANT_ID: &str = "AZURE_TENANT_ID";
    pub const RESOURCE_GROUP: &str = "AZURE_RESOURCE_GROUP";
    pub const LOCATION: &str = "AZURE_LOCATION";
    pub const ACR_NAME: &str = "ACR_NAME";
    pub const ACR_LOGIN_SERVER: &str = "ACR_LOGIN_SERVER";
    pub const AKS_CLUSTER_NAME: &str = "AKS_CLUSTER_NAME";
    pub const KEY_VAULT_NAME: &str = "KEY_VAULT_NAME";
    pub const KEY_VAULT_ID: &str = "KEY_VAULT_ID";
    pub const KEY_VAULT_URI: &str = "KEY_VAULT_URI";
    pub const STORAGE_ACCOUNT: &str = "STORAGE_ACCOUNT_NAME";
    pub const OIDC_ISSUER_URL: &str = "OIDC_ISSUER_URL";
    pub const IDENTITY_NAME: &str = "AZURE_IDENTITY_NAME";
    pub const CLIENT_ID: &str = "AZURE_CLIENT_ID";
    pub const PRINCIPAL_ID: &str = "AZURE_PRINCIPAL_ID";
    pub const SERVICE_ACCOUNT_SUBJECT: &str = "SERVICE_ACCOUNT_SUBJECT";
}

/// Append-only record of resolved identifiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedConfig {
    values: BTreeMap<String, String>,
}

impl ResolvedConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Return a copy with `key` set; empty values leave the record unchanged
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        let value = value.trim();
        if !value.is_empty() {
            self.values.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Return a copy with every field of `newer` layered on top
    #[must_use]
    pub fn merge(self, newer: &ResolvedConfig) -> Self {
        newer
            .iter()
            .fold(self, |record, (key, value)| record.with(key, value))
    }

    /// Load the record from a dotenv file; a missing file is an empty record
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No resolved config at {}, starting empty", path.display());
            return Ok(Self::default());
        }

        let mut record = Self::default();
        let entries = dotenvy::from_path_iter(path)
            .with_context(|| format!("Failed to open resolved config: {}", path.display()))?;
        for entry in entries {
            let (key, value) = entry
                .with_context(|| format!("Failed to parse resolved config: {}", path.display()))?;
            record = record.with(&key, value);
        }
        Ok(record)
    }

    /// Persist the record, merged over whatever is already on disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let merged = Self::load(path)?.merge(self);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut content = String::from("# Resolved by vocarectl - safe to source, contains no secret values\n");
        for (key, value) in merged.iter() {
            content.push_str(&format!("{key}=\"{}\"\n", escape_value(value)));
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write resolved config: {}", path.display()))?;
        debug!("Saved {} resolved fields to {}", merged.len(), path.display());
        Ok(())
    }
}

fn escape_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
