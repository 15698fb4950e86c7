//! Resource descriptors and per-kind naming rules.

use crate::config::DeployerConfig;
use crate::error::{Component, DeployerError, Result};
use serde::Serialize;
use std::fmt;

/// Kinds of Azure resources the deployer owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    ResourceGroup,
    Registry,
    Cluster,
    Vault,
    Storage,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ResourceGroup => "resource group",
            ResourceKind::Registry => "container registry",
            ResourceKind::Cluster => "AKS cluster",
            ResourceKind::Vault => "key vault",
            ResourceKind::Storage => "storage account",
        }
    }

    /// Provisioning order: the group first, the cluster last (it attaches to the registry)
    #[must_use]
    pub fn order(&self) -> u8 {
        match self {
            ResourceKind::ResourceGroup => 0,
            ResourceKind::Registry => 1,
            ResourceKind::Vault => 2,
            ResourceKind::Storage => 3,
            ResourceKind::Cluster => 4,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creation settings for the AKS cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    pub node_count: u32,
    pub node_vm_size: String,
    /// Registry granted pull access (`--attach-acr`)
    pub attach_registry: Option<String>,
}

/// Desired state of one Azure resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    pub name: String,
    pub region: String,
    /// Owning resource group (the group's own name for `ResourceGroup`)
    pub parent_group: String,
    /// Minimum tier; an existing resource below it is upgraded in place
    pub sku: Option<String>,
    pub cluster: Option<ClusterSettings>,
}

impl ResourceDescriptor {
    pub fn resource_group(name: &str, region: &str) -> Self {
        Self::new(ResourceKind::ResourceGroup, name, region, name)
    }

    pub fn registry(name: &str, region: &str, group: &str, sku: &str) -> Self {
        Self {
            sku: Some(sku.to_string()),
            ..Self::new(ResourceKind::Registry, name, region, group)
        }
    }

    pub fn vault(name: &str, region: &str, group: &str) -> Self {
        Self::new(ResourceKind::Vault, name, region, group)
    }

    pub fn storage(name: &str, region: &str, group: &str) -> Self {
        Self::new(ResourceKind::Storage, name, region, group)
    }

    pub fn cluster(name: &str, region: &str, group: &str, settings: ClusterSettings) -> Self {
        Self {
            cluster: Some(settings),
            ..Self::new(ResourceKind::Cluster, name, region, group)
        }
    }

    fn new(kind: ResourceKind, name: &str, region: &str, group: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            region: region.to_string(),
            parent_group: group.to_string(),
            sku: None,
            cluster: None,
        }
    }

    /// Check the name against the kind's namespace rules
    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        let len = name.chars().count();
        let fail = |rule: &str| {
            Err(DeployerError::validation(
                Component::ResourceReconciler,
                format!("invalid {} name '{}': {}", self.kind, name, rule),
            ))
        };

        match self.kind {
            ResourceKind::ResourceGroup => {
                if !(1..=90).contains(&len) {
                    return fail("must be 1-90 characters");
                }
                if !name
                    .chars()
                    .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '(' | ')'))
                {
                    return fail("only alphanumerics, '-', '_', '.', '(' and ')' are allowed");
                }
                if name.ends_with('.') {
                    return fail("must not end with a period");
                }
            }
            ResourceKind::Registry => {
                if !(5..=50).contains(&len) {
                    return fail("must be 5-50 characters");
                }
                if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return fail("only alphanumerics are allowed");
                }
            }
            ResourceKind::Storage => {
                if !(3..=24).contains(&len) {
                    return fail("must be 3-24 characters");
                }
                if !name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                {
                    return fail("only lowercase letters and digits are allowed");
                }
            }
            ResourceKind::Vault => {
                if !(3..=24).contains(&len) {
                    return fail("must be 3-24 characters");
                }
                if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                    return fail("only alphanumerics and '-' are allowed");
                }
                if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
                    return fail("must start with a letter");
                }
                if name.ends_with('-') || name.contains("--") {
                    return fail("must not end with '-' or contain consecutive '-'");
                }
            }
            ResourceKind::Cluster => {
                if !(1..=63).contains(&len) {
                    return fail("must be 1-63 characters");
                }
                if !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
                {
                    return fail("only alphanumerics, '-' and '_' are allowed");
                }
                if !name.starts_with(|c: char| c.is_ascii_alphanumeric())
                    || !name.ends_with(|c: char| c.is_ascii_alphanumeric())
                {
                    return fail("must start and end with an alphanumeric");
                }
            }
        }
        Ok(())
    }
}

/// Every resource the voice stack needs, from run configuration
pub fn desired_resources(config: &DeployerConfig) -> Vec<ResourceDescriptor> {
    let group = config.resource_group.as_str();
    let region = config.location.as_str();
    vec![
        ResourceDescriptor::resource_group(group, region),
        ResourceDescriptor::registry(&config.registry_name, region, group, &config.registry_sku),
        ResourceDescriptor::vault(&config.vault_name, region, group),
        ResourceDescriptor::storage(&config.storage_account, region, group),
        ResourceDescriptor::cluster(
            &config.cluster_name,
            region,
            group,
            ClusterSettings {
                node_count: config.node_count,
                node_vm_size: config.node_vm_size.clone(),
                attach_registry: Some(config.registry_name.clone()),
            },
        ),
    ]
}
