//! # Resource Reconciler
//!
//! Converges Azure resources toward their descriptors regardless of what a
//! previous (possibly partial) run left behind.
//!
//! For each [`ResourceDescriptor`]:
//!
//! 1. **Lookup** - existence check through [`CloudApi::show`]
//! 2. **Create** - when absent; a create that races another writer is
//!    confirmed by a second lookup and reported as [`EnsureOutcome::AlreadyPresent`]
//! 3. **Conform** - when present, upgrade in place if below the desired tier
//!
//! Transient platform failures are retried with the bounded retry combinator.
//! Everything else aborts the provisioning path with the platform's
//! classification and message.

mod descriptor;

pub use descriptor::{desired_resources, ClusterSettings, ResourceDescriptor, ResourceKind};

use crate::config::resolved::{keys, ResolvedConfig};
use crate::error::{Component, Condition, DeployerError, Result, Warning};
use crate::provider::{AzureError, AzureFailureReason, CloudApi, ResourceState};
use crate::retry::{retry, RetryPolicy};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};

/// What `ensure` did to converge a resource
#[derive(Debug, Clone, PartialEq)]
pub enum EnsureOutcome {
    Created(ResourceState),
    AlreadyPresent(ResourceState),
    Upgraded(ResourceState),
}

impl EnsureOutcome {
    #[must_use]
    pub fn state(&self) -> &ResourceState {
        match self {
            EnsureOutcome::Created(state)
            | EnsureOutcome::AlreadyPresent(state)
            | EnsureOutcome::Upgraded(state) => state,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EnsureOutcome::Created(_) => "created",
            EnsureOutcome::AlreadyPresent(_) => "already-present",
            EnsureOutcome::Upgraded(_) => "upgraded",
        }
    }
}

/// One line of a provisioning report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedResource {
    pub kind: ResourceKind,
    pub name: String,
    pub outcome: &'static str,
}

/// Outcome of a full provisioning chain
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    pub resources: Vec<ProvisionedResource>,
    pub warnings: Vec<Warning>,
}

impl ProvisionReport {
    #[must_use]
    pub fn created(&self) -> usize {
        self.resources.iter().filter(|r| r.outcome == "created").count()
    }
}

/// Everything `ensure_all` converged, including what it had done before a failure
#[derive(Debug)]
pub struct ProvisionRun {
    pub report: ProvisionReport,
    /// Endpoints recorded for every resource converged so far
    pub resolved: ResolvedConfig,
    /// The failure that stopped the chain
    pub error: Option<DeployerError>,
}

impl ProvisionRun {
    pub fn into_result(self) -> Result<(ProvisionReport, ResolvedConfig)> {
        match self.error {
            Some(error) => Err(error),
            None => Ok((self.report, self.resolved)),
        }
    }
}

/// Idempotent resource reconciler
pub struct Reconciler {
    cloud: Arc<dyn CloudApi>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, policy: RetryPolicy) -> Self {
        Self { cloud, policy }
    }

    /// Converge a single resource
    pub async fn ensure(&self, descriptor: &ResourceDescriptor) -> Result<EnsureOutcome> {
        let (outcome, _conflict) = self.converge(descriptor).await?;
        Ok(outcome)
    }

    async fn converge(
        &self,
        descriptor: &ResourceDescriptor,
    ) -> Result<(EnsureOutcome, Option<Warning>)> {
        descriptor.validate()?;

        let span = info_span!(
            "azure.resource.ensure",
            resource.kind = descriptor.kind.as_str(),
            resource.name = %descriptor.name
        );

        self.lookup_then_converge(descriptor).instrument(span).await
    }

    async fn lookup_then_converge(
        &self,
        descriptor: &ResourceDescriptor,
    ) -> Result<(EnsureOutcome, Option<Warning>)> {
        match self.lookup(descriptor).await? {
            Some(state) => Ok((self.conform(descriptor, state).await?, None)),
            None => self.create(descriptor).await,
        }
    }

    /// Converge every descriptor in dependency order, recording resolved endpoints
    ///
    /// Stops at the first fatal failure; later resources are never attempted.
    /// The returned run keeps the report and resolved endpoints gathered up to
    /// that point so the caller can persist them.
    pub async fn ensure_all(
        &self,
        descriptors: &[ResourceDescriptor],
        resolved: ResolvedConfig,
    ) -> ProvisionRun {
        let mut ordered: Vec<&ResourceDescriptor> = descriptors.iter().collect();
        ordered.sort_by_key(|d| d.kind.order());

        let mut report = ProvisionReport::default();
        let mut resolved = resolved;

        for descriptor in ordered {
            let (outcome, conflict) = match self.converge(descriptor).await {
                Ok(converged) => converged,
                Err(error) => {
                    warn!(
                        converged = report.resources.len(),
                        "Provisioning stopped at {} {}", descriptor.kind, descriptor.name
                    );
                    return ProvisionRun {
                        report,
                        resolved,
                        error: Some(error),
                    };
                }
            };
            report.warnings.extend(conflict);
            info!(
                "{} {}: {}",
                descriptor.kind,
                descriptor.name,
                outcome.as_str()
            );
            resolved = record_resolved(resolved, descriptor, outcome.state());
            report.resources.push(ProvisionedResource {
                kind: descriptor.kind,
                name: descriptor.name.clone(),
                outcome: outcome.as_str(),
            });
        }

        ProvisionRun {
            report,
            resolved,
            error: None,
        }
    }

    async fn lookup(&self, descriptor: &ResourceDescriptor) -> Result<Option<ResourceState>> {
        let cloud = &self.cloud;
        retry(&self.policy, "lookup", AzureError::is_transient, move || {
            cloud.show(descriptor)
        })
        .await
        .map_err(|e| provisioning_failure(descriptor, &e))
    }

    async fn create(
        &self,
        descriptor: &ResourceDescriptor,
    ) -> Result<(EnsureOutcome, Option<Warning>)> {
        info!("Creating {} {}", descriptor.kind, descriptor.name);
        let cloud = &self.cloud;
        let created = retry(&self.policy, "create", AzureError::is_transient, move || {
            cloud.create(descriptor)
        })
        .await;

        match created {
            Ok(state) => Ok((EnsureOutcome::Created(state), None)),
            Err(e)
                if matches!(
                    e.reason,
                    AzureFailureReason::Conflict | AzureFailureReason::NameCollision
                ) =>
            {
                // Either a concurrent create won the race or the name belongs to
                // someone else; only a confirming lookup tells them apart.
                warn!(
                    "Create of {} {} reported {}, re-probing",
                    descriptor.kind, descriptor.name, e.reason
                );
                match self.lookup(descriptor).await? {
                    Some(state) => {
                        let warning = Warning::new(
                            Condition::ProvisioningConflict,
                            Component::ResourceReconciler,
                            format!("{} {} already existed: {}", descriptor.kind, descriptor.name, e.message),
                        );
                        warn!("{}", warning);
                        let outcome = self.conform(descriptor, state).await?;
                        Ok((outcome, Some(warning)))
                    }
                    None => Err(provisioning_failure(descriptor, &e)),
                }
            }
            Err(e) => Err(provisioning_failure(descriptor, &e)),
        }
    }

    async fn conform(
        &self,
        descriptor: &ResourceDescriptor,
        state: ResourceState,
    ) -> Result<EnsureOutcome> {
        let Some(desired) = descriptor.sku.as_deref() else {
            return Ok(EnsureOutcome::AlreadyPresent(state));
        };
        if !needs_upgrade(state.sku.as_deref(), desired) {
            return Ok(EnsureOutcome::AlreadyPresent(state));
        }

        info!(
            "Upgrading {} {} from {} to {}",
            descriptor.kind,
            descriptor.name,
            state.sku.as_deref().unwrap_or("unknown"),
            desired
        );
        let cloud = &self.cloud;
        let upgraded = retry(&self.policy, "upgrade", AzureError::is_transient, move || {
            cloud.upgrade_sku(descriptor, desired)
        })
        .await
        .map_err(|e| provisioning_failure(descriptor, &e))?;
        Ok(EnsureOutcome::Upgraded(upgraded))
    }
}

/// Tier order shared by registry and vault SKUs
fn sku_rank(sku: &str) -> u8 {
    match sku.to_lowercase().as_str() {
        "basic" => 1,
        "standard" => 2,
        "premium" => 3,
        _ => 0,
    }
}

/// Conformance predicate: current tier is below the desired one
fn needs_upgrade(current: Option<&str>, desired: &str) -> bool {
    current.is_none_or(|current| sku_rank(current) < sku_rank(desired))
}

fn record_resolved(
    resolved: ResolvedConfig,
    descriptor: &ResourceDescriptor,
    state: &ResourceState,
) -> ResolvedConfig {
    let endpoint = state.endpoint.clone().unwrap_or_default();
    match descriptor.kind {
        ResourceKind::ResourceGroup => resolved
            .with(keys::RESOURCE_GROUP, descriptor.name.as_str())
            .with(keys::LOCATION, descriptor.region.as_str()),
        ResourceKind::Registry => resolved
            .with(keys::ACR_NAME, descriptor.name.as_str())
            .with(keys::ACR_LOGIN_SERVER, endpoint),
        ResourceKind::Vault => resolved
            .with(keys::KEY_VAULT_NAME, descriptor.name.as_str())
            .with(keys::KEY_VAULT_ID, state.id.as_str())
            .with(keys::KEY_VAULT_URI, endpoint),
        ResourceKind::Storage => resolved.with(keys::STORAGE_ACCOUNT, descriptor.name.as_str()),
        ResourceKind::Cluster => resolved.with(keys::AKS_CLUSTER_NAME, descriptor.name.as_str()),
    }
}

fn provisioning_failure(descriptor: &ResourceDescriptor, error: &AzureError) -> DeployerError {
    DeployerError::new(
        Condition::ProvisioningFailure,
        Component::ResourceReconciler,
        format!(
            "{} {}: {}. {}",
            descriptor.kind,
            descriptor.name,
            error,
            error.remediation()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeployerConfig;
    use crate::provider::fake::FakeCloud;

    fn reconciler(cloud: &Arc<FakeCloud>) -> Reconciler {
        Reconciler::new(cloud.clone(), RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let cloud = Arc::new(FakeCloud::default());
        let reconciler = reconciler(&cloud);
        let group = ResourceDescriptor::resource_group("vocare-rg", "eastus");

        let first = reconciler.ensure(&group).await.unwrap();
        let second = reconciler.ensure(&group).await.unwrap();

        assert!(matches!(first, EnsureOutcome::Created(_)));
        assert!(matches!(second, EnsureOutcome::AlreadyPresent(_)));
        assert_eq!(cloud.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_registry_below_standard_is_upgraded() {
        let cloud = Arc::new(FakeCloud::default());
        let registry = ResourceDescriptor::registry("vocareacr", "eastus", "vocare-rg", "Standard");
        cloud.insert_resource(&registry, Some("Basic"));

        let outcome = reconciler(&cloud).ensure(&registry).await.unwrap();

        assert!(matches!(outcome, EnsureOutcome::Upgraded(_)));
        assert_eq!(outcome.state().sku.as_deref(), Some("Standard"));
    }

    #[tokio::test]
    async fn test_premium_registry_is_not_downgraded() {
        let cloud = Arc::new(FakeCloud::default());
        let registry = ResourceDescriptor::registry("vocareacr", "eastus", "vocare-rg", "Standard");
        cloud.insert_resource(&registry, Some("Premium"));

        let outcome = reconciler(&cloud).ensure(&registry).await.unwrap();
        assert!(matches!(outcome, EnsureOutcome::AlreadyPresent(_)));
    }

    #[tokio::test]
    async fn test_create_race_is_already_present() {
        let cloud = Arc::new(FakeCloud::default());
        let vault = ResourceDescriptor::vault("vocare-kv", "eastus", "vocare-rg");
        cloud.race_next_create();

        let outcome = reconciler(&cloud).ensure(&vault).await.unwrap();
        assert!(matches!(outcome, EnsureOutcome::AlreadyPresent(_)));
    }

    #[tokio::test]
    async fn test_create_race_is_reported_as_conflict_warning() {
        let cloud = Arc::new(FakeCloud::default());
        let group = ResourceDescriptor::resource_group("vocare-rg", "eastus");
        cloud.race_next_create();

        let (report, _) = reconciler(&cloud)
            .ensure_all(std::slice::from_ref(&group), ResolvedConfig::new())
            .await
            .into_result()
            .unwrap();
        assert_eq!(report.resources[0].outcome, "already-present");
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].condition, Condition::ProvisioningConflict);
    }

    #[tokio::test]
    async fn test_foreign_name_collision_is_fatal() {
        let cloud = Arc::new(FakeCloud::default());
        let storage = ResourceDescriptor::storage("vocarestorage", "eastus", "vocare-rg");
        cloud.fail_next_create(AzureError::new(
            "storage account create",
            Some("StorageAccountAlreadyTaken".to_string()),
            "The storage account named vocarestorage is already taken.",
        ));

        let err = reconciler(&cloud).ensure(&storage).await.unwrap_err();
        assert_eq!(err.condition, Condition::ProvisioningFailure);
        assert!(err.message.contains("already taken"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let cloud = Arc::new(FakeCloud::default());
        let group = ResourceDescriptor::resource_group("vocare-rg", "eastus");
        cloud.fail_next_create(AzureError::new("group create", Some("TooManyRequests".to_string()), "throttled"));

        let outcome = reconciler(&cloud).ensure(&group).await.unwrap();
        assert!(matches!(outcome, EnsureOutcome::Created(_)));
        assert_eq!(cloud.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let cloud = Arc::new(FakeCloud::default());
        let group = ResourceDescriptor::resource_group("vocare-rg", "eastus");
        cloud.fail_next_create(AzureError::new(
            "group create",
            Some("AuthorizationFailed".to_string()),
            "The client does not have authorization to perform action",
        ));

        let err = reconciler(&cloud).ensure(&group).await.unwrap_err();
        assert_eq!(err.component, Component::ResourceReconciler);
        assert_eq!(cloud.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_any_call() {
        let cloud = Arc::new(FakeCloud::default());
        let registry = ResourceDescriptor::registry("vocare-acr", "eastus", "vocare-rg", "Standard");

        let err = reconciler(&cloud).ensure(&registry).await.unwrap_err();
        assert_eq!(err.condition, Condition::ValidationFailure);
        assert_eq!(cloud.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_ensure_all_orders_and_records_endpoints() {
        let cloud = Arc::new(FakeCloud::default());
        let config = DeployerConfig::default();
        let mut descriptors = desired_resources(&config);
        descriptors.reverse();

        let (report, resolved) = reconciler(&cloud)
            .ensure_all(&descriptors, ResolvedConfig::new())
            .await
            .into_result()
            .unwrap();

        assert_eq!(report.resources.first().map(|r| r.kind), Some(ResourceKind::ResourceGroup));
        assert_eq!(report.resources.last().map(|r| r.kind), Some(ResourceKind::Cluster));
        assert_eq!(report.created(), 5);
        assert_eq!(resolved.get(keys::ACR_LOGIN_SERVER), Some("vocareacr.azurecr.io"));
        assert_eq!(resolved.get(keys::KEY_VAULT_URI), Some("https://vocare-kv.vault.azure.net/"));
        assert_eq!(resolved.get(keys::AKS_CLUSTER_NAME), Some("vocare-aks"));
    }

    #[tokio::test]
    async fn test_ensure_all_stops_at_first_failure() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.fail_next_create(AzureError::new("group create", Some("QuotaExceeded".to_string()), "quota"));
        let descriptors = desired_resources(&DeployerConfig::default());

        let run = reconciler(&cloud).ensure_all(&descriptors, ResolvedConfig::new()).await;
        assert!(run.report.resources.is_empty());
        assert!(run.into_result().is_err());
        assert_eq!(cloud.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_partial_run_keeps_converged_resources() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.fail_create_of(
            ResourceKind::Vault,
            AzureError::new(
                "keyvault create",
                Some("VaultAlreadyExists".to_string()),
                "The vault name 'vocare-kv' is already in use.",
            ),
        );
        let descriptors = desired_resources(&DeployerConfig::default());

        let run = reconciler(&cloud).ensure_all(&descriptors, ResolvedConfig::new()).await;

        let kinds: Vec<ResourceKind> = run.report.resources.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ResourceKind::ResourceGroup, ResourceKind::Registry]);
        assert_eq!(run.resolved.get(keys::ACR_LOGIN_SERVER), Some("vocareacr.azurecr.io"));
        assert_eq!(run.resolved.get(keys::KEY_VAULT_URI), None);
        let error = run.error.as_ref().unwrap();
        assert_eq!(error.condition, Condition::ProvisioningFailure);
        assert!(error.message.contains("vocare-kv"));
    }

    #[test]
    fn test_needs_upgrade() {
        assert!(needs_upgrade(Some("Basic"), "Standard"));
        assert!(!needs_upgrade(Some("standard"), "Standard"));
        assert!(!needs_upgrade(Some("Premium"), "Standard"));
        assert!(needs_upgrade(None, "Standard"));
    }
}
