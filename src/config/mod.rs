//! # Deployer Configuration
//!
//! Run-level settings loaded from environment variables, with CLI flags layered
//! on top by `vocarectl`.
//!
//! - [`DeployerConfig`] - resource names, namespaces, timeouts, paths
//! - [`resolved::ResolvedConfig`] - append-only record of identifiers resolved
//!   while provisioning (client id, issuer URL, ...)
//! - [`duration`] - parsing of `30s` / `10m` / `1h` style durations

pub mod duration;
pub mod resolved;

pub use duration::parse_duration;
pub use resolved::ResolvedConfig;

use crate::constants::*;
use std::path::PathBuf;
use std::time::Duration;

/// How the Key Vault data-plane client authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AzureAuthMode {
    /// Reuse the operator's `az login` session
    Cli,
    /// Managed identity of the host (CI runners on Azure, in-cluster jobs)
    ManagedIdentity,
    /// Federated workload identity (in-cluster backup CronJob)
    WorkloadIdentity,
}

impl AzureAuthMode {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "managed" | "managed-identity" | "msi" => Self::ManagedIdentity,
            "workload" | "workload-identity" => Self::WorkloadIdentity,
            _ => Self::Cli,
        }
    }
}

/// Run-level configuration
///
/// All settings have sensible defaults and can be overridden via `VOCARE_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct DeployerConfig {
    /// Azure subscription passed to every `az` call (current subscription when unset)
    pub subscription_id: Option<String>,
    pub location: String,
    pub resource_group: String,
    pub registry_name: String,
    /// Minimum registry SKU; a registry below it is upgraded in place
    pub registry_sku: String,
    pub cluster_name: String,
    pub node_count: u32,
    pub node_vm_size: String,
    pub vault_name: String,
    pub storage_account: String,
    pub identity_name: String,
    pub federated_credential_name: String,
    pub namespace: String,
    pub service_account: String,
    pub release_name: String,
    /// Directory holding `values-<env>.yaml`
    pub values_dir: PathBuf,
    /// Helm chart rendered with `helm template` when present
    pub chart_path: PathBuf,
    /// Raw manifest directory used when no chart is present
    pub manifests_dir: PathBuf,
    /// Where resolved identifiers are persisted between runs
    pub resolved_config_path: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_retention_days: u32,
    pub log_tail_lines: i64,
    pub issuer_poll_attempts: u32,
    pub issuer_poll_interval_secs: u64,
    pub cloud_retry_attempts: u32,
    pub backoff_start_ms: u64,
    pub backoff_max_ms: u64,
    pub readiness_timeout_secs: u64,
    pub readiness_poll_interval_secs: u64,
    pub health_service: String,
    pub health_port: u16,
    pub health_path: String,
    pub azure_auth: AzureAuthMode,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            subscription_id: None,
            location: DEFAULT_LOCATION.to_string(),
            resource_group: DEFAULT_RESOURCE_GROUP.to_string(),
            registry_name: DEFAULT_REGISTRY_NAME.to_string(),
            registry_sku: DEFAULT_REGISTRY_SKU.to_string(),
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            node_count: DEFAULT_NODE_COUNT,
            node_vm_size: DEFAULT_NODE_VM_SIZE.to_string(),
            vault_name: DEFAULT_VAULT_NAME.to_string(),
            storage_account: DEFAULT_STORAGE_ACCOUNT.to_string(),
            identity_name: DEFAULT_IDENTITY_NAME.to_string(),
            federated_credential_name: DEFAULT_FEDERATED_CREDENTIAL_NAME.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            service_account: DEFAULT_SERVICE_ACCOUNT.to_string(),
            release_name: DEFAULT_RELEASE_NAME.to_string(),
            values_dir: PathBuf::from(DEFAULT_VALUES_DIR),
            chart_path: PathBuf::from(DEFAULT_CHART_PATH),
            manifests_dir: PathBuf::from(DEFAULT_MANIFESTS_DIR),
            resolved_config_path: PathBuf::from(DEFAULT_RESOLVED_CONFIG_PATH),
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            backup_retention_days: DEFAULT_BACKUP_RETENTION_DAYS,
            log_tail_lines: DEFAULT_LOG_TAIL_LINES,
            issuer_poll_attempts: DEFAULT_ISSUER_POLL_ATTEMPTS,
            issuer_poll_interval_secs: DEFAULT_ISSUER_POLL_INTERVAL_SECS,
            cloud_retry_attempts: DEFAULT_CLOUD_RETRY_ATTEMPTS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            readiness_timeout_secs: DEFAULT_READINESS_TIMEOUT_SECS,
            readiness_poll_interval_secs: DEFAULT_READINESS_POLL_INTERVAL_SECS,
            health_service: DEFAULT_HEALTH_SERVICE.to_string(),
            health_port: DEFAULT_HEALTH_PORT,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            azure_auth: AzureAuthMode::Cli,
            log_level: "INFO".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl DeployerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            subscription_id: std::env::var("VOCARE_SUBSCRIPTION_ID")
                .or_else(|_| std::env::var("AZURE_SUBSCRIPTION_ID"))
                .ok()
                .filter(|s| !s.trim().is_empty()),
            location: env_var_or_default_str("VOCARE_LOCATION", &defaults.location),
            resource_group: env_var_or_default_str("VOCARE_RESOURCE_GROUP", &defaults.resource_group),
            registry_name: env_var_or_default_str("VOCARE_REGISTRY_NAME", &defaults.registry_name),
            registry_sku: env_var_or_default_str("VOCARE_REGISTRY_SKU", &defaults.registry_sku),
            cluster_name: env_var_or_default_str("VOCARE_CLUSTER_NAME", &defaults.cluster_name),
            node_count: env_var_or_default("VOCARE_NODE_COUNT", defaults.node_count),
            node_vm_size: env_var_or_default_str("VOCARE_NODE_VM_SIZE", &defaults.node_vm_size),
            vault_name: env_var_or_default_str("VOCARE_VAULT_NAME", &defaults.vault_name),
            storage_account: env_var_or_default_str(
                "VOCARE_STORAGE_ACCOUNT",
                &defaults.storage_account,
            ),
            identity_name: env_var_or_default_str("VOCARE_IDENTITY_NAME", &defaults.identity_name),
            federated_credential_name: env_var_or_default_str(
                "VOCARE_FEDERATED_CREDENTIAL_NAME",
                &defaults.federated_credential_name,
            ),
            namespace: env_var_or_default_str("VOCARE_NAMESPACE", &defaults.namespace),
            service_account: env_var_or_default_str(
                "VOCARE_SERVICE_ACCOUNT",
                &defaults.service_account,
            ),
            release_name: env_var_or_default_str("VOCARE_RELEASE_NAME", &defaults.release_name),
            values_dir: env_var_or_default_path("VOCARE_VALUES_DIR", defaults.values_dir),
            chart_path: env_var_or_default_path("VOCARE_CHART_PATH", defaults.chart_path),
            manifests_dir: env_var_or_default_path("VOCARE_MANIFESTS_DIR", defaults.manifests_dir),
            resolved_config_path: env_var_or_default_path(
                "VOCARE_RESOLVED_CONFIG",
                defaults.resolved_config_path,
            ),
            backup_dir: env_var_or_default_path("VOCARE_BACKUP_DIR", defaults.backup_dir),
            backup_retention_days: env_var_or_default(
                "VOCARE_BACKUP_RETENTION_DAYS",
                defaults.backup_retention_days,
            ),
            log_tail_lines: env_var_or_default("VOCARE_LOG_TAIL_LINES", defaults.log_tail_lines),
            issuer_poll_attempts: env_var_or_default(
                "VOCARE_ISSUER_POLL_ATTEMPTS",
                defaults.issuer_poll_attempts,
            ),
            issuer_poll_interval_secs: env_var_or_default(
                "VOCARE_ISSUER_POLL_INTERVAL_SECS",
                defaults.issuer_poll_interval_secs,
            ),
            cloud_retry_attempts: env_var_or_default(
                "VOCARE_CLOUD_RETRY_ATTEMPTS",
                defaults.cloud_retry_attempts,
            ),
            backoff_start_ms: env_var_or_default("VOCARE_BACKOFF_START_MS", defaults.backoff_start_ms),
            backoff_max_ms: env_var_or_default("VOCARE_BACKOFF_MAX_MS", defaults.backoff_max_ms),
            readiness_timeout_secs: env_var_or_default(
                "VOCARE_READINESS_TIMEOUT_SECS",
                defaults.readiness_timeout_secs,
            ),
            readiness_poll_interval_secs: env_var_or_default(
                "VOCARE_READINESS_POLL_INTERVAL_SECS",
                defaults.readiness_poll_interval_secs,
            ),
            health_service: env_var_or_default_str("VOCARE_HEALTH_SERVICE", &defaults.health_service),
            health_port: env_var_or_default("VOCARE_HEALTH_PORT", defaults.health_port),
            health_path: env_var_or_default_str("VOCARE_HEALTH_PATH", &defaults.health_path),
            azure_auth: std::env::var("VOCARE_AZURE_AUTH")
                .map(|v| AzureAuthMode::parse(&v))
                .unwrap_or(defaults.azure_auth),
            log_level: env_var_or_default_str("LOG_LEVEL", &defaults.log_level),
            log_format: env_var_or_default_str("LOG_FORMAT", &defaults.log_format),
        }
    }

    /// Values file for an environment (`deploy/values-dev.yaml`)
    #[must_use]
    pub fn values_file(&self, environment: &str) -> PathBuf {
        self.values_dir.join(format!("values-{environment}.yaml"))
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_secs(self.readiness_poll_interval_secs)
    }

    pub fn issuer_poll_interval(&self) -> Duration {
        Duration::from_secs(self.issuer_poll_interval_secs)
    }

    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_var_or_default_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var_os(key).map(PathBuf::from).unwrap_or(default)
}
