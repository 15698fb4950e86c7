//! # Constants
//!
//! Shared constants used throughout the deployer.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default Azure region for every provisioned resource
pub const DEFAULT_LOCATION: &str = "eastus";

/// Default resource group holding the whole stack
pub const DEFAULT_RESOURCE_GROUP: &str = "vocare-rg";

/// Default container registry name (globally unique, alphanumeric)
pub const DEFAULT_REGISTRY_NAME: &str = "vocareacr";

/// Minimum registry SKU; ACR build tasks are not available on Basic
pub const DEFAULT_REGISTRY_SKU: &str = "Standard";

/// Default AKS cluster name
pub const DEFAULT_CLUSTER_NAME: &str = "vocare-aks";

/// Default Key Vault name (globally unique)
pub const DEFAULT_VAULT_NAME: &str = "vocare-kv";

/// Default storage account name (globally unique, lowercase alphanumeric)
pub const DEFAULT_STORAGE_ACCOUNT: &str = "vocarestorage";

/// Default AKS node count
pub const DEFAULT_NODE_COUNT: u32 = 2;

/// Default AKS node VM size
pub const DEFAULT_NODE_VM_SIZE: &str = "Standard_D4s_v3";

/// Default user-assigned managed identity used by the workloads
pub const DEFAULT_IDENTITY_NAME: &str = "vocare-workload-identity";

/// Default federated credential name on the managed identity
pub const DEFAULT_FEDERATED_CREDENTIAL_NAME: &str = "vocare-aks-federation";

/// Default Kubernetes namespace for the stack
pub const DEFAULT_NAMESPACE: &str = "vocare";

/// Default Kubernetes service account bound to the managed identity
pub const DEFAULT_SERVICE_ACCOUNT: &str = "vocare-workload";

/// Default Helm release name
pub const DEFAULT_RELEASE_NAME: &str = "vocare";

/// Role granted to the managed identity on the vault scope
pub const KEY_VAULT_SECRETS_USER_ROLE: &str = "Key Vault Secrets User";

/// Audience required by Azure AD for workload identity token exchange
pub const WORKLOAD_IDENTITY_AUDIENCE: &str = "api://AzureADTokenExchange";

/// Default number of OIDC issuer activation polls
pub const DEFAULT_ISSUER_POLL_ATTEMPTS: u32 = 30;

/// Default interval between OIDC issuer activation polls (seconds)
pub const DEFAULT_ISSUER_POLL_INTERVAL_SECS: u64 = 10;

/// Default attempts for a single cloud API call that fails transiently
pub const DEFAULT_CLOUD_RETRY_ATTEMPTS: u32 = 3;

/// Default starting delay for retrying transient cloud failures (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 2000;

/// Default maximum delay for retrying transient cloud failures (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default readiness wait for workloads (seconds)
pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 600;

/// Default interval between readiness polls (seconds)
pub const DEFAULT_READINESS_POLL_INTERVAL_SECS: u64 = 10;

/// Service that receives the post-deploy liveness request
pub const DEFAULT_HEALTH_SERVICE: &str = "vocare-backend";

/// Port of the backend health server
pub const DEFAULT_HEALTH_PORT: u16 = 8000;

/// Path of the backend liveness endpoint
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// How long to wait for the port-forward to report its local port (seconds)
pub const PORT_FORWARD_STARTUP_TIMEOUT_SECS: u64 = 15;

/// Timeout for the liveness request itself (seconds)
pub const HEALTH_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default backup output directory
pub const DEFAULT_BACKUP_DIR: &str = "backups";

/// Default backup retention window (days)
pub const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 7;

/// Default number of log lines captured per pod
pub const DEFAULT_LOG_TAIL_LINES: i64 = 200;

/// Prefix of every backup directory and archive
pub const BACKUP_PREFIX: &str = "vocare-backup-";

/// Timestamp format embedded in backup names
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Where resolved identifiers are persisted between runs
pub const DEFAULT_RESOLVED_CONFIG_PATH: &str = ".vocare/resolved.env";

/// Directory holding `values-<env>.yaml` files
pub const DEFAULT_VALUES_DIR: &str = "deploy";

/// Helm chart rendered for each environment
pub const DEFAULT_CHART_PATH: &str = "deploy/chart";

/// Raw manifest directory used when no chart is present
pub const DEFAULT_MANIFESTS_DIR: &str = "k8s";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "vocarectl";

/// Label carrying the per-run deployment id
pub const DEPLOY_RUN_LABEL: &str = "vocare.io/deploy-run";

/// Label carrying the target environment
pub const ENVIRONMENT_LABEL: &str = "vocare.io/environment";

/// SecretProviderClass that mounts Key Vault secrets into the workloads
pub const SECRET_PROVIDER_CLASS_NAME: &str = "vocare-keyvault";

/// Kubernetes secrets production requires before deploying
pub const PRODUCTION_REQUIRED_SECRETS: &[&str] = &["vocare-secrets", "livekit-keys"];
