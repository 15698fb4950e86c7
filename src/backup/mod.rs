//! # Backup & Restore Pipeline
//!
//! Captures cluster and cloud state into a timestamped directory under the
//! backup root, compresses it and prunes backups past the retention window.
//!
//! ```text
//! vocare-backup-<YYYYmmdd-HHMMSS>/
//! |-- kubernetes/      per-type exports, server fields stripped, Secrets as key names only
//! |-- azure/           resource metadata, keyvault-secret-names.json
//! |-- registry/        repositories.json, pull-images.sh
//! |-- config/          deploy/ and k8s/ trees, dotenv files excluded
//! |-- logs/            pod log tails, events.json
//! |-- backup-manifest.json
//! |-- RESTORE.md
//! `-- restore-secrets.sh
//! ```
//!
//! Secret values are never read from the vault. After writing, every file is
//! scanned for the secret values the caller knows about; a hit discards the
//! backup.

mod archive;
mod restore;
mod retention;

pub use archive::{checksum_path, sha256_file, verify_checksum, Archiver, TarArchiver};
pub use restore::{restore, RestoreResult};
pub use retention::{backup_name, parse_backup_timestamp, prune, PruneReport};

use crate::cluster::{redact_secret, sanitize_for_apply, ClusterApi};
use crate::config::DeployerConfig;
use crate::error::{Component, Condition, DeployerError, Result, Warning};
use crate::provider::CloudApi;
use crate::reconciler::{desired_resources, ResourceDescriptor, ResourceKind};
use crate::secrets::{is_placeholder, vault_secret_names, SecretValues};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use walkdir::WalkDir;
use zeroize::Zeroizing;

pub const MANIFEST_FILE: &str = "backup-manifest.json";
pub const RESTORE_GUIDE_FILE: &str = "RESTORE.md";
pub const RESTORE_SCRIPT_FILE: &str = "restore-secrets.sh";
pub const SECRET_NAMES_FILE: &str = "keyvault-secret-names.json";

/// Kubernetes types exported, as (file stem, apiVersion, kind)
pub const KUBERNETES_EXPORTS: &[(&str, &str, &str)] = &[
    ("deployments", "apps/v1", "Deployment"),
    ("statefulsets", "apps/v1", "StatefulSet"),
    ("services", "v1", "Service"),
    ("configmaps", "v1", "ConfigMap"),
    ("serviceaccounts", "v1", "ServiceAccount"),
    ("ingresses", "networking.k8s.io/v1", "Ingress"),
    (
        "secretproviderclasses",
        "secrets-store.csi.x-k8s.io/v1",
        "SecretProviderClass",
    ),
    ("secrets", "v1", "Secret"),
];

/// Identifiers of the captured environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentifiers {
    pub resource_group: String,
    pub cluster_name: String,
    pub namespace: String,
    pub vault_name: String,
    pub registry_name: String,
    pub storage_account: String,
}

/// Which parts of the backup were captured completely
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFlags {
    pub kubernetes: bool,
    pub azure_resources: bool,
    pub keyvault_secret_names: bool,
    pub registry: bool,
    pub config: bool,
    pub logs: bool,
}

/// `backup-manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub timestamp: DateTime<Utc>,
    pub tool_version: String,
    pub cluster: ClusterIdentifiers,
    pub captured: CaptureFlags,
    pub failed_steps: Vec<String>,
    pub restore_instructions: String,
    pub secret_values_included: bool,
    pub secret_restore: String,
}

/// A completed backup
#[derive(Debug, Clone)]
pub struct BackupArchive {
    pub timestamp: DateTime<Utc>,
    pub directory: PathBuf,
    /// `None` when compression failed (the directory is still complete)
    pub archive_path: Option<PathBuf>,
    pub checksum_path: Option<PathBuf>,
    pub manifest: BackupManifest,
    pub restore_script: PathBuf,
    pub prune: PruneReport,
    pub warnings: Vec<Warning>,
}

/// Backup settings taken from [`DeployerConfig`]
#[derive(Debug, Clone)]
struct BackupSettings {
    root: PathBuf,
    retention_days: u32,
    log_tail_lines: i64,
    identifiers: ClusterIdentifiers,
    identity_name: String,
    resources: Vec<ResourceDescriptor>,
    config_dirs: Vec<PathBuf>,
}

/// Steps recorded while one backup runs
#[derive(Debug, Default)]
struct StepLog {
    failed: Vec<String>,
    warnings: Vec<Warning>,
}

impl StepLog {
    fn fail(&mut self, step: &str, error: &anyhow::Error) {
        error!(step, "Backup step failed: {:#}", error);
        self.failed.push(step.to_string());
        self.warnings.push(Warning::new(
            Condition::BackupStepFailure,
            Component::BackupPipeline,
            format!("{step}: {error:#}"),
        ));
    }

    /// Record a step outcome; true when it succeeded
    fn record(&mut self, step: &str, outcome: anyhow::Result<()>) -> bool {
        match outcome {
            Ok(()) => true,
            Err(e) => {
                self.fail(step, &e);
                false
            }
        }
    }
}

pub struct BackupPipeline {
    cloud: Arc<dyn CloudApi>,
    cluster: Arc<dyn ClusterApi>,
    archiver: Arc<dyn Archiver>,
    settings: BackupSettings,
    known_secrets: Vec<Zeroizing<String>>,
}

impl std::fmt::Debug for BackupPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupPipeline")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl BackupPipeline {
    pub fn new(
        config: &DeployerConfig,
        cloud: Arc<dyn CloudApi>,
        cluster: Arc<dyn ClusterApi>,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        let mut config_dirs = vec![config.values_dir.clone(), config.manifests_dir.clone()];
        config_dirs.dedup();
        Self {
            cloud,
            cluster,
            archiver,
            settings: BackupSettings {
                root: config.backup_dir.clone(),
                retention_days: config.backup_retention_days,
                log_tail_lines: config.log_tail_lines,
                identifiers: ClusterIdentifiers {
                    resource_group: config.resource_group.clone(),
                    cluster_name: config.cluster_name.clone(),
                    namespace: config.namespace.clone(),
                    vault_name: config.vault_name.clone(),
                    registry_name: config.registry_name.clone(),
                    storage_account: config.storage_account.clone(),
                },
                identity_name: config.identity_name.clone(),
                resources: desired_resources(config),
                config_dirs,
            },
            known_secrets: Vec::new(),
        }
    }

    /// Secret values that must not appear anywhere in the backup
    #[must_use]
    pub fn with_known_secrets(mut self, values: &SecretValues) -> Self {
        self.known_secrets = values
            .values()
            .filter(|v| !is_placeholder(v))
            .map(|v| Zeroizing::new(v.trim().to_string()))
            .collect();
        self
    }

    /// Capture, compress and prune; `now` names the backup
    pub async fn run(&self, now: DateTime<Utc>) -> Result<BackupArchive> {
        let name = backup_name(now);
        let span = info_span!("backup", backup = %name);
        self.capture(now, &name).instrument(span).await
    }

    async fn capture(&self, now: DateTime<Utc>, name: &str) -> Result<BackupArchive> {
        let directory = self.settings.root.join(name);
        for sub in ["kubernetes", "azure", "registry", "config", "logs"] {
            std::fs::create_dir_all(directory.join(sub)).map_err(|e| {
                DeployerError::prerequisite(
                    Component::BackupPipeline,
                    format!("cannot create {}: {e}", directory.join(sub).display()),
                )
            })?;
        }
        info!(directory = %directory.display(), "Starting backup");

        let mut log = StepLog::default();
        let mut captured = CaptureFlags {
            kubernetes: self.export_kubernetes(&directory, &mut log).await,
            azure_resources: self.export_azure(&directory, &mut log).await,
            ..CaptureFlags::default()
        };
        let secret_names = match self.export_secret_names(&directory).await {
            Ok(names) => {
                captured.keyvault_secret_names = true;
                names
            }
            Err(e) => {
                log.fail("azure/keyvault-secret-names", &e);
                vault_secret_names().map(str::to_string).collect()
            }
        };
        let registry = self.export_registry(&directory).await;
        captured.registry = log.record("registry", registry);
        let config = self.copy_config(&directory);
        captured.config = log.record("config", config);
        captured.logs = self.export_logs(&directory, &mut log).await;

        let manifest = BackupManifest {
            timestamp: now,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            cluster: self.settings.identifiers.clone(),
            captured,
            failed_steps: log.failed.clone(),
            restore_instructions: RESTORE_GUIDE_FILE.to_string(),
            secret_values_included: false,
            secret_restore: "manual".to_string(),
        };
        let restore_script = directory.join(RESTORE_SCRIPT_FILE);
        self.write_restore_material(&directory, &manifest, &secret_names)
            .map_err(|e| {
                DeployerError::new(
                    Condition::BackupStepFailure,
                    Component::BackupPipeline,
                    format!("failed to write restore material: {e:#}"),
                )
            })?;

        self.enforce_secrecy(&directory)?;

        let archive_path = self.settings.root.join(format!("{name}.tar.gz"));
        let (archive_path, checksum_path) =
            match self.archiver.archive(&directory, &archive_path).await {
                Ok(()) => match archive::write_checksum(&archive_path) {
                    Ok(checksum) => (Some(archive_path), Some(checksum)),
                    Err(e) => {
                        log.fail("checksum", &e);
                        (Some(archive_path), None)
                    }
                },
                Err(e) => {
                    log.fail("archive", &e);
                    (None, None)
                }
            };

        let prune = match prune(&self.settings.root, self.settings.retention_days, now) {
            Ok(report) => report,
            Err(e) => {
                log.fail("prune", &e);
                PruneReport::default()
            }
        };

        info!(
            failed_steps = log.failed.len(),
            pruned = prune.removed.len(),
            "Backup complete"
        );
        Ok(BackupArchive {
            timestamp: now,
            directory,
            archive_path,
            checksum_path,
            manifest,
            restore_script,
            prune,
            warnings: log.warnings,
        })
    }

    /// One file per type; a failing type is recorded and skipped
    async fn export_kubernetes(&self, directory: &Path, log: &mut StepLog) -> bool {
        let namespace = &self.settings.identifiers.namespace;
        let mut complete = true;
        for (stem, api_version, kind) in KUBERNETES_EXPORTS {
            let step = format!("kubernetes/{stem}");
            let outcome = async {
                let objects = self.cluster.list(api_version, kind, Some(namespace)).await?;
                let items: Vec<Value> = objects
                    .iter()
                    .map(|object| {
                        if *kind == "Secret" {
                            redact_secret(object)
                        } else {
                            sanitize_for_apply(object)
                        }
                    })
                    .collect();
                debug!(kind, count = items.len(), "Exported");
                let list = json!({"apiVersion": "v1", "kind": "List", "items": items});
                let yaml = serde_yaml::to_string(&list).context("Failed to encode YAML")?;
                write_file(&directory.join("kubernetes").join(format!("{stem}.yaml")), &yaml)
            }
            .await;
            complete &= log.record(&step, outcome);
        }
        complete
    }

    async fn export_azure(&self, directory: &Path, log: &mut StepLog) -> bool {
        let azure = directory.join("azure");
        let mut complete = true;
        for descriptor in &self.settings.resources {
            let step = format!("azure/{}", resource_slug(descriptor.kind));
            let outcome = match self.cloud.show(descriptor).await {
                Ok(Some(state)) => write_json(
                    &azure.join(format!("{}.json", resource_slug(descriptor.kind))),
                    &state.raw,
                ),
                Ok(None) => Err(anyhow::anyhow!("{} {} not found", descriptor.kind, descriptor.name)),
                Err(e) => Err(e.into()),
            };
            complete &= log.record(&step, outcome);
        }

        let identifiers = &self.settings.identifiers;
        let identity = match self
            .cloud
            .show_identity(&identifiers.resource_group, &self.settings.identity_name)
            .await
        {
            Ok(Some(identity)) => write_json(&azure.join("managed-identity.json"), &identity),
            Ok(None) => Err(anyhow::anyhow!(
                "managed identity {} not found",
                self.settings.identity_name
            )),
            Err(e) => Err(e.into()),
        };
        complete &= log.record("azure/managed-identity", identity);
        complete
    }

    /// Names and attributes only; returns the names
    async fn export_secret_names(&self, directory: &Path) -> anyhow::Result<Vec<String>> {
        let secrets = self
            .cloud
            .list_vault_secrets(&self.settings.identifiers.vault_name)
            .await?;
        write_json(&directory.join("azure").join(SECRET_NAMES_FILE), &secrets)?;
        Ok(secrets.into_iter().map(|s| s.name).collect())
    }

    async fn export_registry(&self, directory: &Path) -> anyhow::Result<()> {
        let registry = &self.settings.identifiers.registry_name;
        let repositories = self.cloud.list_registry_repositories(registry).await?;
        let dir = directory.join("registry");
        write_json(&dir.join("repositories.json"), &repositories)?;

        let login_server = format!("{registry}.azurecr.io");
        let mut script = format!(
            "#!/usr/bin/env bash\n# Pull every image recorded in this backup\nset -euo pipefail\n\naz acr login --name {registry}\n"
        );
        for repository in &repositories {
            for tag in &repository.tags {
                script.push_str(&format!("docker pull {login_server}/{}:{tag}\n", repository.name));
            }
        }
        write_executable(&dir.join("pull-images.sh"), &script)
    }

    /// Verbatim tree copy, skipping dotenv files
    fn copy_config(&self, directory: &Path) -> anyhow::Result<()> {
        let config = directory.join("config");
        for source in &self.settings.config_dirs {
            if !source.is_dir() {
                debug!(dir = %source.display(), "Config directory absent, skipped");
                continue;
            }
            let base = source.file_name().map(PathBuf::from).unwrap_or_default();
            for entry in WalkDir::new(source).into_iter().filter_map(std::result::Result::ok) {
                if !entry.file_type().is_file() || is_dotenv(entry.file_name().to_str()) {
                    continue;
                }
                let relative = entry.path().strip_prefix(source)?;
                let target = config.join(&base).join(relative);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target).with_context(|| {
                    format!("Failed to copy {}", entry.path().display())
                })?;
            }
        }
        Ok(())
    }

    async fn export_logs(&self, directory: &Path, log: &mut StepLog) -> bool {
        let namespace = &self.settings.identifiers.namespace;
        let logs = directory.join("logs");
        let mut complete = true;

        match self.cluster.list("v1", "Pod", Some(namespace)).await {
            Ok(pods) => {
                for pod in pods {
                    let Some(name) = pod.pointer("/metadata/name").and_then(Value::as_str) else {
                        continue;
                    };
                    let outcome = async {
                        let text = self
                            .cluster
                            .pod_logs(namespace, name, self.settings.log_tail_lines)
                            .await?;
                        write_file(&logs.join(format!("{name}.log")), &text)
                    }
                    .await;
                    complete &= log.record(&format!("logs/{name}"), outcome);
                }
            }
            Err(e) => {
                log.fail("logs/pods", &e);
                complete = false;
            }
        }

        let events = async {
            let events = self.cluster.list("v1", "Event", Some(namespace)).await?;
            write_json(&logs.join("events.json"), &events)
        }
        .await;
        complete &= log.record("logs/events", events);
        complete
    }

    fn write_restore_material(
        &self,
        directory: &Path,
        manifest: &BackupManifest,
        secret_names: &[String],
    ) -> anyhow::Result<()> {
        write_json(&directory.join(MANIFEST_FILE), manifest)?;
        write_file(
            &directory.join(RESTORE_GUIDE_FILE),
            &restore_guide(manifest, secret_names),
        )?;
        write_executable(
            &directory.join(RESTORE_SCRIPT_FILE),
            &restore_script(&manifest.cluster.vault_name, secret_names),
        )
    }

    /// Discard the backup if any file contains a known secret value
    fn enforce_secrecy(&self, directory: &Path) -> Result<()> {
        if self.known_secrets.is_empty() {
            return Ok(());
        }
        for entry in WalkDir::new(directory).into_iter().filter_map(std::result::Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(content) = std::fs::read(entry.path()) else {
                continue;
            };
            let leaked = self
                .known_secrets
                .iter()
                .any(|secret| contains_bytes(&content, secret.as_bytes()));
            if leaked {
                let file = entry.path().display().to_string();
                if let Err(e) = std::fs::remove_dir_all(directory) {
                    warn!("Failed to discard backup directory: {}", e);
                }
                return Err(DeployerError::new(
                    Condition::BackupStepFailure,
                    Component::BackupPipeline,
                    format!("secret value found in {file}; backup discarded"),
                ));
            }
        }
        debug!("Secrecy scan passed");
        Ok(())
    }
}

fn resource_slug(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::ResourceGroup => "resource-group",
        ResourceKind::Registry => "container-registry",
        ResourceKind::Cluster => "aks-cluster",
        ResourceKind::Vault => "key-vault",
        ResourceKind::Storage => "storage-account",
    }
}

fn is_dotenv(file_name: Option<&str>) -> bool {
    file_name.is_some_and(|name| name == ".env" || name.starts_with(".env.") || name.ends_with(".env"))
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode JSON")?;
    write_file(path, &text)
}

fn write_executable(path: &Path, content: &str) -> anyhow::Result<()> {
    write_file(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to mark {} executable", path.display()))?;
    }
    Ok(())
}

fn restore_guide(manifest: &BackupManifest, secret_names: &[String]) -> String {
    let cluster = &manifest.cluster;
    let mut guide = format!(
        "# Restoring backup {timestamp}\n\n\
         Cluster `{cluster_name}` in resource group `{group}`, namespace `{namespace}`.\n\n\
         This backup contains no secret values. Secrets are restored manually.\n\n\
         ## 1. Infrastructure\n\n\
         Run `vocarectl provision` to recreate the resource group, registry, cluster, \
         Key Vault `{vault}` and storage account `{storage}`. Resource metadata captured \
         at backup time is in `azure/`.\n\n\
         ## 2. Secrets\n\n\
         Run `./{script}` and enter each value when prompted. It writes these Key Vault secrets:\n\n",
        timestamp = manifest.timestamp.to_rfc3339(),
        cluster_name = cluster.cluster_name,
        group = cluster.resource_group,
        namespace = cluster.namespace,
        vault = cluster.vault_name,
        storage = cluster.storage_account,
        script = RESTORE_SCRIPT_FILE,
    );
    for name in secret_names {
        guide.push_str(&format!("- `{name}`\n"));
    }
    guide.push_str(
        "\n## 3. Images\n\n\
         Run `registry/pull-images.sh` to pull the recorded image tags.\n\n\
         ## 4. Kubernetes objects\n\n\
         Preview with `vocarectl restore <this backup> --dry-run`, then run it without \
         `--dry-run`. Secrets are not re-applied; `kubernetes/secrets.yaml` lists their key \
         names only.\n",
    );
    if !manifest.failed_steps.is_empty() {
        guide.push_str("\n## Incomplete steps\n\n");
        for step in &manifest.failed_steps {
            guide.push_str(&format!("- {step}\n"));
        }
    }
    guide
}

fn restore_script(vault_name: &str, secret_names: &[String]) -> String {
    let mut script = format!(
        "#!/usr/bin/env bash\n\
         # Re-enter Key Vault secrets after a restore. Empty input skips a secret.\n\
         set -euo pipefail\n\n\
         VAULT_NAME=\"${{VAULT_NAME:-{vault_name}}}\"\n\n\
         set_secret() {{\n  \
           local name=\"$1\"\n  \
           local value\n  \
           read -r -p \"Value for ${{name}} (empty to skip): \" value\n  \
           if [ -n \"${{value}}\" ]; then\n    \
             az keyvault secret set --vault-name \"${{VAULT_NAME}}\" --name \"${{name}}\" --value \"${{value}}\" --output none\n    \
             echo \"set ${{name}}\"\n  \
           else\n    \
             echo \"skipped ${{name}}\"\n  \
           fi\n\
         }}\n\n"
    );
    for name in secret_names {
        script.push_str(&format!("set_secret {name}\n"));
    }
    script
}
