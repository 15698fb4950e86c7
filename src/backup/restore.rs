//! Guided restore from a backup directory or archive.
//!
//! Re-applies the exported Kubernetes objects in dependency order and lists
//! the secrets an operator has to enter again. Secrets themselves are never
//! re-applied.

use super::archive::{verify_checksum, Archiver};
use super::{BackupManifest, MANIFEST_FILE, SECRET_NAMES_FILE};
use crate::cluster::{sanitize_for_apply, ClusterApi, ObjectKey};
use crate::deploy::manifests::{parse_documents, ManifestSet};
use crate::provider::VaultSecretInfo;
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// What a restore did (or, in a dry run, would do)
#[derive(Debug, Clone, Default)]
pub struct RestoreResult {
    pub backup_dir: PathBuf,
    pub dry_run: bool,
    pub manifest: Option<BackupManifest>,
    pub checksum_verified: bool,
    pub applied: Vec<ObjectKey>,
    pub failed: Vec<(ObjectKey, String)>,
    /// Kubernetes Secrets present at backup time, not restored
    pub skipped_secrets: Vec<ObjectKey>,
    /// Key Vault secrets to enter again (`restore-secrets.sh`)
    pub vault_secrets_to_reenter: Vec<String>,
}

/// Restore `source` (a `vocare-backup-*` directory or `.tar.gz`) into the cluster
pub async fn restore(
    source: &Path,
    cluster: &dyn ClusterApi,
    archiver: &dyn Archiver,
    dry_run: bool,
) -> Result<RestoreResult> {
    let mut result = RestoreResult {
        dry_run,
        ..RestoreResult::default()
    };
    let (backup_dir, checksum_verified) = locate_backup(source, archiver).await?;
    result.checksum_verified = checksum_verified;
    info!(backup = %backup_dir.display(), dry_run, "Restoring backup");

    result.manifest = read_manifest(&backup_dir);
    result.vault_secrets_to_reenter = read_secret_names(&backup_dir);

    let mut objects = Vec::new();
    let kubernetes = backup_dir.join("kubernetes");
    let mut files: Vec<PathBuf> = std::fs::read_dir(&kubernetes)
        .with_context(|| format!("{} has no kubernetes/ exports", backup_dir.display()))?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|e| e == "yaml"))
        .collect();
    files.sort();

    for file in files {
        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        for object in parse_documents(&text)? {
            if object.get("kind").and_then(Value::as_str) == Some("Secret") {
                if let Ok(key) = ObjectKey::from_object(&object) {
                    result.skipped_secrets.push(key);
                }
                continue;
            }
            objects.push(sanitize_for_apply(&object));
        }
    }

    let namespace = result
        .manifest
        .as_ref()
        .map(|m| m.cluster.namespace.clone());
    if let Some(namespace) = &namespace {
        objects.push(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": namespace}
        }));
    }

    let set = ManifestSet::from_objects(objects, namespace.as_deref().unwrap_or("default"));
    for batch in &set.batches {
        for object in &batch.objects {
            let key = ObjectKey::from_object(object)?;
            match cluster.apply(object, dry_run).await {
                Ok(_) => {
                    debug!(object = %key, dry_run, "Restored");
                    result.applied.push(key);
                }
                Err(e) => {
                    error!(object = %key, "Restore failed: {:#}", e);
                    result.failed.push((key, format!("{e:#}")));
                }
            }
        }
    }

    result.backup_dir = backup_dir;
    info!(
        applied = result.applied.len(),
        failed = result.failed.len(),
        secrets_to_reenter = result.vault_secrets_to_reenter.len(),
        "Restore finished"
    );
    Ok(result)
}

/// Backup directory for `source`, extracting archives next to themselves
async fn locate_backup(source: &Path, archiver: &dyn Archiver) -> Result<(PathBuf, bool)> {
    if source.is_dir() {
        return Ok((source.to_path_buf(), false));
    }
    let file_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{} is not a backup", source.display()))?;
    let stem = file_name
        .strip_suffix(".tar.gz")
        .ok_or_else(|| anyhow!("{} is neither a backup directory nor a .tar.gz", source.display()))?;

    let verified = verify_checksum(source)?;
    if !verified {
        warn!(archive = %source.display(), "No checksum file, archive integrity not verified");
    }

    let parent = source.parent().unwrap_or_else(|| Path::new("."));
    let dir = parent.join(stem);
    if !dir.is_dir() {
        archiver.extract(source, parent).await?;
    }
    if !dir.is_dir() {
        return Err(anyhow!(
            "{} did not contain {stem}/",
            source.display()
        ));
    }
    Ok((dir, verified))
}

fn read_manifest(backup_dir: &Path) -> Option<BackupManifest> {
    let path = backup_dir.join(MANIFEST_FILE);
    let parsed = std::fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|text| serde_json::from_str(&text).map_err(anyhow::Error::from));
    match parsed {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!(path = %path.display(), "Backup manifest unreadable: {:#}", e);
            None
        }
    }
}

/// Vault names from the backup; the fixed mapping when the listing is absent or unreadable
fn read_secret_names(backup_dir: &Path) -> Vec<String> {
    let path = backup_dir.join("azure").join(SECRET_NAMES_FILE);
    let parsed = std::fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|text| {
            serde_json::from_str::<Vec<VaultSecretInfo>>(&text).map_err(anyhow::Error::from)
        });
    match parsed {
        Ok(secrets) => secrets.into_iter().map(|s| s.name).collect(),
        Err(e) => {
            if path.exists() {
                warn!(
                    path = %path.display(),
                    "Secret name listing unreadable, using the known vault names: {:#}", e
                );
            }
            crate::secrets::vault_secret_names()
                .map(str::to_string)
                .collect()
        }
    }
}
