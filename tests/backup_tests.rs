//! # Backup Integration Tests
//!
//! These tests verify:
//! - Retention keeps exactly the backups aged within the window
//! - Restore re-applies exported objects but never Secrets
//! - Archives with a mismatching checksum are refused before extraction

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{MemoryCluster, NoArchiver};
use std::path::{Path, PathBuf};
use vocare_deployer::backup::{
    backup_name, checksum_path, prune, restore, sha256_file, MANIFEST_FILE,
};

fn write_backup(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(dir.join("kubernetes")).unwrap();
    std::fs::write(
        dir.join("kubernetes/services.yaml"),
        "apiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: Service\n  metadata:\n    name: livekit\n    namespace: vocare\n    resourceVersion: \"812\"\n    uid: 5d1c\n  spec:\n    clusterIP: 10.0.12.4\n    ports:\n    - port: 7880\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("kubernetes/secrets.yaml"),
        "apiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: Secret\n  metadata:\n    name: vocare-secrets\n    namespace: vocare\n  dataKeys: [openai-api-key]\n",
    )
    .unwrap();
    dir
}

#[test]
fn test_retention_window() {
    let root = tempfile::tempdir().unwrap();
    let now = Utc.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap();

    let ages = [0, 3, 7, 8, 30];
    for days in ages {
        let name = backup_name(now - Duration::days(days));
        std::fs::create_dir(root.path().join(&name)).unwrap();
        std::fs::write(root.path().join(format!("{name}.tar.gz")), b"archive").unwrap();
    }

    let report = prune(root.path(), 7, now).unwrap();
    assert_eq!(report.kept.len(), 6);
    assert_eq!(report.removed.len(), 4);

    let remaining: Vec<String> = std::fs::read_dir(root.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(remaining.contains(&backup_name(now - Duration::days(7))));
    assert!(!remaining.contains(&backup_name(now - Duration::days(8))));
}

#[tokio::test]
async fn test_restore_skips_secrets_and_scrubs_server_fields() {
    let root = tempfile::tempdir().unwrap();
    let dir = write_backup(root.path(), "vocare-backup-20261015-020000");
    let cluster = MemoryCluster::default();

    let result = restore(&dir, &cluster, &NoArchiver, false).await.unwrap();
    assert!(result.failed.is_empty());
    assert_eq!(result.skipped_secrets.len(), 1);
    assert_eq!(result.skipped_secrets[0].name, "vocare-secrets");
    assert_eq!(cluster.kinds(), vec!["Service".to_string()]);

    let service = common_service(&cluster).await;
    assert!(service["metadata"].get("resourceVersion").is_none());
    assert!(service["spec"].get("clusterIP").is_none());
    assert_eq!(service["spec"]["ports"][0]["port"], 7880);

    // No manifest: the fixed vault names are listed for re-entry
    assert!(result.manifest.is_none());
    assert!(!result.vault_secrets_to_reenter.is_empty());
}

async fn common_service(cluster: &MemoryCluster) -> serde_json::Value {
    use vocare_deployer::cluster::{ClusterApi, ObjectKey};
    cluster
        .get(&ObjectKey::new("v1", "Service", Some("vocare"), "livekit"))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_restore_dry_run_is_server_side() {
    let root = tempfile::tempdir().unwrap();
    let dir = write_backup(root.path(), "vocare-backup-20261015-020000");
    std::fs::write(dir.join(MANIFEST_FILE), "{ not json").unwrap();
    let cluster = MemoryCluster::default();

    let result = restore(&dir, &cluster, &NoArchiver, true).await.unwrap();
    assert!(result.dry_run);
    assert_eq!(cluster.len(), 0);
    assert_eq!(cluster.dry_runs().len(), 1);
}

#[tokio::test]
async fn test_tampered_archive_is_refused() {
    let root = tempfile::tempdir().unwrap();
    let archive = root.path().join("vocare-backup-20261015-020000.tar.gz");
    std::fs::write(&archive, b"original").unwrap();
    let digest = sha256_file(&archive).unwrap();
    std::fs::write(
        checksum_path(&archive),
        format!("{digest}  vocare-backup-20261015-020000.tar.gz\n"),
    )
    .unwrap();
    std::fs::write(&archive, b"tampered").unwrap();

    let err = restore(&archive, &MemoryCluster::default(), &NoArchiver, true)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("checksum mismatch"));
}
