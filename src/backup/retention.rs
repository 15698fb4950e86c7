//! Age-based pruning of backup directories and archives.

use crate::constants::{BACKUP_PREFIX, BACKUP_TIMESTAMP_FORMAT};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What a prune pass removed and kept
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
}

/// Backup name for a timestamp (`vocare-backup-20261016-093000`)
#[must_use]
pub fn backup_name(timestamp: DateTime<Utc>) -> String {
    format!("{BACKUP_PREFIX}{}", timestamp.format(BACKUP_TIMESTAMP_FORMAT))
}

/// Timestamp embedded in a backup directory, archive or checksum name
#[must_use]
pub fn parse_backup_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let rest = file_name.strip_prefix(BACKUP_PREFIX)?;
    let stamp = rest
        .strip_suffix(".tar.gz.sha256")
        .or_else(|| rest.strip_suffix(".tar.gz"))
        .unwrap_or(rest);
    NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Delete backups in `root` older than `retention_days`; age <= R is kept.
///
/// Entries whose names do not carry a backup timestamp are left alone.
pub fn prune(root: &Path, retention_days: u32, now: DateTime<Utc>) -> Result<PruneReport> {
    let mut report = PruneReport::default();
    if !root.exists() {
        return Ok(report);
    }
    let window = Duration::days(i64::from(retention_days));

    let entries =
        std::fs::read_dir(root).with_context(|| format!("Failed to read {}", root.display()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .collect();
    paths.sort();

    for path in paths {
        let Some(timestamp) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_backup_timestamp)
        else {
            continue;
        };

        if now.signed_duration_since(timestamp) <= window {
            report.kept.push(path);
            continue;
        }

        let removal = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match removal {
            Ok(()) => {
                info!(path = %path.display(), "Pruned expired backup");
                report.removed.push(path);
            }
            Err(e) => warn!(path = %path.display(), "Failed to prune backup: {}", e),
        }
    }
    Ok(report)
}
