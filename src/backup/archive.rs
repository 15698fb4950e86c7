//! Archive creation/extraction and checksums.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error};

/// Packs a backup directory into a single compressed file
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Pack `dir` (kept as the top-level entry) into `archive`
    async fn archive(&self, dir: &Path, archive: &Path) -> Result<()>;

    /// Unpack `archive` into `dest`
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// `tar -czf` / `tar -xzf`
#[derive(Debug, Clone)]
pub struct TarArchiver {
    binary: PathBuf,
}

impl TarArchiver {
    pub fn discover() -> Result<Self> {
        let binary = which::which("tar").context("tar not found on PATH")?;
        Ok(Self { binary })
    }

    async fn run(&self, args: &[&std::ffi::OsStr]) -> Result<()> {
        debug!("tar {:?}", args);
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .context("Failed to execute tar")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("tar failed: {}", stderr);
            return Err(anyhow!("tar failed: {stderr}"));
        }
        Ok(())
    }
}

#[async_trait]
impl Archiver for TarArchiver {
    async fn archive(&self, dir: &Path, archive: &Path) -> Result<()> {
        let parent = dir
            .parent()
            .ok_or_else(|| anyhow!("{} has no parent directory", dir.display()))?;
        let name = dir
            .file_name()
            .ok_or_else(|| anyhow!("{} has no directory name", dir.display()))?;
        self.run(&[
            "-czf".as_ref(),
            archive.as_os_str(),
            "-C".as_ref(),
            parent.as_os_str(),
            name,
        ])
        .await
    }

    async fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        self.run(&[
            "-xzf".as_ref(),
            archive.as_os_str(),
            "-C".as_ref(),
            dest.as_os_str(),
        ])
        .await
    }
}

/// Hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// `<archive>.sha256` next to the archive
#[must_use]
pub fn checksum_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Write `<hex>  <file name>` in `sha256sum` format; returns the checksum file
pub fn write_checksum(archive: &Path) -> Result<PathBuf> {
    let digest = sha256_file(archive)?;
    let file_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let path = checksum_path(archive);
    std::fs::write(&path, format!("{digest}  {file_name}\n"))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Compare an archive against its checksum file, when one exists
pub fn verify_checksum(archive: &Path) -> Result<bool> {
    let path = checksum_path(archive);
    if !path.exists() {
        return Ok(false);
    }
    let recorded = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let expected = recorded.split_whitespace().next().unwrap_or_default();
    let actual = sha256_file(archive)?;
    if expected != actual {
        return Err(anyhow!(
            "checksum mismatch for {}: expected {expected}, found {actual}",
            archive.display()
        ));
    }
    Ok(true)
}
