//! # Secret Synchronizer
//!
//! Pushes the voice stack's API keys and credentials into Key Vault under the
//! fixed logical names the workloads consume through the SecretProviderClass.
//!
//! ## Sources
//!
//! - A dotenv file (`--env-file .env`)
//! - The process environment
//! - Interactive prompting, one stdin line per key
//!
//! Values that are empty or still hold a template placeholder are never
//! written. Each write is retried independently and a failure only affects its
//! own key. Values live in [`Zeroizing`] buffers and are never logged.

mod placeholder;

pub use placeholder::is_placeholder;

use crate::error::{Component, DeployerError, Result};
use crate::provider::{classify_azure_error, AzureError, VaultStore};
use crate::retry::{retry, RetryPolicy};
use base64::{engine::general_purpose, Engine as _};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Content type recorded for binary file secrets
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream;base64";

/// Source key to vault secret name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretMapping {
    pub source_key: &'static str,
    pub vault_name: &'static str,
    /// The source value is a path; the file content is the secret
    pub file_valued: bool,
}

const fn mapping(source_key: &'static str, vault_name: &'static str) -> SecretMapping {
    SecretMapping {
        source_key,
        vault_name,
        file_valued: false,
    }
}

/// Every secret the voice stack consumes
pub const SECRET_MAPPINGS: &[SecretMapping] = &[
    mapping("OPENAI_API_KEY", "openai-api-key"),
    mapping("DEEPGRAM_API_KEY", "deepgram-api-key"),
    mapping("CARTESIA_API_KEY", "cartesia-api-key"),
    mapping("ELEVENLABS_API_KEY", "elevenlabs-api-key"),
    mapping("LIVEKIT_API_KEY", "livekit-api-key"),
    mapping("LIVEKIT_API_SECRET", "livekit-api-secret"),
    mapping("LIVEKIT_URL", "livekit-url"),
    mapping("SIP_USERNAME", "sip-username"),
    mapping("SIP_PASSWORD", "sip-password"),
    mapping("SIP_TRUNK_URI", "sip-trunk-uri"),
    SecretMapping {
        source_key: "FIREBASE_SERVICE_ACCOUNT_PATH",
        vault_name: "firebase-service-account",
        file_valued: true,
    },
];

/// Vault secret names in mapping order
pub fn vault_secret_names() -> impl Iterator<Item = &'static str> {
    SECRET_MAPPINGS.iter().map(|m| m.vault_name)
}

/// Raw values keyed by source key
pub type SecretValues = BTreeMap<String, Zeroizing<String>>;

/// Where an entry's value comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    EnvVar(String),
    File(PathBuf),
    Prompt,
}

/// One secret to synchronize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretEntry {
    pub logical_name: String,
    pub destination_key: String,
    pub source: SecretSource,
}

/// Where `sync` reads values from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSource {
    EnvFile(PathBuf),
    Environment,
    Interactive,
}

/// Why an entry was not written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Key absent from the source
    Missing,
    Empty,
    Placeholder,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Missing => "not provided",
            SkipReason::Empty => "empty",
            SkipReason::Placeholder => "placeholder value",
        })
    }
}

/// Outcome of a sync, by vault secret name
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub written: Vec<String>,
    /// Already held the same value
    pub unchanged: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    #[must_use]
    pub fn skipped_names(&self) -> Vec<&str> {
        self.skipped.iter().map(|(name, _)| name.as_str()).collect()
    }
}

/// Resolved value ready to write
struct ResolvedSecret {
    value: Zeroizing<String>,
    content_type: Option<&'static str>,
}

enum Resolution {
    Value(ResolvedSecret),
    Skip(SkipReason),
    Fail(String),
}

/// Key Vault secret synchronizer
pub struct SecretSynchronizer {
    store: Arc<dyn VaultStore>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for SecretSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretSynchronizer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SecretSynchronizer {
    pub fn new(store: Arc<dyn VaultStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Read values from `source` and write every usable one
    pub async fn sync(&self, source: &SyncSource) -> Result<SyncReport> {
        let values = match source {
            SyncSource::EnvFile(path) => read_env_file(path)?,
            SyncSource::Environment => read_environment(),
            SyncSource::Interactive => {
                let stdin = std::io::stdin();
                let stdout = std::io::stdout();
                prompt_values(stdin.lock(), stdout.lock()).map_err(|e| {
                    DeployerError::prerequisite(
                        Component::SecretSynchronizer,
                        format!("failed to read secrets from stdin: {e}"),
                    )
                })?
            }
        };
        Ok(self.sync_values(&values, source).await)
    }

    /// Write every mapped value read from `source`
    ///
    /// Relative file paths from an env file resolve against the file's directory.
    pub async fn sync_values(&self, values: &SecretValues, source: &SyncSource) -> SyncReport {
        let mut report = SyncReport::default();

        for (entry, raw) in plan_entries(values, source) {
            let name = entry.destination_key.clone();
            match resolve(&entry, raw) {
                Resolution::Skip(reason) => {
                    debug!("Skipping {} ({})", name, reason);
                    report.skipped.push((name, reason));
                }
                Resolution::Fail(error) => {
                    warn!("Cannot read {}: {}", name, error);
                    report.failed.push((name, error));
                }
                Resolution::Value(secret) => match self.write(&name, &secret).await {
                    Ok(true) => {
                        info!("Wrote secret {}", name);
                        report.written.push(name);
                    }
                    Ok(false) => {
                        debug!("Secret {} unchanged", name);
                        report.unchanged.push(name);
                    }
                    Err(e) => {
                        warn!("Failed to write secret {}: {}", name, e);
                        report.failed.push((name, e.to_string()));
                    }
                },
            }
        }

        info!(
            "Secret sync: {} written, {} unchanged, {} skipped, {} failed",
            report.written.len(),
            report.unchanged.len(),
            report.skipped.len(),
            report.failed.len()
        );
        report
    }

    async fn write(&self, name: &str, secret: &ResolvedSecret) -> anyhow::Result<bool> {
        let store = &self.store;
        let value = secret.value.as_str();
        let content_type = secret.content_type;
        retry(
            &self.policy,
            "secret write",
            is_transient_write_error,
            move || store.create_or_update_secret(name, value, content_type),
        )
        .await
    }
}

/// Only throttling and availability failures are worth another attempt
fn is_transient_write_error(error: &anyhow::Error) -> bool {
    match error.downcast_ref::<AzureError>() {
        Some(azure) => azure.is_transient(),
        None => classify_azure_error(None, &format!("{error:#}")).is_transient(),
    }
}

/// Entries for every mapping, paired with the raw value when the source had one
fn plan_entries<'a>(
    values: &'a SecretValues,
    source: &SyncSource,
) -> Vec<(SecretEntry, Option<&'a str>)> {
    let base_dir = match source {
        SyncSource::EnvFile(path) => path.parent(),
        SyncSource::Environment | SyncSource::Interactive => None,
    };
    SECRET_MAPPINGS
        .iter()
        .map(|m| {
            let raw = values.get(m.source_key).map(|v| v.as_str());
            let source = match raw {
                Some(path) if m.file_valued && !is_placeholder(path) => {
                    let path = PathBuf::from(path.trim());
                    SecretSource::File(match base_dir {
                        Some(dir) if path.is_relative() => dir.join(path),
                        _ => path,
                    })
                }
                _ if *source == SyncSource::Interactive => SecretSource::Prompt,
                _ => SecretSource::EnvVar(m.source_key.to_string()),
            };
            (
                SecretEntry {
                    logical_name: m.source_key.to_string(),
                    destination_key: m.vault_name.to_string(),
                    source,
                },
                raw,
            )
        })
        .collect()
}

fn resolve(entry: &SecretEntry, raw: Option<&str>) -> Resolution {
    let Some(raw) = raw else {
        return Resolution::Skip(SkipReason::Missing);
    };
    if raw.trim().is_empty() {
        return Resolution::Skip(SkipReason::Empty);
    }
    if is_placeholder(raw) {
        return Resolution::Skip(SkipReason::Placeholder);
    }

    match &entry.source {
        SecretSource::File(path) => read_file_secret(path),
        SecretSource::EnvVar(_) | SecretSource::Prompt => Resolution::Value(ResolvedSecret {
            value: Zeroizing::new(raw.to_string()),
            content_type: None,
        }),
    }
}

/// File content byte-for-byte: UTF-8 as-is, anything else base64-encoded
fn read_file_secret(path: &Path) -> Resolution {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => Zeroizing::new(bytes),
        Err(e) => return Resolution::Fail(format!("failed to read {}: {e}", path.display())),
    };
    if bytes.is_empty() {
        return Resolution::Skip(SkipReason::Empty);
    }
    match std::str::from_utf8(&bytes) {
        Ok(text) => Resolution::Value(ResolvedSecret {
            value: Zeroizing::new(text.to_string()),
            content_type: None,
        }),
        Err(_) => Resolution::Value(ResolvedSecret {
            value: Zeroizing::new(general_purpose::STANDARD.encode(&*bytes)),
            content_type: Some(BINARY_CONTENT_TYPE),
        }),
    }
}

/// Mapped keys from a dotenv file; other keys are ignored
pub fn read_env_file(path: &Path) -> Result<SecretValues> {
    let entries = dotenvy::from_path_iter(path).map_err(|e| {
        DeployerError::prerequisite(
            Component::SecretSynchronizer,
            format!("cannot open {}: {e}", path.display()),
        )
    })?;

    let mut values = SecretValues::new();
    for entry in entries {
        let (key, value) = entry.map_err(|e| {
            DeployerError::validation(
                Component::SecretSynchronizer,
                format!("cannot parse {}: {e}", path.display()),
            )
        })?;
        if SECRET_MAPPINGS.iter().any(|m| m.source_key == key) {
            values.insert(key, Zeroizing::new(value));
        }
    }
    Ok(values)
}

/// Mapped keys from the process environment
pub fn read_environment() -> SecretValues {
    SECRET_MAPPINGS
        .iter()
        .filter_map(|m| {
            std::env::var(m.source_key)
                .ok()
                .map(|v| (m.source_key.to_string(), Zeroizing::new(v)))
        })
        .collect()
}

/// Ask for each mapped key on `writer`, one line per answer from `reader`
pub fn prompt_values<R: BufRead, W: Write>(mut reader: R, mut writer: W) -> std::io::Result<SecretValues> {
    let mut values = SecretValues::new();
    for m in SECRET_MAPPINGS {
        let hint = if m.file_valued { " (path to file)" } else { "" };
        write!(writer, "{} -> {}{} [empty to skip]: ", m.source_key, m.vault_name, hint)?;
        writer.flush()?;

        let mut line = Zeroizing::new(String::new());
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let answer = line.trim_end_matches(['\r', '\n']);
        if !answer.is_empty() {
            values.insert(m.source_key.to_string(), Zeroizing::new(answer.to_string()));
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeVault;
    use std::io::Cursor;

    fn values(pairs: &[(&str, &str)]) -> SecretValues {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Zeroizing::new((*v).to_string())))
            .collect()
    }

    fn synchronizer(vault: &Arc<FakeVault>) -> SecretSynchronizer {
        SecretSynchronizer::new(vault.clone(), RetryPolicy::immediate(2))
    }

    #[tokio::test]
    async fn test_placeholder_sip_username_is_skipped() {
        let vault = Arc::new(FakeVault::default());
        let report = synchronizer(&vault)
            .sync_values(
                &values(&[
                    ("SIP_USERNAME", "your-sip-username"),
                    ("OPENAI_API_KEY", "sk-live-abc123"),
                ]),
                &SyncSource::Environment,
            )
            .await;

        assert!(report
            .skipped
            .contains(&("sip-username".to_string(), SkipReason::Placeholder)));
        assert_eq!(report.written, vec!["openai-api-key".to_string()]);
        assert_eq!(vault.names(), vec!["openai-api-key".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_and_empty_keys_are_skipped() {
        let vault = Arc::new(FakeVault::default());
        let report = synchronizer(&vault)
            .sync_values(&values(&[("DEEPGRAM_API_KEY", "  ")]), &SyncSource::Environment)
            .await;

        assert!(report
            .skipped
            .contains(&("deepgram-api-key".to_string(), SkipReason::Empty)));
        assert!(report
            .skipped
            .contains(&("cartesia-api-key".to_string(), SkipReason::Missing)));
        assert!(report.written.is_empty());
        assert!(vault.names().is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_others() {
        let vault = Arc::new(FakeVault::default());
        vault.fail_secret("livekit-api-key");

        let report = synchronizer(&vault)
            .sync_values(
                &values(&[
                    ("LIVEKIT_API_KEY", "APIabc"),
                    ("LIVEKIT_API_SECRET", "s3cr3t-value"),
                    ("LIVEKIT_URL", "wss://livekit.vocare.ai"),
                ]),
                &SyncSource::Environment,
            )
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "livekit-api-key");
        assert_eq!(report.written, vec!["livekit-api-secret", "livekit-url"]);
        // Permission failures are reported on the first attempt
        assert_eq!(vault.attempts("livekit-api-key"), 1);
    }

    #[tokio::test]
    async fn test_throttled_write_is_retried() {
        let vault = Arc::new(FakeVault::default());
        vault.throttle_secret("deepgram-api-key", 1);

        let report = synchronizer(&vault)
            .sync_values(
                &values(&[("DEEPGRAM_API_KEY", "dg-0f9a8b7c")]),
                &SyncSource::Environment,
            )
            .await;

        assert_eq!(report.written, vec!["deepgram-api-key"]);
        assert_eq!(vault.attempts("deepgram-api-key"), 2);
    }

    #[test]
    fn test_write_error_classification() {
        let forbidden = anyhow::anyhow!("Failed to set Azure secret x: HttpResponse(Forbidden, 403)");
        assert!(!is_transient_write_error(&forbidden));
        let invalid = anyhow::Error::from(AzureError::new(
            "keyvault secret set",
            Some("BadParameter".to_string()),
            "The secret name is invalid",
        ));
        assert!(!is_transient_write_error(&invalid));
        let throttled = anyhow::anyhow!("Failed to set Azure secret x: Too Many Requests");
        assert!(is_transient_write_error(&throttled));
    }

    #[tokio::test]
    async fn test_resync_is_a_noop() {
        let vault = Arc::new(FakeVault::default());
        let input = values(&[("OPENAI_API_KEY", "sk-live-abc123")]);
        let synchronizer = synchronizer(&vault);

        synchronizer.sync_values(&input, &SyncSource::Environment).await;
        let second = synchronizer.sync_values(&input, &SyncSource::Environment).await;

        assert!(second.written.is_empty());
        assert_eq!(second.unchanged, vec!["openai-api-key"]);
    }

    #[tokio::test]
    async fn test_file_secrets_are_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("service.json"), r#"{"type":"service_account"}"#).unwrap();
        let vault = Arc::new(FakeVault::default());

        let report = synchronizer(&vault)
            .sync_values(
                &values(&[("FIREBASE_SERVICE_ACCOUNT_PATH", "service.json")]),
                &SyncSource::EnvFile(dir.path().join(".env")),
            )
            .await;

        assert_eq!(report.written, vec!["firebase-service-account"]);
        assert_eq!(
            vault.get("firebase-service-account").as_deref(),
            Some(r#"{"type":"service_account"}"#)
        );
        assert_eq!(vault.content_type("firebase-service-account"), None);
    }

    #[tokio::test]
    async fn test_binary_file_secret_is_base64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.p12");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x01]).unwrap();
        let vault = Arc::new(FakeVault::default());

        synchronizer(&vault)
            .sync_values(
                &values(&[("FIREBASE_SERVICE_ACCOUNT_PATH", path.to_str().unwrap())]),
                &SyncSource::Environment,
            )
            .await;

        assert_eq!(vault.get("firebase-service-account").as_deref(), Some("//4AAQ=="));
        assert_eq!(
            vault.content_type("firebase-service-account").as_deref(),
            Some(BINARY_CONTENT_TYPE)
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_a_failure() {
        let vault = Arc::new(FakeVault::default());
        let report = synchronizer(&vault)
            .sync_values(
                &values(&[("FIREBASE_SERVICE_ACCOUNT_PATH", "/nonexistent/service.json")]),
                &SyncSource::Environment,
            )
            .await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "firebase-service-account");
    }

    #[test]
    fn test_env_file_ignores_unmapped_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "OPENAI_API_KEY=sk-live-1\nOPENAI_MODEL=gpt-4o-mini\nSIP_PASSWORD=\"p@ss word\"\n",
        )
        .unwrap();

        let values = read_env_file(&path).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values.get("SIP_PASSWORD").map(|v| v.as_str()), Some("p@ss word"));
        assert!(!values.contains_key("OPENAI_MODEL"));
    }

    #[test]
    fn test_prompt_reads_one_line_per_key() {
        let input = "sk-live-1\n\nsecret-3\n";
        let mut output = Vec::new();
        let values = prompt_values(Cursor::new(input), &mut output).unwrap();

        assert_eq!(values.get("OPENAI_API_KEY").map(|v| v.as_str()), Some("sk-live-1"));
        assert!(!values.contains_key("DEEPGRAM_API_KEY"));
        assert_eq!(values.get("CARTESIA_API_KEY").map(|v| v.as_str()), Some("secret-3"));
        let prompts = String::from_utf8(output).unwrap();
        assert!(prompts.contains("OPENAI_API_KEY -> openai-api-key"));
        assert!(!prompts.contains("sk-live-1"));
    }

    #[test]
    fn test_mapping_table_is_complete() {
        let names: Vec<&str> = vault_secret_names().collect();
        assert_eq!(names.len(), 11);
        assert!(names.contains(&"firebase-service-account"));
        assert_eq!(SECRET_MAPPINGS.iter().filter(|m| m.file_valued).count(), 1);
    }
}
