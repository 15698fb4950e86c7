//! # Configuration and Secret Source Tests
//!
//! These tests verify:
//! - The resolved-config record is append-only across runs
//! - Dotenv secret sources keep only mapped keys
//! - Placeholder values are reported as skipped and never written
//! - File-valued secrets are read relative to the env file

mod common;

use common::MemoryVault;
use std::sync::Arc;
use vocare_deployer::config::resolved::keys;
use vocare_deployer::config::ResolvedConfig;
use vocare_deployer::retry::RetryPolicy;
use vocare_deployer::secrets::{read_env_file, SecretSynchronizer, SkipReason, SyncSource};

#[test]
fn test_resolved_record_survives_partial_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".vocare/resolved.env");

    ResolvedConfig::new()
        .with(keys::ACR_LOGIN_SERVER, "vocareacr.azurecr.io")
        .with(keys::KEY_VAULT_URI, "https://vocare-kv.vault.azure.net/")
        .save(&path)
        .unwrap();

    // A later identity-only run knows nothing about the registry
    ResolvedConfig::new()
        .with(keys::CLIENT_ID, "0b6e4c1a-1111-4222-8333-944455556666")
        .with(keys::ACR_LOGIN_SERVER, "")
        .save(&path)
        .unwrap();

    let loaded = ResolvedConfig::load(&path).unwrap();
    assert_eq!(loaded.get(keys::ACR_LOGIN_SERVER), Some("vocareacr.azurecr.io"));
    assert_eq!(
        loaded.get(keys::CLIENT_ID),
        Some("0b6e4c1a-1111-4222-8333-944455556666")
    );
    assert_eq!(loaded.len(), 3);
}

#[test]
fn test_missing_record_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ResolvedConfig::load(&dir.path().join("none.env"))
        .unwrap()
        .is_empty());
}

#[test]
fn test_env_file_keeps_only_mapped_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".env");
    std::fs::write(
        &path,
        "OPENAI_API_KEY=sk-live-123\nDATABASE_URL=postgres://x\n# comment\nSIP_USERNAME=your-sip-username\n",
    )
    .unwrap();

    let values = read_env_file(&path).unwrap();
    let keys: Vec<&str> = values.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["OPENAI_API_KEY", "SIP_USERNAME"]);
}

#[tokio::test]
async fn test_sync_skips_placeholders() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".env");
    std::fs::write(&dir.path().join("firebase.json"), r#"{"type":"service_account"}"#).unwrap();
    std::fs::write(
        &path,
        "OPENAI_API_KEY=sk-live-123\nSIP_USERNAME=your-sip-username\nLIVEKIT_URL=\nFIREBASE_SERVICE_ACCOUNT_PATH=firebase.json\n",
    )
    .unwrap();

    let vault = Arc::new(MemoryVault::default());
    let synchronizer = SecretSynchronizer::new(vault.clone(), RetryPolicy::immediate(1));
    let report = synchronizer
        .sync(&SyncSource::EnvFile(path.clone()))
        .await
        .unwrap();

    assert_eq!(report.written, vec!["openai-api-key", "firebase-service-account"]);
    assert!(report
        .skipped
        .contains(&("sip-username".to_string(), SkipReason::Placeholder)));
    assert!(report
        .skipped
        .contains(&("livekit-url".to_string(), SkipReason::Empty)));
    assert!(report.failed.is_empty());

    let secrets = vault.secrets.lock().unwrap();
    assert!(!secrets.contains_key("sip-username"));
    assert_eq!(
        secrets.get("firebase-service-account").map(String::as_str),
        Some(r#"{"type":"service_account"}"#)
    );
    drop(secrets);

    // Second run writes nothing new
    let again = synchronizer.sync(&SyncSource::EnvFile(path)).await.unwrap();
    assert!(again.written.is_empty());
    assert_eq!(again.unchanged.len(), 2);
}
