//! Shared in-memory doubles for integration tests.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use vocare_deployer::backup::Archiver;
use vocare_deployer::cluster::{ClusterApi, ObjectKey};
use vocare_deployer::deploy::{DeploymentUnit, ForwardGuard, ManifestRenderer, PortForwarder};
use vocare_deployer::provider::VaultStore;

/// Cluster held in a map; workloads report every replica ready
#[derive(Default)]
pub struct MemoryCluster {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    dry_runs: Mutex<Vec<ObjectKey>>,
}

impl MemoryCluster {
    pub fn insert(&self, object: Value) {
        let key = ObjectKey::from_object(&object).unwrap();
        self.objects.lock().unwrap().insert(key, object);
    }

    pub fn kinds(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .map(|k| k.kind.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn dry_runs(&self) -> Vec<ObjectKey> {
        self.dry_runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn server_version(&self) -> Result<String> {
        Ok("v1.30.4".to_string())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn apply(&self, object: &Value, dry_run: bool) -> Result<Value> {
        let key = ObjectKey::from_object(object)?;
        if dry_run {
            self.dry_runs.lock().unwrap().push(key);
            return Ok(object.clone());
        }
        let mut stored = object.clone();
        if matches!(key.kind.as_str(), "Deployment" | "StatefulSet") {
            let replicas = stored.pointer("/spec/replicas").and_then(Value::as_i64).unwrap_or(1);
            stored["status"] = json!({
                "replicas": replicas,
                "readyReplicas": replicas,
                "updatedReplicas": replicas,
                "availableReplicas": replicas
            });
        }
        self.objects.lock().unwrap().insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Vec<Value>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.api_version == api_version && k.kind == kind)
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn pod_logs(&self, _namespace: &str, pod: &str, _tail_lines: i64) -> Result<String> {
        Ok(format!("{pod} started\n"))
    }
}

/// Renders a fixed YAML stream
pub struct StaticRenderer(pub &'static str);

#[async_trait]
impl ManifestRenderer for StaticRenderer {
    async fn render(&self, _unit: &DeploymentUnit) -> Result<String> {
        Ok(self.0.to_string())
    }
}

/// Port-forwarding that always fails, leaving a deploy `Degraded`
pub struct RefusingForwarder;

#[async_trait]
impl PortForwarder for RefusingForwarder {
    async fn forward(&self, _namespace: &str, service: &str, _remote_port: u16) -> Result<ForwardGuard> {
        Err(anyhow!("service {service} has no endpoints"))
    }
}

/// Archiver that never runs tar
pub struct NoArchiver;

#[async_trait]
impl Archiver for NoArchiver {
    async fn archive(&self, _dir: &Path, _archive: &Path) -> Result<()> {
        Err(anyhow!("tar unavailable"))
    }

    async fn extract(&self, _archive: &Path, _dest: &Path) -> Result<()> {
        Err(anyhow!("tar unavailable"))
    }
}

/// Key Vault in a map
#[derive(Default)]
pub struct MemoryVault {
    pub secrets: Mutex<BTreeMap<String, String>>,
}

#[async_trait]
impl VaultStore for MemoryVault {
    async fn create_or_update_secret(
        &self,
        secret_name: &str,
        secret_value: &str,
        _content_type: Option<&str>,
    ) -> Result<bool> {
        let mut secrets = self.secrets.lock().unwrap();
        if secrets.get(secret_name).map(String::as_str) == Some(secret_value) {
            return Ok(false);
        }
        secrets.insert(secret_name.to_string(), secret_value.to_string());
        Ok(true)
    }
}
