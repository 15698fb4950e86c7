//! # Manifest Rendering
//!
//! Renders the stack's manifests for one environment and splits them into the
//! ordered [`ManifestGroup`]s the orchestrator applies.
//!
//! - [`HelmRenderer`] - `helm template <release> <chart> --values values-<env>.yaml`
//! - [`DirectoryRenderer`] - concatenation of a raw manifest directory (`k8s/`)

use crate::cluster::{is_cluster_scoped, stamp_labels};
use crate::constants::{DEPLOY_RUN_LABEL, ENVIRONMENT_LABEL};
use crate::deploy::Environment;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error};
use walkdir::WalkDir;

/// Label naming the release that owns an object
pub const RELEASE_LABEL: &str = "app.kubernetes.io/instance";

/// Apply order of manifests; a later group is never applied after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ManifestGroup {
    Namespace,
    SharedConfig,
    SecretProviderBinding,
    Workloads,
}

impl ManifestGroup {
    pub const ORDER: [ManifestGroup; 4] = [
        ManifestGroup::Namespace,
        ManifestGroup::SharedConfig,
        ManifestGroup::SecretProviderBinding,
        ManifestGroup::Workloads,
    ];

    /// Group a kind belongs to
    #[must_use]
    pub fn for_kind(kind: &str) -> Self {
        match kind {
            "Namespace" => ManifestGroup::Namespace,
            "ConfigMap" | "Secret" | "ServiceAccount" | "Role" | "RoleBinding" | "ClusterRole"
            | "ClusterRoleBinding" | "PersistentVolumeClaim" | "NetworkPolicy"
            | "ResourceQuota" | "LimitRange" => ManifestGroup::SharedConfig,
            "SecretProviderClass" => ManifestGroup::SecretProviderBinding,
            _ => ManifestGroup::Workloads,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestGroup::Namespace => "namespace",
            ManifestGroup::SharedConfig => "shared-config",
            ManifestGroup::SecretProviderBinding => "secret-provider-binding",
            ManifestGroup::Workloads => "workloads",
        }
    }
}

impl fmt::Display for ManifestGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Objects of one group, in render order
#[derive(Debug, Clone, PartialEq)]
pub struct GroupBatch {
    pub group: ManifestGroup,
    pub objects: Vec<Value>,
}

/// Everything one deployment applies, grouped and ordered
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestSet {
    pub batches: Vec<GroupBatch>,
}

impl ManifestSet {
    /// Group `objects`, defaulting namespaced objects into `namespace`
    #[must_use]
    pub fn from_objects(objects: Vec<Value>, namespace: &str) -> Self {
        let mut batches: Vec<GroupBatch> = ManifestGroup::ORDER
            .iter()
            .map(|group| GroupBatch {
                group: *group,
                objects: Vec::new(),
            })
            .collect();

        for mut object in objects {
            let kind = object
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if !is_cluster_scoped(&kind) && object.pointer("/metadata/namespace").is_none() {
                if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
                    metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
                }
            }
            let group = ManifestGroup::for_kind(&kind);
            if let Some(batch) = batches.iter_mut().find(|b| b.group == group) {
                batch.objects.push(object);
            }
        }

        batches.retain(|batch| !batch.objects.is_empty());
        Self { batches }
    }

    /// Stamp release, environment and run labels on every object
    pub fn stamp(&mut self, release: &str, environment: Environment, run_id: &str) {
        let labels = [
            (RELEASE_LABEL, release),
            (ENVIRONMENT_LABEL, environment.as_str()),
            (DEPLOY_RUN_LABEL, run_id),
        ];
        for object in self.batches.iter_mut().flat_map(|b| b.objects.iter_mut()) {
            stamp_labels(object, &labels);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.iter().map(|b| b.objects.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn groups(&self) -> Vec<ManifestGroup> {
        self.batches.iter().map(|b| b.group).collect()
    }
}

/// Parse a multi-document YAML stream; `List` kinds are flattened
pub fn parse_documents(yaml: &str) -> Result<Vec<Value>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = Value::deserialize(document).context("Failed to parse manifest YAML")?;
        if value.is_null() {
            continue;
        }
        if value.get("kind").and_then(Value::as_str) == Some("List") {
            if let Some(items) = value.get("items").and_then(Value::as_array) {
                objects.extend(items.iter().cloned());
            }
            continue;
        }
        if value.get("kind").is_none() {
            return Err(anyhow!("Manifest document without a kind: {value}"));
        }
        objects.push(value);
    }
    Ok(objects)
}

/// What to render for one run
#[derive(Debug, Clone)]
pub struct DeploymentUnit {
    pub environment: Environment,
    pub namespace: String,
    pub release_name: String,
    pub values_file: PathBuf,
    pub manifest_set: ManifestSet,
}

impl DeploymentUnit {
    pub fn new(
        environment: Environment,
        namespace: &str,
        release_name: &str,
        values_file: PathBuf,
    ) -> Self {
        Self {
            environment,
            namespace: namespace.to_string(),
            release_name: release_name.to_string(),
            values_file,
            manifest_set: ManifestSet::default(),
        }
    }
}

/// Produces the YAML stream for a deployment unit
#[async_trait]
pub trait ManifestRenderer: Send + Sync {
    async fn render(&self, unit: &DeploymentUnit) -> Result<String>;
}

/// Renders a Helm chart without installing it
#[derive(Debug, Clone)]
pub struct HelmRenderer {
    binary: PathBuf,
    chart: PathBuf,
}

impl HelmRenderer {
    /// Locate `helm` on PATH
    pub fn discover(chart: &Path) -> Result<Self> {
        let binary = which::which("helm").context("helm not found on PATH")?;
        Ok(Self {
            binary,
            chart: chart.to_path_buf(),
        })
    }
}

#[async_trait]
impl ManifestRenderer for HelmRenderer {
    async fn render(&self, unit: &DeploymentUnit) -> Result<String> {
        debug!(
            chart = %self.chart.display(),
            values = %unit.values_file.display(),
            "Rendering Helm chart"
        );
        let output = Command::new(&self.binary)
            .arg("template")
            .arg(&unit.release_name)
            .arg(&self.chart)
            .args(["--namespace", &unit.namespace])
            .arg("--values")
            .arg(&unit.values_file)
            .output()
            .await
            .context("Failed to execute helm")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("helm template failed: {}", stderr);
            return Err(anyhow!("helm template failed: {stderr}"));
        }
        String::from_utf8(output.stdout).context("helm produced non UTF-8 output")
    }
}

/// Concatenates every `*.yaml` / `*.yml` under a directory, sorted by path
#[derive(Debug, Clone)]
pub struct DirectoryRenderer {
    dir: PathBuf,
}

impl DirectoryRenderer {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl ManifestRenderer for DirectoryRenderer {
    async fn render(&self, _unit: &DeploymentUnit) -> Result<String> {
        if !self.dir.is_dir() {
            return Err(anyhow!(
                "Manifest directory {} does not exist",
                self.dir.display()
            ));
        }
        let mut files: Vec<PathBuf> = WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml")
                )
            })
            .collect();
        files.sort();

        let mut documents = Vec::with_capacity(files.len());
        for file in files {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            documents.push(text);
        }
        Ok(documents.join("\n---\n"))
    }
}
