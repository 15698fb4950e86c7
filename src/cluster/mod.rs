//! # Cluster Access
//!
//! [`ClusterApi`] is the seam between the orchestrator/backup pipeline and the
//! Kubernetes API. Objects travel as `serde_json::Value` so one code path
//! handles built-in kinds and CRDs (SecretProviderClass) alike.
//!
//! - [`KubeCluster`] - production implementation over `kube` (server-side apply)
//! - [`ObjectKey`] - identity of an object (apiVersion, kind, namespace, name)
//! - [`sanitize_for_apply`] - strips server-managed fields so a captured object
//!   can be re-applied

mod kube_client;
mod object;

pub use kube_client::KubeCluster;
pub use object::{is_cluster_scoped, redact_secret, sanitize_for_apply, stamp_labels, ObjectKey};

#[cfg(test)]
pub(crate) mod fake;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Kubernetes operations used by deploy, status and backup
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// API server version; fails when the control plane is unreachable
    async fn server_version(&self) -> Result<String>;

    /// Current object, `None` when absent
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>>;

    /// Server-side apply; with `dry_run` the server validates without persisting
    async fn apply(&self, object: &Value, dry_run: bool) -> Result<Value>;

    /// Delete an object; absent objects are not an error
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// All objects of a kind, in one namespace or cluster-wide
    async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>)
        -> Result<Vec<Value>>;

    /// Last `tail_lines` of a pod's log
    async fn pod_logs(&self, namespace: &str, pod: &str, tail_lines: i64) -> Result<String>;
}
