//! Workload readiness from Deployment and StatefulSet status.

use crate::cluster::ClusterApi;
use crate::retry::{poll_until, PollError, RetryPolicy};
use anyhow::Result;
use serde_json::Value;
use std::fmt;
use tracing::debug;

const WORKLOAD_KINDS: &[(&str, &str)] = &[("apps/v1", "Deployment"), ("apps/v1", "StatefulSet")];

/// Replica counts of one workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub kind: String,
    pub name: String,
    pub desired: i64,
    /// `status.replicas`, old and new pods together
    pub current: i64,
    pub ready: i64,
    pub updated: i64,
    pub available: i64,
    pub generation: Option<i64>,
    pub observed_generation: Option<i64>,
}

impl WorkloadStatus {
    fn from_object(kind: &str, object: &Value) -> Option<Self> {
        let count = |pointer: &str| object.pointer(pointer).and_then(Value::as_i64);
        let name = object.pointer("/metadata/name")?.as_str()?.to_string();
        let desired = count("/spec/replicas").unwrap_or(1);
        Some(Self {
            kind: kind.to_string(),
            name,
            desired,
            current: count("/status/replicas").unwrap_or(0),
            ready: count("/status/readyReplicas").unwrap_or(0),
            updated: count("/status/updatedReplicas").unwrap_or(0),
            available: count("/status/availableReplicas").unwrap_or(0),
            generation: count("/metadata/generation"),
            observed_generation: count("/status/observedGeneration"),
        })
    }

    /// Why the rollout is not complete yet, following `kubectl rollout status`
    #[must_use]
    pub fn pending_reason(&self) -> Option<String> {
        if let Some(generation) = self.generation {
            let observed = self.observed_generation.unwrap_or(0);
            if observed < generation {
                return Some(format!(
                    "generation {generation} not yet observed (at {observed})"
                ));
            }
        }
        if self.updated < self.desired {
            return Some(format!("{}/{} replicas updated", self.updated, self.desired));
        }
        if self.current > self.updated {
            return Some(format!(
                "{} old replicas pending termination",
                self.current - self.updated
            ));
        }
        if self.available < self.desired {
            return Some(format!("{}/{} replicas available", self.available, self.desired));
        }
        if self.ready < self.desired {
            return Some(format!("{}/{} replicas ready", self.ready, self.desired));
        }
        None
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.pending_reason().is_none()
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}/{} ready", self.kind, self.name, self.ready, self.desired)
    }
}

/// Current status of every Deployment and StatefulSet in `namespace`
pub async fn workload_status(
    cluster: &dyn ClusterApi,
    namespace: &str,
) -> Result<Vec<WorkloadStatus>> {
    let mut statuses = Vec::new();
    for (api_version, kind) in WORKLOAD_KINDS {
        let objects = cluster.list(api_version, kind, Some(namespace)).await?;
        statuses.extend(
            objects
                .iter()
                .filter_map(|object| WorkloadStatus::from_object(kind, object)),
        );
    }
    Ok(statuses)
}

/// Poll until every workload is ready; returns the final statuses
pub async fn wait_ready(
    cluster: &dyn ClusterApi,
    namespace: &str,
    policy: &RetryPolicy,
) -> Result<Vec<WorkloadStatus>, PollError<anyhow::Error>> {
    poll_until(policy, "workloads to become ready", || async {
        let statuses = workload_status(cluster, namespace).await?;
        let pending: Vec<String> = statuses
            .iter()
            .filter_map(|s| s.pending_reason().map(|reason| format!("{s}: {reason}")))
            .collect();
        if pending.is_empty() {
            Ok::<_, anyhow::Error>(Some(statuses))
        } else {
            debug!(pending = ?pending, "Workloads not ready yet");
            Ok(None)
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use serde_json::json;

    fn deployment(name: &str, replicas: i64) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "vocare"},
            "spec": {"replicas": replicas}
        })
    }

    #[test]
    fn test_status_counts() {
        let mut object = deployment("vocare-backend", 2);
        object["status"] = json!({
            "replicas": 2,
            "readyReplicas": 1,
            "updatedReplicas": 2,
            "availableReplicas": 2
        });
        let status = WorkloadStatus::from_object("Deployment", &object).unwrap();
        assert!(!status.is_ready());
        assert_eq!(status.to_string(), "Deployment/vocare-backend 1/2 ready");
        assert_eq!(status.pending_reason().as_deref(), Some("1/2 replicas ready"));
    }

    fn rolled_out(generation: i64, observed: i64) -> Value {
        let mut object = deployment("vocare-backend", 2);
        object["metadata"]["generation"] = json!(generation);
        object["status"] = json!({
            "observedGeneration": observed,
            "replicas": 2,
            "readyReplicas": 2,
            "updatedReplicas": 2,
            "availableReplicas": 2
        });
        object
    }

    #[test]
    fn test_complete_rollout_is_ready() {
        let status = WorkloadStatus::from_object("Deployment", &rolled_out(5, 5)).unwrap();
        assert!(status.is_ready());
    }

    #[test]
    fn test_unobserved_generation_is_not_ready() {
        // Counts still describe the previous rollout
        let status = WorkloadStatus::from_object("Deployment", &rolled_out(5, 4)).unwrap();
        assert!(!status.is_ready());
        assert_eq!(
            status.pending_reason().as_deref(),
            Some("generation 5 not yet observed (at 4)")
        );

        let mut object = rolled_out(5, 5);
        object["status"].as_object_mut().unwrap().remove("observedGeneration");
        let status = WorkloadStatus::from_object("Deployment", &object).unwrap();
        assert!(!status.is_ready());
    }

    #[test]
    fn test_old_replicas_still_running_is_not_ready() {
        let mut object = deployment("vocare-backend", 4);
        object["status"] = json!({
            "replicas": 6,
            "readyReplicas": 4,
            "updatedReplicas": 4,
            "availableReplicas": 4
        });
        let status = WorkloadStatus::from_object("Deployment", &object).unwrap();
        assert!(!status.is_ready());
        assert_eq!(
            status.pending_reason().as_deref(),
            Some("2 old replicas pending termination")
        );
    }

    #[test]
    fn test_partially_updated_is_not_ready() {
        let mut object = deployment("vocare-backend", 4);
        object["status"] = json!({
            "replicas": 4,
            "readyReplicas": 4,
            "updatedReplicas": 2,
            "availableReplicas": 4
        });
        let status = WorkloadStatus::from_object("Deployment", &object).unwrap();
        assert!(!status.is_ready());
        assert_eq!(status.pending_reason().as_deref(), Some("2/4 replicas updated"));
    }

    #[test]
    fn test_unavailable_replicas_are_not_ready() {
        let mut object = deployment("livekit", 2);
        object["status"] = json!({
            "replicas": 2,
            "readyReplicas": 2,
            "updatedReplicas": 2,
            "availableReplicas": 1
        });
        let status = WorkloadStatus::from_object("StatefulSet", &object).unwrap();
        assert_eq!(status.pending_reason().as_deref(), Some("1/2 replicas available"));
    }

    #[tokio::test]
    async fn test_wait_ready_waits_for_new_generation() {
        let cluster = FakeCluster::default();
        cluster.insert(rolled_out(3, 2));

        let result = wait_ready(&cluster, "vocare", &RetryPolicy::immediate(3)).await;
        assert!(matches!(result, Err(PollError::Timeout { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_wait_ready_returns_when_all_ready() {
        let cluster = FakeCluster::default();
        cluster.apply(&deployment("vocare-backend", 2), false).await.unwrap();
        cluster.apply(&deployment("livekit", 1), false).await.unwrap();

        let statuses = wait_ready(&cluster, "vocare", &RetryPolicy::immediate(3))
            .await
            .unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(WorkloadStatus::is_ready));
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let cluster = FakeCluster::default();
        cluster.workloads_never_ready();
        cluster.apply(&deployment("vocare-backend", 1), false).await.unwrap();

        let result = wait_ready(&cluster, "vocare", &RetryPolicy::immediate(4)).await;
        assert!(matches!(result, Err(PollError::Timeout { attempts: 4, .. })));
    }
}
