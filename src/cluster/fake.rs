//! In-memory cluster for unit tests.

use super::{ClusterApi, ObjectKey};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<ObjectKey, Value>,
    unreachable: bool,
    failing_kinds: HashSet<String>,
    failing_lists: HashSet<String>,
    never_ready: bool,
    applied: Vec<ObjectKey>,
    dry_run_applies: u32,
    deleted: Vec<ObjectKey>,
    logs: HashMap<String, String>,
}

/// Cluster fake; applied workloads report ready unless told otherwise
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    fn with_state<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub(crate) fn insert(&self, object: Value) {
        let key = ObjectKey::from_object(&object).expect("fake object needs a key");
        self.with_state(|s| s.objects.insert(key, object));
    }

    pub(crate) fn object(&self, key: &ObjectKey) -> Option<Value> {
        self.with_state(|s| s.objects.get(key).cloned())
    }

    pub(crate) fn contains(&self, kind: &str, name: &str) -> bool {
        self.with_state(|s| s.objects.keys().any(|k| k.kind == kind && k.name == name))
    }

    pub(crate) fn set_unreachable(&self) {
        self.with_state(|s| s.unreachable = true);
    }

    /// Every apply of `kind` fails
    pub(crate) fn fail_apply_of(&self, kind: &str) {
        self.with_state(|s| s.failing_kinds.insert(kind.to_string()));
    }

    pub(crate) fn fail_list_of(&self, kind: &str) {
        self.with_state(|s| s.failing_lists.insert(kind.to_string()));
    }

    pub(crate) fn workloads_never_ready(&self) {
        self.with_state(|s| s.never_ready = true);
    }

    pub(crate) fn applied(&self) -> Vec<ObjectKey> {
        self.with_state(|s| s.applied.clone())
    }

    pub(crate) fn dry_run_applies(&self) -> u32 {
        self.with_state(|s| s.dry_run_applies)
    }

    pub(crate) fn deleted(&self) -> Vec<ObjectKey> {
        self.with_state(|s| s.deleted.clone())
    }

    pub(crate) fn set_logs(&self, pod: &str, text: &str) {
        self.with_state(|s| s.logs.insert(pod.to_string(), text.to_string()));
    }
}

fn with_ready_status(mut object: Value, ready: bool) -> Value {
    let kind = object.get("kind").and_then(Value::as_str).unwrap_or_default();
    if !matches!(kind, "Deployment" | "StatefulSet") {
        return object;
    }
    let replicas = object
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let ready_replicas = if ready { replicas } else { 0 };
    object["status"] = json!({
        "replicas": replicas,
        "readyReplicas": ready_replicas,
        "updatedReplicas": ready_replicas,
        "availableReplicas": ready_replicas,
    });
    object
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn server_version(&self) -> Result<String> {
        self.with_state(|s| {
            if s.unreachable {
                Err(anyhow!("connection refused"))
            } else {
                Ok("v1.30.4".to_string())
            }
        })
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>> {
        Ok(self.object(key))
    }

    async fn apply(&self, object: &Value, dry_run: bool) -> Result<Value> {
        let key = ObjectKey::from_object(object)?;
        self.with_state(|s| {
            if s.failing_kinds.contains(&key.kind) {
                return Err(anyhow!("admission webhook denied {key}"));
            }
            if dry_run {
                s.dry_run_applies += 1;
                return Ok(object.clone());
            }
            let stored = with_ready_status(object.clone(), !s.never_ready);
            s.applied.push(key.clone());
            s.objects.insert(key, stored.clone());
            Ok(stored)
        })
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.with_state(|s| {
            s.objects.remove(key);
            s.deleted.push(key.clone());
        });
        Ok(())
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>> {
        self.with_state(|s| {
            if s.failing_lists.contains(kind) {
                return Err(anyhow!("forbidden: cannot list {kind}"));
            }
            Ok(s.objects
                .iter()
                .filter(|(key, _)| key.api_version == api_version && key.kind == kind)
                .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
                .map(|(_, object)| object.clone())
                .collect())
        })
    }

    async fn pod_logs(&self, _namespace: &str, pod: &str, _tail_lines: i64) -> Result<String> {
        self.with_state(|s| {
            s.logs
                .get(pod)
                .cloned()
                .ok_or_else(|| anyhow!("pod {pod} not found"))
        })
    }
}
