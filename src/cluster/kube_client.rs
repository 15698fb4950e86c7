//! `ClusterApi` over the kube client.
//!
//! Kinds are resolved through API discovery once per (apiVersion, kind) so
//! the same calls serve core resources and CRDs.

use super::{ClusterApi, ObjectKey};
use crate::constants::FIELD_MANAGER;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, LogParams, Patch,
    PatchParams,
};
use kube::core::TypeMeta;
use kube::discovery::{pinned_kind, Scope};
use kube::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Kubernetes access via the current kubeconfig context
pub struct KubeCluster {
    client: Client,
    kinds: Mutex<HashMap<String, (ApiResource, bool)>>,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

impl KubeCluster {
    /// Connect using the default kubeconfig / in-cluster configuration
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client (is kubeconfig set?)")?;
        Ok(Self::new(client))
    }

    pub fn new(client: Client) -> Self {
        Self {
            client,
            kinds: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve (ApiResource, namespaced) for a kind, caching the discovery result
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool)> {
        let cache_key = format!("{api_version}/{kind}");
        let cached = self
            .kinds
            .lock()
            .map_err(|_| anyhow!("kind cache poisoned"))?
            .get(&cache_key)
            .cloned();
        if let Some(found) = cached {
            return Ok(found);
        }

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (ar, caps) = pinned_kind(&self.client, &gvk)
            .await
            .with_context(|| format!("Kind {kind} ({api_version}) is not served by the cluster"))?;
        let resolved = (ar, caps.scope == Scope::Namespaced);
        debug!(kind, api_version, namespaced = resolved.1, "Resolved API resource");

        self.kinds
            .lock()
            .map_err(|_| anyhow!("kind cache poisoned"))?
            .insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    async fn api_for(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(api_version, kind).await?;
        let api = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (true, None) | (false, _) => Api::all_with(self.client.clone(), &ar),
        };
        Ok(api)
    }

    async fn api_for_key(&self, key: &ObjectKey) -> Result<Api<DynamicObject>> {
        let (_, namespaced) = self.resolve(&key.api_version, &key.kind).await?;
        if namespaced && key.namespace.is_none() {
            return Err(anyhow!("{key} is namespaced but has no namespace"));
        }
        self.api_for(&key.api_version, &key.kind, key.namespace.as_deref())
            .await
    }
}

fn to_value(mut object: DynamicObject, api_version: &str, kind: &str) -> Result<Value> {
    // List items come back without TypeMeta
    if object.types.is_none() {
        object.types = Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        });
    }
    serde_json::to_value(&object).context("Failed to serialize Kubernetes object")
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn server_version(&self) -> Result<String> {
        let info = self
            .client
            .apiserver_version()
            .await
            .context("Kubernetes API server is unreachable")?;
        Ok(info.git_version)
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>> {
        let api = self.api_for_key(key).await?;
        match api.get(&key.name).await {
            Ok(object) => Ok(Some(to_value(object, &key.api_version, &key.kind)?)),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {key}")),
        }
    }

    async fn apply(&self, object: &Value, dry_run: bool) -> Result<Value> {
        let key = ObjectKey::from_object(object)?;
        let api = self.api_for_key(&key).await?;
        let mut params = PatchParams::apply(FIELD_MANAGER).force();
        params.dry_run = dry_run;
        let applied = api
            .patch(&key.name, &params, &Patch::Apply(object))
            .await
            .with_context(|| format!("Failed to apply {key}"))?;
        to_value(applied, &key.api_version, &key.kind)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let api = self.api_for_key(key).await?;
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {key}")),
        }
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>> {
        let api = self.api_for(api_version, kind, namespace).await?;
        let list = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list {kind}"))?;
        list.items
            .into_iter()
            .map(|object| to_value(object, api_version, kind))
            .collect()
    }

    async fn pod_logs(&self, namespace: &str, pod: &str, tail_lines: i64) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            tail_lines: Some(tail_lines),
            ..LogParams::default()
        };
        pods.logs(pod, &params)
            .await
            .with_context(|| format!("Failed to read logs of pod {namespace}/{pod}"))
    }
}
