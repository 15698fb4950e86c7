//! Object identity and field scrubbing.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fmt;

/// Kinds that never carry a namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PersistentVolume",
    "PriorityClass",
    "IngressClass",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
];

/// Metadata the API server owns
const SERVER_METADATA_FIELDS: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "generation",
    "managedFields",
    "selfLink",
];

const SERVER_ANNOTATIONS: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
    "meta.helm.sh/release-name",
    "meta.helm.sh/release-namespace",
];

#[must_use]
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Identity of a Kubernetes object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Read the key from an object's `apiVersion`, `kind` and `metadata`
    pub fn from_object(object: &Value) -> Result<Self> {
        let text = |pointer: &str| object.pointer(pointer).and_then(Value::as_str);
        let api_version = text("/apiVersion").context("object has no apiVersion")?;
        let kind = text("/kind").context("object has no kind")?;
        let name = text("/metadata/name")
            .with_context(|| format!("{kind} object has no metadata.name"))?;
        Ok(Self::new(api_version, kind, text("/metadata/namespace"), name))
    }

    /// Split `apiVersion` into (group, version); the core group is ""
    #[must_use]
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}/{}", self.kind, namespace, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Copy of `object` without server-managed fields, ready to be re-applied
#[must_use]
pub fn sanitize_for_apply(object: &Value) -> Value {
    let mut object = object.clone();
    let Some(root) = object.as_object_mut() else {
        return object;
    };
    root.remove("status");

    if let Some(metadata) = root.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in SERVER_METADATA_FIELDS {
            metadata.remove(*field);
        }
        let drop_annotations = match metadata.get_mut("annotations").and_then(Value::as_object_mut) {
            Some(annotations) => {
                for annotation in SERVER_ANNOTATIONS {
                    annotations.remove(*annotation);
                }
                annotations.is_empty()
            }
            None => false,
        };
        if drop_annotations {
            metadata.remove("annotations");
        }
    }

    if root.get("kind").and_then(Value::as_str) == Some("Service") {
        if let Some(spec) = root.get_mut("spec").and_then(Value::as_object_mut) {
            // Allocated by the cluster; immutable on re-apply elsewhere
            spec.remove("clusterIP");
            spec.remove("clusterIPs");
        }
    }
    object
}

/// Secret reduced to metadata and key names; values never leave the cluster
#[must_use]
pub fn redact_secret(secret: &Value) -> Value {
    let mut redacted = sanitize_for_apply(secret);
    let mut key_names: Vec<String> = ["data", "stringData"]
        .iter()
        .filter_map(|field| secret.get(*field).and_then(Value::as_object))
        .flat_map(|map| map.keys().cloned())
        .collect();
    key_names.sort();
    key_names.dedup();

    if let Some(root) = redacted.as_object_mut() {
        root.remove("data");
        root.remove("stringData");
        root.insert(
            "dataKeys".to_string(),
            Value::Array(key_names.into_iter().map(Value::String).collect()),
        );
    }
    redacted
}

/// Merge `labels` into an object's metadata
pub fn stamp_labels(object: &mut Value, labels: &[(&str, &str)]) {
    let Some(root) = object.as_object_mut() else {
        return;
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(metadata) = metadata.as_object_mut() else {
        return;
    };
    let existing = metadata
        .entry("labels")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(existing) = existing.as_object_mut() {
        for (key, value) in labels {
            existing.insert((*key).to_string(), Value::String((*value).to_string()));
        }
    }
}
