//! Environment profiles and their pre-deploy requirements.

use crate::cluster::{ClusterApi, ObjectKey};
use crate::constants::{PRODUCTION_REQUIRED_SECRETS, SECRET_PROVIDER_CLASS_NAME};
use clap::ValueEnum;
use std::fmt;
use tracing::debug;

pub const SECRET_PROVIDER_CLASS_API_VERSION: &str = "secrets-store.csi.x-k8s.io/v1";

/// Target environment of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }

    /// Production applies atomically and rolls back on failure
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Prod)
    }

    /// Objects that must exist in `namespace` before deploying
    #[must_use]
    pub fn requirements(&self, namespace: &str) -> Vec<Requirement> {
        let provider_class = Requirement::SecretProviderClass {
            namespace: namespace.to_string(),
            name: SECRET_PROVIDER_CLASS_NAME.to_string(),
        };
        match self {
            Environment::Dev => Vec::new(),
            Environment::Staging => vec![provider_class],
            Environment::Prod => PRODUCTION_REQUIRED_SECRETS
                .iter()
                .map(|name| Requirement::Secret {
                    namespace: namespace.to_string(),
                    name: (*name).to_string(),
                })
                .chain(std::iter::once(provider_class))
                .collect(),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cluster object an environment profile depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Secret { namespace: String, name: String },
    SecretProviderClass { namespace: String, name: String },
}

impl Requirement {
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        match self {
            Requirement::Secret { namespace, name } => {
                ObjectKey::new("v1", "Secret", Some(namespace), name)
            }
            Requirement::SecretProviderClass { namespace, name } => ObjectKey::new(
                SECRET_PROVIDER_CLASS_API_VERSION,
                "SecretProviderClass",
                Some(namespace),
                name,
            ),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Secret { namespace, name } => {
                write!(f, "secret {namespace}/{name}")
            }
            Requirement::SecretProviderClass { namespace, name } => {
                write!(f, "SecretProviderClass {namespace}/{name}")
            }
        }
    }
}

/// Unmet requirements of `environment`, one message each
///
/// A lookup error (e.g. the CSI driver CRD is not installed) counts as unmet.
pub async fn unmet_requirements(
    cluster: &dyn ClusterApi,
    environment: Environment,
    namespace: &str,
) -> Vec<String> {
    let mut unmet = Vec::new();
    for requirement in environment.requirements(namespace) {
        match cluster.get(&requirement.key()).await {
            Ok(Some(_)) => debug!(%requirement, "Requirement present"),
            Ok(None) => unmet.push(format!("{requirement} not found")),
            Err(e) => unmet.push(format!("{requirement} could not be checked: {e:#}")),
        }
    }
    unmet
}
