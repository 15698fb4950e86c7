//! # Error Conditions
//!
//! Every failure the deployer surfaces is tagged with a [`Condition`] and the
//! [`Component`] that hit it. Fatal conditions abort the run as a
//! [`DeployerError`]; recoverable ones are downgraded to a [`Warning`] and
//! aggregated into the final result so the operator sees exactly what needs
//! attention.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Classification of everything that can go wrong during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum Condition {
    /// Required tool, connectivity or file absent
    PrerequisiteMissing,
    /// Policy precondition unmet (fatal unless forced)
    ValidationFailure,
    /// Resource exists or create raced another writer (recovered as success)
    ProvisioningConflict,
    /// Cloud resource could not be created or upgraded
    ProvisioningFailure,
    /// Manifest rejected by the cluster
    ApplyFailure,
    /// Workloads never reported ready
    ReadinessTimeout,
    /// Post-deploy health check failed
    HealthDegraded,
    /// One backup export step failed
    BackupStepFailure,
    /// One secret could not be written
    SecretWriteFailure,
    /// A bounded wait for an asynchronous external transition ran out
    Timeout,
}

impl Condition {
    /// Whether this condition aborts the run when it is not explicitly downgraded
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Condition::ProvisioningConflict
                | Condition::HealthDegraded
                | Condition::BackupStepFailure
                | Condition::SecretWriteFailure
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::PrerequisiteMissing => "PrerequisiteMissing",
            Condition::ValidationFailure => "ValidationFailure",
            Condition::ProvisioningConflict => "ProvisioningConflict",
            Condition::ProvisioningFailure => "ProvisioningFailure",
            Condition::ApplyFailure => "ApplyFailure",
            Condition::ReadinessTimeout => "ReadinessTimeout",
            Condition::HealthDegraded => "HealthDegraded",
            Condition::BackupStepFailure => "BackupStepFailure",
            Condition::SecretWriteFailure => "SecretWriteFailure",
            Condition::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The component acting when a condition was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    ResourceReconciler,
    IdentityFederation,
    SecretSynchronizer,
    DeploymentOrchestrator,
    BackupPipeline,
    Cli,
}

impl Component {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::ResourceReconciler => "resource-reconciler",
            Component::IdentityFederation => "identity-federation",
            Component::SecretSynchronizer => "secret-synchronizer",
            Component::DeploymentOrchestrator => "deployment-orchestrator",
            Component::BackupPipeline => "backup-pipeline",
            Component::Cli => "cli",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal condition raised by a component
#[derive(Debug, Error)]
#[error("{condition} in {component}: {message}")]
pub struct DeployerError {
    pub condition: Condition,
    pub component: Component,
    pub message: String,
}

impl DeployerError {
    pub fn new(condition: Condition, component: Component, message: impl Into<String>) -> Self {
        Self {
            condition,
            component,
            message: message.into(),
        }
    }

    pub fn prerequisite(component: Component, message: impl Into<String>) -> Self {
        Self::new(Condition::PrerequisiteMissing, component, message)
    }

    pub fn validation(component: Component, message: impl Into<String>) -> Self {
        Self::new(Condition::ValidationFailure, component, message)
    }

    /// Downgrade to a warning (used by `--force` and for recoverable conditions)
    #[must_use]
    pub fn into_warning(self) -> Warning {
        Warning {
            condition: self.condition,
            component: self.component,
            message: self.message,
        }
    }
}

/// Result alias for component boundaries
pub type Result<T> = std::result::Result<T, DeployerError>;

/// A recoverable condition aggregated into a run's result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub condition: Condition,
    pub component: Component,
    pub message: String,
}

impl Warning {
    pub fn new(condition: Condition, component: Component, message: impl Into<String>) -> Self {
        Self {
            condition,
            component,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.condition, self.component, self.message)
    }
}
