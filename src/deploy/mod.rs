//! # Deployment Orchestrator
//!
//! Drives one rollout of the stack to an environment:
//!
//! ```text
//! Validating -> Applying -> WaitingReady -> HealthChecking -> Succeeded
//!                  |             |                |
//!                  |             |                +--> Degraded (warning, no rollback)
//!                  +-------------+--> RolledBack (prod) | Failed (dev/staging)
//! ```
//!
//! Manifests are applied group by group (namespace, shared config, secret
//! provider binding, workloads) with server-side apply. Production records the
//! prior state of every object it touches and restores it when a group fails
//! to apply or the workloads never become ready.

pub mod health;
pub mod manifests;
pub mod policy;
pub mod readiness;

pub use health::{ForwardGuard, KubectlPortForwarder, PortForwarder};
pub use manifests::{
    DeploymentUnit, DirectoryRenderer, HelmRenderer, ManifestGroup, ManifestRenderer, ManifestSet,
};
pub use policy::Environment;
pub use readiness::WorkloadStatus;

use crate::cluster::{sanitize_for_apply, ClusterApi, ObjectKey};
use crate::config::DeployerConfig;
use crate::constants::{DEPLOY_RUN_LABEL, ENVIRONMENT_LABEL};
use crate::error::{Component, Condition, DeployerError, Result, Warning};
use crate::retry::{PollError, RetryPolicy};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Flags of one `deploy` invocation
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Validate and render only; nothing is applied
    pub dry_run: bool,
    /// Downgrade environment policy failures to warnings
    pub force: bool,
    /// Skip environment policy checks (connectivity and values file are still checked)
    pub skip_validation: bool,
    /// Maximum wait for workload readiness
    pub timeout: Duration,
}

/// States of a rollout; the last six are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Validating,
    Applying,
    WaitingReady,
    HealthChecking,
    Succeeded,
    RolledBack,
    Degraded,
    Failed,
    DryRunComplete,
    /// Operator interrupt during the health check; workloads were ready
    Interrupted,
}

impl DeployPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployPhase::Validating => "Validating",
            DeployPhase::Applying => "Applying",
            DeployPhase::WaitingReady => "WaitingReady",
            DeployPhase::HealthChecking => "HealthChecking",
            DeployPhase::Succeeded => "Succeeded",
            DeployPhase::RolledBack => "RolledBack",
            DeployPhase::Degraded => "Degraded",
            DeployPhase::Failed => "Failed",
            DeployPhase::DryRunComplete => "DryRunComplete",
            DeployPhase::Interrupted => "Interrupted",
        }
    }
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a rollout that got past validation
#[derive(Debug)]
pub struct DeploymentResult {
    pub run_id: String,
    pub environment: Environment,
    pub phase: DeployPhase,
    /// Objects applied (or, for a dry run, that would be applied)
    pub applied: Vec<ObjectKey>,
    /// Objects restored or deleted by a rollback
    pub rolled_back: Vec<ObjectKey>,
    pub workloads: Vec<WorkloadStatus>,
    pub warnings: Vec<Warning>,
    /// The failure that ended a `Failed` or `RolledBack` run
    pub failure: Option<DeployerError>,
}

impl DeploymentResult {
    fn new(run_id: &str, environment: Environment) -> Self {
        Self {
            run_id: run_id.to_string(),
            environment,
            phase: DeployPhase::Validating,
            applied: Vec::new(),
            rolled_back: Vec::new(),
            workloads: Vec::new(),
            warnings: Vec::new(),
            failure: None,
        }
    }

    /// Process exit code: success, dry run and degraded exit 0; an interrupt exits 130
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.phase {
            DeployPhase::Succeeded | DeployPhase::DryRunComplete | DeployPhase::Degraded => 0,
            DeployPhase::Interrupted => 130,
            _ => 1,
        }
    }
}

/// Cluster state shown by `vocarectl status`
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub environment: Environment,
    pub server_version: String,
    pub workloads: Vec<WorkloadStatus>,
    /// Run id found on the workloads, when labelled for this environment
    pub last_run: Option<String>,
}

/// Settings the orchestrator takes from [`DeployerConfig`]
#[derive(Debug, Clone)]
struct OrchestratorSettings {
    namespace: String,
    release_name: String,
    values_dir: PathBuf,
    readiness_poll_interval: Duration,
    health_service: String,
    health_port: u16,
    health_path: String,
}

/// Prior state of one touched object
struct Snapshot {
    key: ObjectKey,
    prior: Option<Value>,
}

pub struct Orchestrator {
    cluster: Arc<dyn ClusterApi>,
    renderer: Arc<dyn ManifestRenderer>,
    forwarder: Arc<dyn PortForwarder>,
    settings: OrchestratorSettings,
    extra_objects: Vec<Value>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        config: &DeployerConfig,
        cluster: Arc<dyn ClusterApi>,
        renderer: Arc<dyn ManifestRenderer>,
        forwarder: Arc<dyn PortForwarder>,
    ) -> Self {
        Self {
            cluster,
            renderer,
            forwarder,
            settings: OrchestratorSettings {
                namespace: config.namespace.clone(),
                release_name: config.release_name.clone(),
                values_dir: config.values_dir.clone(),
                readiness_poll_interval: config.readiness_poll_interval(),
                health_service: config.health_service.clone(),
                health_port: config.health_port,
                health_path: config.health_path.clone(),
            },
            extra_objects: Vec::new(),
        }
    }

    /// Objects applied alongside the rendered manifests (e.g. the workload
    /// identity ServiceAccount)
    #[must_use]
    pub fn with_extra_objects(mut self, objects: Vec<Value>) -> Self {
        self.extra_objects = objects;
        self
    }

    fn values_file(&self, environment: Environment) -> PathBuf {
        self.settings
            .values_dir
            .join(format!("values-{}.yaml", environment.as_str()))
    }

    /// Run one rollout
    ///
    /// Validation failures are returned as errors. Apply, readiness and health
    /// failures end in a terminal [`DeployPhase`] of the returned result.
    pub async fn deploy(
        &self,
        environment: Environment,
        options: &DeployOptions,
    ) -> Result<DeploymentResult> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "deploy",
            environment = environment.as_str(),
            run_id = %run_id,
            dry_run = options.dry_run
        );
        self.run(environment, options, &run_id).instrument(span).await
    }

    async fn run(
        &self,
        environment: Environment,
        options: &DeployOptions,
        run_id: &str,
    ) -> Result<DeploymentResult> {
        let mut result = DeploymentResult::new(run_id, environment);

        info!(phase = %DeployPhase::Validating, "Validating deployment prerequisites");
        result.warnings = self.validate(environment, options).await?;

        let mut unit = DeploymentUnit::new(
            environment,
            &self.settings.namespace,
            &self.settings.release_name,
            self.values_file(environment),
        );
        unit.manifest_set = self.render(&unit, run_id).await?;
        info!(
            objects = unit.manifest_set.len(),
            groups = ?unit.manifest_set.groups(),
            "Rendered manifests"
        );

        if options.dry_run {
            result.applied = unit
                .manifest_set
                .batches
                .iter()
                .flat_map(|batch| batch.objects.iter())
                .filter_map(|object| ObjectKey::from_object(object).ok())
                .collect();
            result.phase = DeployPhase::DryRunComplete;
            info!("Dry run complete, nothing applied");
            return Ok(result);
        }

        result.phase = DeployPhase::Applying;
        let mut snapshots = Vec::new();
        if let Err(failure) = self
            .apply_groups(&unit, &mut snapshots, &mut result.applied)
            .await
        {
            return Ok(self.fail(result, failure, &snapshots).await);
        }

        result.phase = DeployPhase::WaitingReady;
        let policy =
            RetryPolicy::within(options.timeout, self.settings.readiness_poll_interval);
        match readiness::wait_ready(self.cluster.as_ref(), &self.settings.namespace, &policy)
            .await
        {
            Ok(workloads) => result.workloads = workloads,
            Err(e) => {
                let failure = readiness_failure(e, options.timeout);
                return Ok(self.fail(result, failure, &snapshots).await);
            }
        }

        result.phase = DeployPhase::HealthChecking;
        match health_or_interrupt(self.health_check(), interrupted()).await {
            HealthVerdict::Healthy => {
                result.phase = DeployPhase::Succeeded;
                info!("Deployment succeeded");
            }
            HealthVerdict::Interrupted => {
                warn!("Interrupted during the health check; backend health not verified");
                result.warnings.push(Warning::new(
                    Condition::HealthDegraded,
                    Component::DeploymentOrchestrator,
                    "health check interrupted by the operator; backend health not verified",
                ));
                result.phase = DeployPhase::Interrupted;
            }
            HealthVerdict::Unhealthy(reason) => {
                warn!(reason = %reason, "Deployment degraded");
                result.warnings.push(Warning::new(
                    Condition::HealthDegraded,
                    Component::DeploymentOrchestrator,
                    reason,
                ));
                result.phase = DeployPhase::Degraded;
            }
        }
        Ok(result)
    }

    /// Connectivity, values file, then environment policy
    async fn validate(
        &self,
        environment: Environment,
        options: &DeployOptions,
    ) -> Result<Vec<Warning>> {
        let version = self.cluster.server_version().await.map_err(|e| {
            DeployerError::prerequisite(
                Component::DeploymentOrchestrator,
                format!("cannot reach the Kubernetes API: {e:#}"),
            )
        })?;
        debug!(version = %version, "Kubernetes API reachable");

        let values_file = self.values_file(environment);
        if !values_file.is_file() {
            return Err(DeployerError::prerequisite(
                Component::DeploymentOrchestrator,
                format!("values file {} not found", values_file.display()),
            ));
        }

        if options.skip_validation {
            warn!("Skipping {} policy checks", environment);
            return Ok(Vec::new());
        }

        let unmet = policy::unmet_requirements(
            self.cluster.as_ref(),
            environment,
            &self.settings.namespace,
        )
        .await;
        if unmet.is_empty() {
            return Ok(Vec::new());
        }

        let errors: Vec<DeployerError> = unmet
            .into_iter()
            .map(|message| DeployerError::validation(Component::DeploymentOrchestrator, message))
            .collect();
        if options.force {
            for e in &errors {
                warn!("Forced past failed check: {}", e.message);
            }
            return Ok(errors.into_iter().map(DeployerError::into_warning).collect());
        }

        let message = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Err(DeployerError::validation(
            Component::DeploymentOrchestrator,
            format!("{environment} requirements unmet: {message} (use --force to override)"),
        ))
    }

    async fn render(&self, unit: &DeploymentUnit, run_id: &str) -> Result<ManifestSet> {
        let yaml = self.renderer.render(unit).await.map_err(|e| {
            DeployerError::validation(
                Component::DeploymentOrchestrator,
                format!("failed to render manifests: {e:#}"),
            )
        })?;
        let mut objects = manifests::parse_documents(&yaml).map_err(|e| {
            DeployerError::validation(Component::DeploymentOrchestrator, format!("{e:#}"))
        })?;
        objects.extend(self.extra_objects.iter().cloned());

        let mut set = ManifestSet::from_objects(objects, &unit.namespace);
        set.stamp(&unit.release_name, unit.environment, run_id);
        Ok(set)
    }

    /// Apply groups in order; the first failure stops everything after it
    async fn apply_groups(
        &self,
        unit: &DeploymentUnit,
        snapshots: &mut Vec<Snapshot>,
        applied: &mut Vec<ObjectKey>,
    ) -> std::result::Result<(), DeployerError> {
        let production = unit.environment.is_production();
        for batch in &unit.manifest_set.batches {
            info!(group = %batch.group, objects = batch.objects.len(), "Applying group");
            for object in &batch.objects {
                let key = ObjectKey::from_object(object).map_err(|e| {
                    DeployerError::new(
                        Condition::ApplyFailure,
                        Component::DeploymentOrchestrator,
                        format!("{e:#}"),
                    )
                })?;

                if production {
                    let prior = self.cluster.get(&key).await.map_err(|e| {
                        apply_failure(batch.group, &key, &format!("cannot snapshot: {e:#}"))
                    })?;
                    snapshots.push(Snapshot {
                        key: key.clone(),
                        prior,
                    });
                }

                match self.cluster.apply(object, false).await {
                    Ok(_) => {
                        if production {
                            debug!(object = %key, "Applied");
                        } else {
                            info!(object = %key, group = %batch.group, "Applied");
                        }
                        applied.push(key);
                    }
                    Err(e) => {
                        if !production {
                            error!(
                                object = %key,
                                group = %batch.group,
                                manifest = %object,
                                "Apply rejected: {:#}",
                                e
                            );
                        }
                        return Err(apply_failure(batch.group, &key, &format!("{e:#}")));
                    }
                }
            }
        }
        Ok(())
    }

    /// End a run after an apply or readiness failure; production rolls back
    async fn fail(
        &self,
        mut result: DeploymentResult,
        failure: DeployerError,
        snapshots: &[Snapshot],
    ) -> DeploymentResult {
        error!(phase = %result.phase, "{}", failure);
        if result.environment.is_production() {
            let (restored, warnings) = self.rollback(snapshots).await;
            result.rolled_back = restored;
            result.warnings.extend(warnings);
            result.phase = DeployPhase::RolledBack;
        } else {
            result.phase = DeployPhase::Failed;
        }
        result.failure = Some(failure);
        result
    }

    /// Restore snapshots in reverse apply order
    async fn rollback(&self, snapshots: &[Snapshot]) -> (Vec<ObjectKey>, Vec<Warning>) {
        warn!(objects = snapshots.len(), "Rolling back to pre-run state");
        let mut restored = Vec::new();
        let mut warnings = Vec::new();
        for snapshot in snapshots.iter().rev() {
            let outcome = match &snapshot.prior {
                None => self.cluster.delete(&snapshot.key).await,
                Some(prior) => self
                    .cluster
                    .apply(&sanitize_for_apply(prior), false)
                    .await
                    .map(|_| ()),
            };
            match outcome {
                Ok(()) => {
                    info!(object = %snapshot.key, "Rolled back");
                    restored.push(snapshot.key.clone());
                }
                Err(e) => {
                    error!(object = %snapshot.key, "Rollback failed: {:#}", e);
                    warnings.push(Warning::new(
                        Condition::ApplyFailure,
                        Component::DeploymentOrchestrator,
                        format!("could not roll back {}: {e:#}", snapshot.key),
                    ));
                }
            }
        }
        (restored, warnings)
    }

    /// Port-forward to the backend and check its health; the forward ends with this future
    async fn health_check(&self) -> std::result::Result<(), String> {
        let settings = &self.settings;
        let guard = self
            .forwarder
            .forward(&settings.namespace, &settings.health_service, settings.health_port)
            .await
            .map_err(|e| format!("port-forward to svc/{} failed: {e:#}", settings.health_service))?;
        let url = format!(
            "http://127.0.0.1:{}{}",
            guard.local_port(),
            settings.health_path
        );
        info!(url = %url, "Probing backend health");
        health::check_health(&url).await
    }

    /// Workload readiness in the deployment namespace
    pub async fn status(&self, environment: Environment) -> anyhow::Result<StatusReport> {
        let server_version = self.cluster.server_version().await?;
        let namespace = &self.settings.namespace;
        let workloads = readiness::workload_status(self.cluster.as_ref(), namespace).await?;

        let deployments = self.cluster.list("apps/v1", "Deployment", Some(namespace)).await?;
        let last_run = deployments.iter().find_map(|object| {
            let labels = object.pointer("/metadata/labels")?;
            let labelled_env = labels.get(ENVIRONMENT_LABEL).and_then(Value::as_str)?;
            if labelled_env != environment.as_str() {
                return None;
            }
            labels
                .get(DEPLOY_RUN_LABEL)
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        Ok(StatusReport {
            environment,
            server_version,
            workloads,
            last_run,
        })
    }
}

fn apply_failure(group: ManifestGroup, key: &ObjectKey, detail: &str) -> DeployerError {
    DeployerError::new(
        Condition::ApplyFailure,
        Component::DeploymentOrchestrator,
        format!("{group} group: {key}: {detail}"),
    )
}

fn readiness_failure(error: PollError<anyhow::Error>, timeout: Duration) -> DeployerError {
    let message = match error {
        PollError::Timeout { .. } => {
            format!("workloads not ready within {}s", timeout.as_secs())
        }
        PollError::Failed { source, .. } => format!("readiness check failed: {source:#}"),
    };
    DeployerError::new(
        Condition::ReadinessTimeout,
        Component::DeploymentOrchestrator,
        message,
    )
}

/// How the health step ended
#[derive(Debug, PartialEq, Eq)]
enum HealthVerdict {
    Healthy,
    Unhealthy(String),
    Interrupted,
}

/// Race the health check against an operator interrupt; the forward guard
/// inside `health` is dropped either way
async fn health_or_interrupt<H, I>(health: H, interrupt: I) -> HealthVerdict
where
    H: Future<Output = std::result::Result<(), String>>,
    I: Future<Output = ()>,
{
    tokio::select! {
        outcome = health => match outcome {
            Ok(()) => HealthVerdict::Healthy,
            Err(reason) => HealthVerdict::Unhealthy(reason),
        },
        () = interrupt => HealthVerdict::Interrupted,
    }
}

/// Resolves on Ctrl-C; never resolves when no handler can be installed
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        debug!("Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}
