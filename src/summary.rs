//! # Run Summary
//!
//! Every `vocarectl` command ends by printing what it touched, what happened to
//! each secret and which manual steps remain. Secret values never reach this
//! module; it only sees names.

use crate::backup::{BackupArchive, RestoreResult};
use crate::deploy::{DeployPhase, DeploymentResult, StatusReport};
use crate::error::{Condition, DeployerError, Warning};
use crate::identity::{CredentialAction, IdentityBinding};
use crate::reconciler::ProvisionReport;
use crate::secrets::SyncReport;
use std::fmt::Write;

/// Operator-facing summary of one command
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub title: String,
    /// `Kind name (outcome)` lines
    pub touched: Vec<String>,
    pub secrets_written: Vec<String>,
    pub secrets_unchanged: Vec<String>,
    pub secrets_skipped: Vec<(String, String)>,
    pub secrets_failed: Vec<String>,
    pub warnings: Vec<Warning>,
    pub next_steps: Vec<String>,
    /// Terminal line, e.g. `Succeeded`
    pub outcome: Option<String>,
}

impl RunSummary {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn add_provision(&mut self, report: &ProvisionReport) -> &mut Self {
        for resource in &report.resources {
            self.touched
                .push(format!("{} {} ({})", resource.kind, resource.name, resource.outcome));
        }
        self.warnings.extend(report.warnings.iter().cloned());
        self
    }

    pub fn add_identity(&mut self, binding: &IdentityBinding) -> &mut Self {
        self.touched.push(format!(
            "ManagedIdentity {} (client id {})",
            binding.identity.name, binding.identity.client_id
        ));
        let action = match binding.credential_action {
            CredentialAction::Created => "created",
            CredentialAction::Existing => "already-present",
            CredentialAction::Recreated => "recreated",
        };
        self.touched.push(format!(
            "FederatedCredential {} -> {} ({action})",
            binding.credential.name, binding.credential.subject
        ));
        if binding.role_granted {
            self.touched
                .push("RoleAssignment Key Vault Secrets User (created)".to_string());
        }
        self
    }

    pub fn add_sync(&mut self, report: &SyncReport) -> &mut Self {
        self.secrets_written.extend(report.written.iter().cloned());
        self.secrets_unchanged.extend(report.unchanged.iter().cloned());
        self.secrets_skipped.extend(
            report
                .skipped
                .iter()
                .map(|(name, reason)| (name.clone(), reason.to_string())),
        );
        self.secrets_failed
            .extend(report.failed.iter().map(|(name, _)| name.clone()));
        if !report.skipped.is_empty() {
            self.next_steps.push(format!(
                "Provide real values for [{}] and rerun `vocarectl secrets sync`",
                report.skipped_names().join(", ")
            ));
        }
        if !report.failed.is_empty() {
            self.next_steps.push(
                "Check Key Vault access (Key Vault Secrets Officer role) and rerun `vocarectl secrets sync`"
                    .to_string(),
            );
        }
        self
    }

    pub fn add_deployment(&mut self, result: &DeploymentResult) -> &mut Self {
        for key in &result.applied {
            let verb = if result.phase == DeployPhase::DryRunComplete {
                "would apply"
            } else {
                "applied"
            };
            self.touched.push(format!("{key} ({verb})"));
        }
        for key in &result.rolled_back {
            self.touched.push(format!("{key} (rolled back)"));
        }
        self.warnings.extend(result.warnings.iter().cloned());
        match result.phase {
            DeployPhase::Degraded => self.next_steps.push(format!(
                "Inspect backend health: `vocarectl status {}`",
                result.environment
            )),
            DeployPhase::Failed | DeployPhase::RolledBack => {
                if let Some(failure) = &result.failure {
                    self.next_steps.push(format!("Resolve: {failure}"));
                }
            }
            DeployPhase::Interrupted => self.next_steps.push(format!(
                "Backend health was not verified; check it with `vocarectl status {}`",
                result.environment
            )),
            DeployPhase::DryRunComplete => self.next_steps.push(format!(
                "Run `vocarectl deploy {}` without --dry-run to apply",
                result.environment
            )),
            _ => {}
        }
        self.outcome = Some(format!("{} (run {})", result.phase, result.run_id));
        self
    }

    pub fn add_backup(&mut self, backup: &BackupArchive) -> &mut Self {
        self.touched
            .push(format!("Backup {} (created)", backup.directory.display()));
        if let Some(archive) = &backup.archive_path {
            self.touched.push(format!("Archive {} (created)", archive.display()));
        }
        for removed in &backup.prune.removed {
            self.touched.push(format!("Backup {} (pruned)", removed.display()));
        }
        self.warnings.extend(backup.warnings.iter().cloned());
        self.next_steps.push(format!(
            "Store {} off-cluster; secret values are not included and must be re-entered via {}",
            backup
                .archive_path
                .as_ref()
                .unwrap_or(&backup.directory)
                .display(),
            backup.restore_script.display()
        ));
        self
    }

    pub fn add_restore(&mut self, result: &RestoreResult) -> &mut Self {
        let verb = if result.dry_run { "would restore" } else { "restored" };
        for key in &result.applied {
            self.touched.push(format!("{key} ({verb})"));
        }
        for (key, _) in &result.failed {
            self.touched.push(format!("{key} (failed)"));
        }
        self.secrets_skipped.extend(
            result
                .skipped_secrets
                .iter()
                .map(|key| (key.to_string(), "values are not backed up".to_string())),
        );
        if !result.vault_secrets_to_reenter.is_empty() {
            self.next_steps.push(format!(
                "Re-enter {} Key Vault secrets with {}/restore-secrets.sh",
                result.vault_secrets_to_reenter.len(),
                result.backup_dir.display()
            ));
        }
        if result.dry_run {
            self.next_steps
                .push("Run `vocarectl restore` without --dry-run to apply".to_string());
        }
        self
    }

    pub fn add_status(&mut self, status: &StatusReport) -> &mut Self {
        for workload in &status.workloads {
            self.touched.push(workload.to_string());
        }
        self.outcome = Some(match &status.last_run {
            Some(run) => format!("last deploy run {run} (server {})", status.server_version),
            None => format!(
                "no {} deploy recorded (server {})",
                status.environment, status.server_version
            ),
        });
        self
    }

    /// Record the failure that ended the run
    pub fn add_failure(&mut self, error: &anyhow::Error) -> &mut Self {
        let Some(failure) = error.downcast_ref::<DeployerError>() else {
            self.outcome = Some(format!("Failed: {error:#}"));
            return self;
        };
        self.outcome = Some(format!(
            "Failed: {} in {}",
            failure.condition, failure.component
        ));
        self.next_steps.push(format!("Resolve: {}", failure.message));
        let hint = match failure.condition {
            Condition::PrerequisiteMissing => Some("Run `vocarectl check` to verify tools and connectivity"),
            Condition::ValidationFailure => {
                Some("Create the missing objects, or rerun with --force to continue anyway")
            }
            Condition::ProvisioningFailure | Condition::Timeout => {
                Some("Rerun the command; resources already converged are kept")
            }
            _ => None,
        };
        if let Some(hint) = hint {
            self.next_steps.push(hint.to_string());
        }
        self
    }

    pub fn next_step(&mut self, step: impl Into<String>) -> &mut Self {
        self.next_steps.push(step.into());
        self
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "📋 {}", self.title);

        if !self.touched.is_empty() {
            let _ = writeln!(out, "\nResources:");
            for line in &self.touched {
                let _ = writeln!(out, "   • {line}");
            }
        }

        let secrets_seen = !(self.secrets_written.is_empty()
            && self.secrets_unchanged.is_empty()
            && self.secrets_skipped.is_empty()
            && self.secrets_failed.is_empty());
        if secrets_seen {
            let _ = writeln!(out, "\nSecrets:");
            let _ = writeln!(out, "   ✅ written: [{}]", self.secrets_written.join(", "));
            if !self.secrets_unchanged.is_empty() {
                let _ = writeln!(out, "   ✅ unchanged: [{}]", self.secrets_unchanged.join(", "));
            }
            let skipped: Vec<&str> = self.secrets_skipped.iter().map(|(n, _)| n.as_str()).collect();
            let _ = writeln!(out, "   ⚠️  skipped: [{}]", skipped.join(", "));
            for (name, reason) in &self.secrets_skipped {
                let _ = writeln!(out, "      {name}: {reason}");
            }
            let _ = writeln!(out, "   ❌ failed: [{}]", self.secrets_failed.join(", "));
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(out, "\nWarnings:");
            for warning in &self.warnings {
                let _ = writeln!(out, "   ⚠️  {warning}");
            }
        }

        if let Some(outcome) = &self.outcome {
            let _ = writeln!(out, "\nOutcome: {outcome}");
        }

        if !self.next_steps.is_empty() {
            let _ = writeln!(out, "\nNext steps:");
            for (i, step) in self.next_steps.iter().enumerate() {
                let _ = writeln!(out, "   {}. {step}", i + 1);
            }
        }
        out
    }

    pub fn print(&self) {
        println!();
        print!("{}", self.render());
    }
}
