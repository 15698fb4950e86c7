//! # vocarectl
//!
//! Command-line front end of the Vocare deployer.
//!
//! ## Usage
//!
//! ```bash
//! # Create or converge the Azure resources, federate the workload identity
//! # and push secrets from the environment
//! vocarectl provision
//!
//! # Push secrets from a dotenv file
//! vocarectl secrets sync --env-file .env.production
//!
//! # Roll the stack out
//! vocarectl deploy staging --timeout 10m
//! vocarectl deploy prod --dry-run
//!
//! # Back up, restore, prune
//! vocarectl backup --retention-days 14
//! vocarectl restore backups/vocare-backup-20261016-093000.tar.gz --dry-run
//! vocarectl prune
//! ```

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use vocare_deployer::backup::{self, BackupPipeline, TarArchiver};
use vocare_deployer::cluster::{ClusterApi, KubeCluster};
use vocare_deployer::config::resolved::keys;
use vocare_deployer::config::{parse_duration, DeployerConfig, ResolvedConfig};
use vocare_deployer::deploy::{
    DeployOptions, DirectoryRenderer, Environment, HelmRenderer, KubectlPortForwarder,
    ManifestRenderer, Orchestrator,
};
use vocare_deployer::error::{Component, DeployerError};
use vocare_deployer::identity::{
    render_service_account, BindRequest, IdentityFederation, ServiceAccountSubject,
};
use vocare_deployer::logging;
use vocare_deployer::provider::azure::{AzCli, AzureKeyVault};
use vocare_deployer::provider::CloudApi;
use vocare_deployer::reconciler::{desired_resources, ProvisionRun, Reconciler};
use vocare_deployer::retry::RetryPolicy;
use vocare_deployer::secrets::{
    read_env_file, read_environment, SecretSynchronizer, SecretValues, SyncSource,
};
use vocare_deployer::summary::RunSummary;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\nbuild: ",
    env!("BUILD_DATETIME"),
    " (",
    env!("BUILD_TIMESTAMP"),
    ")\ncommit: ",
    env!("BUILD_GIT_HASH")
);

/// Vocare deployer CLI
#[derive(Parser)]
#[command(name = "vocarectl")]
#[command(
    version,
    long_version = LONG_VERSION,
    about = "Provision, deploy and back up the Vocare voice stack on AKS",
    long_about = None,
    after_help = "\
Environments:
  dev, staging, prod

Examples:
  vocarectl provision
  vocarectl deploy dev
  vocarectl deploy prod --dry-run
  vocarectl backup --output /mnt/backups
"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubernetes namespace of the stack (default: vocare)
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Azure subscription id (default: current az subscription)
    #[arg(long, global = true)]
    subscription: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge Azure resources, federate the workload identity and sync secrets
    Provision {
        /// Read secret values from this dotenv file instead of the environment
        #[arg(long, value_name = "FILE")]
        env_file: Option<PathBuf>,

        /// Stop after identity federation
        #[arg(long)]
        skip_secrets: bool,
    },
    /// Federate the Kubernetes service account with the managed identity
    Identity,
    /// Key Vault secret operations
    Secrets {
        #[command(subcommand)]
        action: SecretsCommand,
    },
    /// Roll the stack out to an environment
    Deploy {
        #[arg(value_enum, value_name = "ENVIRONMENT")]
        environment: Environment,

        /// Validate and render only
        #[arg(long)]
        dry_run: bool,

        /// Continue when environment policy checks fail
        #[arg(long)]
        force: bool,

        /// Skip environment policy checks
        #[arg(long)]
        skip_tests: bool,

        /// Readiness timeout (e.g. 600s, 10m, 1h)
        #[arg(long, value_parser = parse_timeout)]
        timeout: Option<Duration>,
    },
    /// Capture cluster and Azure state into a timestamped archive
    Backup {
        /// Backup root directory
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Delete backups older than this many days
        #[arg(long)]
        retention_days: Option<u32>,

        /// Dotenv file whose values must never appear in the backup
        #[arg(long, value_name = "FILE")]
        env_file: Option<PathBuf>,
    },
    /// Re-apply the Kubernetes objects of a backup
    Restore {
        /// Backup directory or .tar.gz archive
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,

        /// Server-side dry run; nothing is changed
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete expired backups
    Prune {
        /// Backup root directory
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        #[arg(long)]
        retention_days: Option<u32>,
    },
    /// Show workload readiness for an environment
    Status {
        #[arg(value_enum, value_name = "ENVIRONMENT")]
        environment: Environment,
    },
    /// Verify required tools and connectivity
    Check,
}

#[derive(Subcommand)]
enum SecretsCommand {
    /// Write secret values into Key Vault
    Sync {
        /// Dotenv file holding the values
        #[arg(long, value_name = "FILE", conflicts_with = "interactive")]
        env_file: Option<PathBuf>,

        /// Prompt for each value
        #[arg(long)]
        interactive: bool,
    },
}

fn parse_timeout(value: &str) -> std::result::Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any TLS connection is made
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    let mut config = DeployerConfig::from_env();
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if cli.subscription.is_some() {
        config.subscription_id = cli.subscription;
    }
    logging::init(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("BUILD_GIT_HASH"),
        built = env!("BUILD_DATETIME"),
        "vocarectl"
    );

    let outcome = match cli.command {
        Commands::Provision {
            env_file,
            skip_secrets,
        } => provision_command(&config, env_file, skip_secrets).await,
        Commands::Identity => identity_command(&config).await,
        Commands::Secrets {
            action:
                SecretsCommand::Sync {
                    env_file,
                    interactive,
                },
        } => secrets_command(&config, sync_source(env_file, interactive)).await,
        Commands::Deploy {
            environment,
            dry_run,
            force,
            skip_tests,
            timeout,
        } => {
            let options = DeployOptions {
                dry_run,
                force,
                skip_validation: skip_tests,
                timeout: timeout.unwrap_or_else(|| config.readiness_timeout()),
            };
            deploy_command(&config, environment, &options).await
        }
        Commands::Backup {
            output,
            retention_days,
            env_file,
        } => {
            apply_backup_overrides(&mut config, output, retention_days);
            backup_command(&config, env_file).await
        }
        Commands::Restore { archive, dry_run } => restore_command(&archive, dry_run).await,
        Commands::Prune {
            output,
            retention_days,
        } => {
            apply_backup_overrides(&mut config, output, retention_days);
            prune_command(&config)
        }
        Commands::Status { environment } => status_command(&config, environment).await,
        Commands::Check => check_command(&config).await,
    };

    match outcome {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("❌ {e:#}");
            std::process::exit(1);
        }
    }
}

fn sync_source(env_file: Option<PathBuf>, interactive: bool) -> SyncSource {
    match env_file {
        Some(path) => SyncSource::EnvFile(path),
        None if interactive => SyncSource::Interactive,
        None => SyncSource::Environment,
    }
}

fn apply_backup_overrides(
    config: &mut DeployerConfig,
    output: Option<PathBuf>,
    retention_days: Option<u32>,
) {
    if let Some(output) = output {
        config.backup_dir = output;
    }
    if let Some(days) = retention_days {
        config.backup_retention_days = days;
    }
}

fn cloud_policy(config: &DeployerConfig) -> RetryPolicy {
    RetryPolicy::exponential(
        config.cloud_retry_attempts,
        config.backoff_start_duration(),
        config.backoff_max_duration(),
    )
}

fn connect_cloud(config: &DeployerConfig) -> Result<Arc<dyn CloudApi>> {
    let cli = AzCli::discover(config.subscription_id.clone())
        .map_err(|e| DeployerError::prerequisite(Component::ResourceReconciler, format!("{e:#}")))?;
    Ok(Arc::new(cli))
}

async fn connect_cluster(component: Component) -> Result<Arc<dyn ClusterApi>> {
    let cluster = KubeCluster::connect().await.map_err(|e| {
        DeployerError::prerequisite(
            component,
            format!("cannot create Kubernetes client, check kubeconfig: {e:#}"),
        )
    })?;
    Ok(Arc::new(cluster))
}

/// Key Vault client for the provisioned vault (URI from the resolved record when known)
fn vault_store(config: &DeployerConfig, resolved: &ResolvedConfig) -> Result<AzureKeyVault> {
    let vault = resolved
        .get(keys::KEY_VAULT_URI)
        .unwrap_or(&config.vault_name);
    AzureKeyVault::new(vault, config.azure_auth)
        .map_err(|e| DeployerError::prerequisite(Component::SecretSynchronizer, format!("{e:#}")).into())
}

/// Print the summary whether or not the command succeeded
fn finish(mut summary: RunSummary, outcome: Result<i32>) -> Result<i32> {
    if let Err(e) = &outcome {
        summary.add_failure(e);
    }
    summary.print();
    outcome
}

async fn provision_command(
    config: &DeployerConfig,
    env_file: Option<PathBuf>,
    skip_secrets: bool,
) -> Result<i32> {
    let mut summary = RunSummary::new(format!("Provision {}", config.resource_group));
    let outcome = provision(config, env_file, skip_secrets, &mut summary).await;
    finish(summary, outcome)
}

async fn provision(
    config: &DeployerConfig,
    env_file: Option<PathBuf>,
    skip_secrets: bool,
    summary: &mut RunSummary,
) -> Result<i32> {
    let cloud = connect_cloud(config)?;
    let resolved = ResolvedConfig::load(&config.resolved_config_path)?;

    println!("🏗️  Converging Azure resources in {}...", config.resource_group);
    let reconciler = Reconciler::new(Arc::clone(&cloud), cloud_policy(config));
    let ProvisionRun {
        report,
        resolved,
        error,
    } = reconciler
        .ensure_all(&desired_resources(config), resolved)
        .await;
    // Endpoints converged before a failure are kept for the next run
    let saved = resolved.save(&config.resolved_config_path);
    summary.add_provision(&report);
    if let Some(error) = error {
        if let Err(e) = saved {
            warn!("Failed to record resolved config: {:#}", e);
        }
        return Err(error.into());
    }
    saved?;
    println!("   ✅ {} resources converged ({} created)", report.resources.len(), report.created());

    println!("🔐 Federating workload identity...");
    let request = BindRequest::from_config(config, &resolved)?;
    let federation = IdentityFederation::new(
        cloud,
        cloud_policy(config),
        RetryPolicy::fixed(config.issuer_poll_attempts, config.issuer_poll_interval()),
    );
    let binding = federation.bind(&request, resolved).await?;
    binding.resolved.save(&config.resolved_config_path)?;
    println!("   ✅ {} bound to {}", binding.identity.name, request.subject);
    summary.add_identity(&binding);

    if skip_secrets {
        summary.next_step("Run `vocarectl secrets sync` to populate Key Vault");
    } else {
        println!("🔑 Synchronizing Key Vault secrets...");
        let source = sync_source(env_file, false);
        let store = vault_store(config, &binding.resolved)?;
        let synchronizer = SecretSynchronizer::new(Arc::new(store), cloud_policy(config));
        let sync = synchronizer.sync(&source).await?;
        summary.add_sync(&sync);
    }

    summary.next_step(format!(
        "Source {} and run `vocarectl deploy dev`",
        config.resolved_config_path.display()
    ));
    Ok(0)
}

async fn identity_command(config: &DeployerConfig) -> Result<i32> {
    let mut summary = RunSummary::new("Identity federation");
    let outcome = identity(config, &mut summary).await;
    finish(summary, outcome)
}

async fn identity(config: &DeployerConfig, summary: &mut RunSummary) -> Result<i32> {
    let cloud = connect_cloud(config)?;
    let resolved = ResolvedConfig::load(&config.resolved_config_path)?;
    let request = BindRequest::from_config(config, &resolved)?;

    println!("🔐 Federating {} with {}...", request.subject, request.identity_name);
    let federation = IdentityFederation::new(
        cloud,
        cloud_policy(config),
        RetryPolicy::fixed(config.issuer_poll_attempts, config.issuer_poll_interval()),
    );
    let binding = federation.bind(&request, resolved).await?;
    binding.resolved.save(&config.resolved_config_path)?;

    summary
        .add_identity(&binding)
        .next_step("Redeploy so workloads pick up the annotated service account");
    Ok(0)
}

async fn secrets_command(config: &DeployerConfig, source: SyncSource) -> Result<i32> {
    let mut summary = RunSummary::new("Secrets sync");
    let outcome = sync_secrets(config, &source, &mut summary).await;
    finish(summary, outcome)
}

async fn sync_secrets(
    config: &DeployerConfig,
    source: &SyncSource,
    summary: &mut RunSummary,
) -> Result<i32> {
    let resolved = ResolvedConfig::load(&config.resolved_config_path)?;
    let store = vault_store(config, &resolved)?;
    let synchronizer = SecretSynchronizer::new(Arc::new(store), cloud_policy(config));

    println!("🔑 Synchronizing Key Vault secrets...");
    let report = synchronizer.sync(source).await?;
    summary.add_sync(&report);
    Ok(i32::from(!report.failed.is_empty()))
}

async fn deploy_command(
    config: &DeployerConfig,
    environment: Environment,
    options: &DeployOptions,
) -> Result<i32> {
    let mut summary = RunSummary::new(format!("Deploy {environment}"));
    let outcome = deploy(config, environment, options, &mut summary).await;
    finish(summary, outcome)
}

async fn deploy(
    config: &DeployerConfig,
    environment: Environment,
    options: &DeployOptions,
    summary: &mut RunSummary,
) -> Result<i32> {
    let cluster = connect_cluster(Component::DeploymentOrchestrator).await?;
    let renderer: Arc<dyn ManifestRenderer> = if config.chart_path.exists() {
        Arc::new(HelmRenderer::discover(&config.chart_path)?)
    } else {
        info!(
            "No chart at {}, applying manifests from {}",
            config.chart_path.display(),
            config.manifests_dir.display()
        );
        Arc::new(DirectoryRenderer::new(&config.manifests_dir))
    };
    let forwarder = Arc::new(KubectlPortForwarder::discover()?);

    let resolved = ResolvedConfig::load(&config.resolved_config_path)?;
    let mut extra_objects = Vec::new();
    match resolved.get(keys::CLIENT_ID) {
        Some(client_id) => {
            let subject = ServiceAccountSubject::new(&config.namespace, &config.service_account);
            let account =
                render_service_account(&subject, client_id, resolved.get(keys::TENANT_ID));
            extra_objects.push(
                serde_json::to_value(&account).context("Failed to serialize ServiceAccount")?,
            );
        }
        None => warn!(
            "{} not resolved; workload identity ServiceAccount not applied (run `vocarectl identity`)",
            keys::CLIENT_ID
        ),
    }

    let verb = if options.dry_run { "Rendering" } else { "Deploying" };
    println!("🚀 {verb} {} to {environment}...", config.release_name);

    let orchestrator =
        Orchestrator::new(config, cluster, renderer, forwarder).with_extra_objects(extra_objects);
    let result = orchestrator.deploy(environment, options).await?;

    summary.add_deployment(&result);
    Ok(result.exit_code())
}

async fn backup_command(config: &DeployerConfig, env_file: Option<PathBuf>) -> Result<i32> {
    let mut summary = RunSummary::new("Backup");
    let outcome = run_backup(config, env_file, &mut summary).await;
    finish(summary, outcome)
}

async fn run_backup(
    config: &DeployerConfig,
    env_file: Option<PathBuf>,
    summary: &mut RunSummary,
) -> Result<i32> {
    let cloud = connect_cloud(config)?;
    let cluster = connect_cluster(Component::BackupPipeline).await?;
    let archiver = Arc::new(TarArchiver::discover()?);

    let mut known: SecretValues = read_environment();
    if let Some(path) = env_file {
        known.extend(read_env_file(&path)?);
    }

    println!("💾 Backing up to {}...", config.backup_dir.display());
    let pipeline =
        BackupPipeline::new(config, cloud, cluster, archiver).with_known_secrets(&known);
    let archive = pipeline.run(Utc::now()).await?;

    summary.add_backup(&archive);
    Ok(0)
}

async fn restore_command(archive: &std::path::Path, dry_run: bool) -> Result<i32> {
    let mut summary = RunSummary::new("Restore");
    let outcome = run_restore(archive, dry_run, &mut summary).await;
    finish(summary, outcome)
}

async fn run_restore(
    archive: &std::path::Path,
    dry_run: bool,
    summary: &mut RunSummary,
) -> Result<i32> {
    let cluster = connect_cluster(Component::BackupPipeline).await?;
    let archiver = TarArchiver::discover()?;

    let mode = if dry_run { " (dry run)" } else { "" };
    println!("♻️  Restoring {}{mode}...", archive.display());
    let result = backup::restore(archive, cluster.as_ref(), &archiver, dry_run).await?;

    summary.add_restore(&result);
    Ok(i32::from(!result.failed.is_empty()))
}

fn prune_command(config: &DeployerConfig) -> Result<i32> {
    let report = backup::prune(
        &config.backup_dir,
        config.backup_retention_days,
        Utc::now(),
    )?;

    let mut summary = RunSummary::new(format!(
        "Prune {} (retention {} days)",
        config.backup_dir.display(),
        config.backup_retention_days
    ));
    for removed in &report.removed {
        summary.touched.push(format!("{} (pruned)", removed.display()));
    }
    for kept in &report.kept {
        summary.touched.push(format!("{} (kept)", kept.display()));
    }
    summary.print();
    Ok(0)
}

async fn status_command(config: &DeployerConfig, environment: Environment) -> Result<i32> {
    let mut summary = RunSummary::new(format!("Status {environment} ({})", config.namespace));
    let outcome = status(config, environment, &mut summary).await;
    finish(summary, outcome)
}

async fn status(
    config: &DeployerConfig,
    environment: Environment,
    summary: &mut RunSummary,
) -> Result<i32> {
    let cluster = connect_cluster(Component::DeploymentOrchestrator).await?;
    let orchestrator = Orchestrator::new(
        config,
        cluster,
        Arc::new(DirectoryRenderer::new(&config.manifests_dir)),
        Arc::new(KubectlPortForwarder::discover()?),
    );
    let status = orchestrator.status(environment).await?;

    let all_ready = status.workloads.iter().all(|w| w.is_ready());
    summary.add_status(&status);
    Ok(i32::from(!all_ready))
}

async fn check_command(config: &DeployerConfig) -> Result<i32> {
    let mut summary = RunSummary::new("Prerequisite check");
    let mut ok = true;

    println!("🔍 Checking prerequisites...");
    let helm_needed = config.chart_path.exists();
    for (tool, required) in [("az", true), ("kubectl", true), ("tar", true), ("helm", helm_needed)] {
        match which::which(tool) {
            Ok(path) => println!("   ✅ {tool}: {}", path.display()),
            Err(_) if required => {
                ok = false;
                println!("   ❌ {tool}: not found on PATH");
                summary.next_step(format!("Install {tool}"));
            }
            Err(_) => println!("   ⚠️  {tool}: not found (only needed with a Helm chart)"),
        }
    }

    match connect_cluster(Component::DeploymentOrchestrator).await {
        Ok(cluster) => match cluster.server_version().await {
            Ok(version) => println!("   ✅ Kubernetes API reachable ({version})"),
            Err(e) => {
                ok = false;
                println!("   ❌ Kubernetes API unreachable: {e:#}");
                summary.next_step(format!(
                    "az aks get-credentials --resource-group {} --name {}",
                    config.resource_group, config.cluster_name
                ));
            }
        },
        Err(e) => {
            ok = false;
            println!("   ❌ {e:#}");
        }
    }

    if let Ok(cloud) = connect_cloud(config) {
        match cloud.tenant_id().await {
            Ok(tenant) => println!("   ✅ Azure session active (tenant {tenant})"),
            Err(e) => {
                ok = false;
                println!("   ❌ Azure session unavailable: {e}");
                summary.next_step("Run `az login`");
            }
        }
    }

    summary.outcome = Some(if ok { "ready".to_string() } else { "not ready".to_string() });
    summary.print();
    Ok(i32::from(!ok))
}
