//! # Post-deploy Health Check
//!
//! Opens a scoped port-forward to the backend service and issues one liveness
//! request. The forward is owned by a [`ForwardGuard`]; dropping the guard
//! kills the forwarding process, so every exit path (success, error, Ctrl-C
//! cancelling the future) releases it.

use crate::constants::{HEALTH_REQUEST_TIMEOUT_SECS, PORT_FORWARD_STARTUP_TIMEOUT_SECS};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

static FORWARDING_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Forwarding from 127\.0\.0\.1:(\d+)").ok());

/// Something that must be torn down when a forward ends
pub trait ForwardHandle: Send {
    fn release(&mut self);
}

/// Live port-forward; released on drop
pub struct ForwardGuard {
    local_port: u16,
    handle: Box<dyn ForwardHandle>,
}

impl ForwardGuard {
    pub fn new(local_port: u16, handle: Box<dyn ForwardHandle>) -> Self {
        Self { local_port, handle }
    }

    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl std::fmt::Debug for ForwardGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardGuard")
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        debug!(local_port = self.local_port, "Releasing port-forward");
        self.handle.release();
    }
}

/// Opens forwards to a service port
#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn forward(&self, namespace: &str, service: &str, remote_port: u16)
        -> Result<ForwardGuard>;
}

/// `kubectl port-forward svc/<name> :<port>`
#[derive(Debug, Clone)]
pub struct KubectlPortForwarder {
    binary: PathBuf,
}

impl KubectlPortForwarder {
    pub fn discover() -> Result<Self> {
        let binary = which::which("kubectl").context("kubectl not found on PATH")?;
        Ok(Self { binary })
    }
}

struct KubectlForward {
    child: Child,
    // Held so kubectl never writes into a closed pipe
    _stdout: Lines<BufReader<ChildStdout>>,
}

impl ForwardHandle for KubectlForward {
    fn release(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("port-forward already exited: {}", e);
        }
    }
}

#[async_trait]
impl PortForwarder for KubectlPortForwarder {
    async fn forward(
        &self,
        namespace: &str,
        service: &str,
        remote_port: u16,
    ) -> Result<ForwardGuard> {
        let mut child = Command::new(&self.binary)
            .args(["port-forward", "--namespace", namespace])
            .arg(format!("svc/{service}"))
            .arg(format!(":{remote_port}"))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start kubectl port-forward")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("kubectl port-forward has no stdout"))?;
        let mut lines = BufReader::new(stdout).lines();

        let startup = Duration::from_secs(PORT_FORWARD_STARTUP_TIMEOUT_SECS);
        let local_port = tokio::time::timeout(startup, async {
            while let Some(line) = lines.next_line().await? {
                if let Some(port) = parse_forwarding_port(&line) {
                    return Ok::<u16, anyhow::Error>(port);
                }
            }
            Err(anyhow!("kubectl port-forward exited before forwarding"))
        })
        .await
        .map_err(|_| anyhow!("kubectl port-forward did not start within {startup:?}"))??;

        info!(service, local_port, "Port-forward established");
        Ok(ForwardGuard::new(
            local_port,
            Box::new(KubectlForward {
                child,
                _stdout: lines,
            }),
        ))
    }
}

fn parse_forwarding_port(line: &str) -> Option<u16> {
    FORWARDING_LINE
        .as_ref()?
        .captures(line)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// `GET url`; healthy means 2xx and, for JSON bodies, `status == "healthy"`.
///
/// Returns the reason when unhealthy.
pub async fn check_health(url: &str) -> std::result::Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(HEALTH_REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| format!("failed to build HTTP client: {e}"))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request to {url} failed: {e}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("{url} returned HTTP {status}"));
    }

    let body = response
        .text()
        .await
        .map_err(|e| format!("failed to read health response: {e}"))?;
    let Ok(json) = serde_json::from_str::<Value>(&body) else {
        return Ok(());
    };
    match json.get("status").and_then(Value::as_str) {
        None | Some("healthy") => Ok(()),
        Some(other) => {
            let failing = failing_checks(&json);
            warn!(status = other, failing = ?failing, "Backend reports unhealthy");
            if failing.is_empty() {
                Err(format!("backend status is {other:?}"))
            } else {
                Err(format!(
                    "backend status is {other:?} (failing checks: {})",
                    failing.join(", ")
                ))
            }
        }
    }
}

fn failing_checks(json: &Value) -> Vec<String> {
    json.get("checks")
        .and_then(Value::as_object)
        .map(|checks| {
            checks
                .iter()
                .filter(|(_, check)| check.get("status") == Some(&Value::Bool(false)))
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default()
}
