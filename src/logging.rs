//! Tracing subscriber setup for `vocarectl`.

use crate::config::DeployerConfig;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "vocare_deployer=info,vocarectl=info";

/// Filter from `RUST_LOG`, else `LOG_LEVEL` applied to our own crates
fn env_filter(config: &DeployerConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.log_level.to_lowercase();
        match level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {
                EnvFilter::new(format!("vocare_deployer={level},vocarectl={level}"))
            }
            _ => EnvFilter::new(DEFAULT_FILTER),
        }
    })
}

/// Install the global subscriber; `LOG_FORMAT=json` selects JSON lines
pub fn init(config: &DeployerConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(std::io::stderr);
    let installed = if config.log_format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.with_target(false).try_init()
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
