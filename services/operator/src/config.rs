//! Configuration for the operator.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use gamefleet_api::Fleet;
use gamefleet_ports::{DEFAULT_MAX_PORT, DEFAULT_MIN_PORT};
use gamefleet_reconcile::{DEFAULT_CONCURRENCY, DEFAULT_RESYNC_INTERVAL};

use crate::pod::PodTemplateConfig;

/// Operator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Lowest host port handed out (inclusive).
    pub min_port: u16,

    /// Upper bound of the host port range (exclusive).
    pub max_port: u16,

    /// Concurrent reconciles per controller.
    pub concurrency: usize,

    /// Interval between full resyncs.
    pub resync_interval: Duration,

    /// Images and settings injected into every game-server pod.
    pub pod_template: PodTemplateConfig,

    /// JSON file with fleets to load at startup.
    pub fleets_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let min_port = parse_or(&lookup, "GAMEFLEET_MIN_PORT", DEFAULT_MIN_PORT)?;
        let max_port = parse_or(&lookup, "GAMEFLEET_MAX_PORT", DEFAULT_MAX_PORT)?;
        if min_port >= max_port {
            bail!("GAMEFLEET_MIN_PORT ({min_port}) must be below GAMEFLEET_MAX_PORT ({max_port})");
        }

        let concurrency = parse_or(&lookup, "GAMEFLEET_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        if concurrency == 0 {
            bail!("GAMEFLEET_CONCURRENCY must be at least 1");
        }

        let resync_secs = parse_or(
            &lookup,
            "GAMEFLEET_RESYNC_INTERVAL",
            DEFAULT_RESYNC_INTERVAL.as_secs(),
        )?;
        if resync_secs == 0 {
            bail!("GAMEFLEET_RESYNC_INTERVAL must be at least 1 second");
        }

        let sidecar_image = required(&lookup, "GAMEFLEET_SIDECAR_IMAGE")?;
        let init_container_image = required(&lookup, "GAMEFLEET_INIT_CONTAINER_IMAGE")?;

        let fleets_file = lookup("GAMEFLEET_FLEETS_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let log_level = lookup("GAMEFLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            min_port,
            max_port,
            concurrency,
            resync_interval: Duration::from_secs(resync_secs),
            pod_template: PodTemplateConfig::new(sidecar_image, init_container_image),
            fleets_file,
            log_level,
        })
    }
}

/// Read a JSON array of fleets.
pub fn load_fleets(path: &Path) -> Result<Vec<Fleet>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read fleets file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse fleets file {}", path.display()))
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {raw:?}")),
        None => Ok(default),
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    match lookup(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => bail!("{name} must be set"),
    }
}
