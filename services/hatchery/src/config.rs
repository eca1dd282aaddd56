//! Configuration for the hatchery.
//!
//! Everything comes from `HATCHERY_*` environment variables except the
//! worker models, which live in a TOML file:
//!
//! ```toml
//! [[models]]
//! name = "linux-large"
//! image = "registry.local/ci/linux:latest"
//! tags = ["linux", "docker"]
//! cpus = 8
//! memory_mb = 16384
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hatchery_id::{HatcheryId, WorkerName};
use hatchery_reconcile::{DEFAULT_FAILURE_WINDOW, DEFAULT_MAX_KILL_ATTEMPTS, DEFAULT_RECONCILE_INTERVAL};
use serde::Deserialize;

use crate::backend::vsphere::VSphereConfig;
use crate::model::{WorkerMode, WorkerModel};

const DEFAULT_MODELS_FILE: &str = "/etc/hatchery/models.toml";
const DEFAULT_DOCKER_URL: &str = "http://127.0.0.1:2375";

/// Hatchery configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hatchery name; prefixes every worker name and backend tag.
    pub name: String,

    /// Identifier of this process, for logs.
    pub session: HatcheryId,

    /// Queue service URL. Unset runs against an in-process queue.
    pub queue_url: Option<String>,

    pub queue_token: Option<String>,

    /// Address the registration API listens on.
    pub listen_addr: SocketAddr,

    /// URL workers use to reach the registration API.
    pub public_url: String,

    pub mode: WorkerMode,

    pub models: Vec<WorkerModel>,

    pub limits: Limits,

    pub backend: BackendConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Bounds and timeouts of the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Ceiling on non-terminal workers.
    pub max_workers: usize,

    /// Ceiling on spawn calls in flight.
    pub max_concurrent_spawns: usize,

    /// Ceiling on kill calls in flight.
    pub max_concurrent_kills: usize,

    pub idle_timeout: Duration,
    pub registration_timeout: Duration,

    /// Silence after which a worker is considered errored.
    pub heartbeat_timeout: Duration,

    pub tick_interval: Duration,

    /// Deadline for every single backend or queue call.
    pub operation_timeout: Duration,

    pub shutdown_grace: Duration,
    pub max_kill_attempts: u32,

    /// Consecutive failures of one kind before admissions back off.
    pub failure_threshold: u32,
    pub failure_window: Duration,

    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_workers: 10,
            max_concurrent_spawns: 4,
            max_concurrent_kills: 4,
            idle_timeout: Duration::from_secs(300),
            registration_timeout: Duration::from_secs(180),
            heartbeat_timeout: Duration::from_secs(120),
            tick_interval: DEFAULT_RECONCILE_INTERVAL,
            operation_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            max_kill_attempts: DEFAULT_MAX_KILL_ATTEMPTS,
            failure_threshold: 3,
            failure_window: DEFAULT_FAILURE_WINDOW,
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl Limits {
    /// Interval workers are asked to heartbeat at.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.heartbeat_timeout / 3).max(Duration::from_secs(1))
    }
}

/// Backend selection and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Mock,
    Process,
    Docker { url: String },
    VSphere(VSphereConfig),
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    #[serde(default)]
    models: Vec<WorkerModel>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let name = var("HATCHERY_NAME").unwrap_or_else(|| "hatchery".to_string());

        let listen_addr: SocketAddr = var("HATCHERY_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8086".to_string())
            .parse()
            .context("HATCHERY_LISTEN_ADDR is not a socket address")?;

        let public_url = var("HATCHERY_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://{listen_addr}"));

        let mode = match var("HATCHERY_WORKER_MODE") {
            Some(raw) => raw
                .parse::<WorkerMode>()
                .map_err(anyhow::Error::msg)
                .context("HATCHERY_WORKER_MODE is invalid")?,
            None => WorkerMode::default(),
        };

        let defaults = Limits::default();
        let limits = Limits {
            max_workers: parse_or(&var, "HATCHERY_MAX_WORKERS", defaults.max_workers)?,
            max_concurrent_spawns: parse_or(
                &var,
                "HATCHERY_MAX_CONCURRENT_SPAWNS",
                defaults.max_concurrent_spawns,
            )?,
            max_concurrent_kills: parse_or(
                &var,
                "HATCHERY_MAX_CONCURRENT_KILLS",
                defaults.max_concurrent_kills,
            )?,
            idle_timeout: secs_or(&var, "HATCHERY_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            registration_timeout: secs_or(
                &var,
                "HATCHERY_REGISTRATION_TIMEOUT_SECS",
                defaults.registration_timeout,
            )?,
            heartbeat_timeout: secs_or(
                &var,
                "HATCHERY_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            )?,
            tick_interval: secs_or(&var, "HATCHERY_TICK_INTERVAL_SECS", defaults.tick_interval)?,
            operation_timeout: secs_or(
                &var,
                "HATCHERY_OPERATION_TIMEOUT_SECS",
                defaults.operation_timeout,
            )?,
            shutdown_grace: secs_or(&var, "HATCHERY_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            max_kill_attempts: parse_or(
                &var,
                "HATCHERY_MAX_KILL_ATTEMPTS",
                defaults.max_kill_attempts,
            )?,
            failure_threshold: parse_or(
                &var,
                "HATCHERY_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            )?,
            failure_window: secs_or(&var, "HATCHERY_FAILURE_WINDOW_SECS", defaults.failure_window)?,
            backoff_base: secs_or(&var, "HATCHERY_BACKOFF_BASE_SECS", defaults.backoff_base)?,
            backoff_max: secs_or(&var, "HATCHERY_BACKOFF_MAX_SECS", defaults.backoff_max)?,
        };

        let models_file = var("HATCHERY_MODELS_FILE").unwrap_or_else(|| DEFAULT_MODELS_FILE.to_string());
        let models = load_models(Path::new(&models_file))?;

        let backend = match var("HATCHERY_BACKEND").as_deref().unwrap_or("process") {
            "mock" => BackendConfig::Mock,
            "process" => BackendConfig::Process,
            "docker" => BackendConfig::Docker {
                url: var("HATCHERY_DOCKER_URL").unwrap_or_else(|| DEFAULT_DOCKER_URL.to_string()),
            },
            "vsphere" => BackendConfig::VSphere(VSphereConfig {
                endpoint: var("HATCHERY_VSPHERE_ENDPOINT")
                    .context("HATCHERY_VSPHERE_ENDPOINT is required for the vsphere backend")?,
                user: var("HATCHERY_VSPHERE_USER")
                    .context("HATCHERY_VSPHERE_USER is required for the vsphere backend")?,
                password: var("HATCHERY_VSPHERE_PASSWORD")
                    .context("HATCHERY_VSPHERE_PASSWORD is required for the vsphere backend")?,
                datacenter: var("HATCHERY_VSPHERE_DATACENTER"),
                network: var("HATCHERY_VSPHERE_NETWORK"),
            }),
            other => bail!("unknown backend '{other}' (expected process, docker, vsphere or mock)"),
        };

        let config = Self {
            name,
            session: HatcheryId::new(),
            queue_url: var("HATCHERY_QUEUE_URL"),
            queue_token: var("HATCHERY_QUEUE_TOKEN"),
            listen_addr,
            public_url,
            mode,
            models,
            limits,
            backend,
            log_level: var("HATCHERY_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Configuration for an in-process hatchery on the mock backend.
    pub fn local(name: impl Into<String>, models: Vec<WorkerModel>) -> Self {
        Self {
            name: name.into(),
            session: HatcheryId::new(),
            queue_url: None,
            queue_token: None,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8086)),
            public_url: "http://127.0.0.1:8086".to_string(),
            mode: WorkerMode::default(),
            models,
            limits: Limits::default(),
            backend: BackendConfig::Mock,
            log_level: "info".to_string(),
        }
    }

    /// Check the invariants the control loop relies on.
    pub fn validate(&self) -> Result<()> {
        if WorkerName::namespace(&self.name) != format!("{}-", self.name) {
            bail!(
                "hatchery name '{}' must be at most 20 characters of [a-z0-9-]",
                self.name
            );
        }
        if self.limits.max_workers == 0 {
            bail!("HATCHERY_MAX_WORKERS must be at least 1");
        }
        if self.limits.max_concurrent_spawns == 0 {
            bail!("HATCHERY_MAX_CONCURRENT_SPAWNS must be at least 1");
        }
        if self.limits.max_concurrent_kills == 0 {
            bail!("HATCHERY_MAX_CONCURRENT_KILLS must be at least 1");
        }
        if self.limits.failure_threshold == 0 {
            bail!("HATCHERY_FAILURE_THRESHOLD must be at least 1");
        }
        if self.models.is_empty() {
            bail!("at least one worker model must be configured");
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            if model.name.is_empty() {
                bail!("worker model with image '{}' has no name", model.image);
            }
            if !seen.insert(model.name.as_str()) {
                bail!("worker model '{}' is defined twice", model.name);
            }
        }
        Ok(())
    }
}

/// Read worker models from a TOML file.
pub fn load_models(path: &Path) -> Result<Vec<WorkerModel>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read models file {}", path.display()))?;
    let file: ModelsFile = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse models file {}", path.display()))?;
    Ok(file.models)
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has invalid value '{raw}'")),
        None => Ok(default),
    }
}

fn secs_or<F>(var: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(var, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn models_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const MODELS: &str = r#"
[[models]]
name = "linux-large"
image = "registry.local/ci/linux:latest"
tags = ["linux", "docker"]
cpus = 8
memory_mb = 16384

[[models]]
name = "windows"
image = "win-template"
os = "windows"
provision = 2
"#;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let file = models_file(MODELS);
        let config = load(&[("HATCHERY_MODELS_FILE", file.path().to_str().unwrap())]).unwrap();

        assert_eq!(config.name, "hatchery");
        assert_eq!(config.mode, WorkerMode::JobScoped);
        assert_eq!(config.backend, BackendConfig::Process);
        assert_eq!(config.limits, Limits::default());
        assert_eq!(config.public_url, "http://0.0.0.0:8086");
        assert!(config.queue_url.is_none());

        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models[0].cpus, 8);
        assert_eq!(config.models[1].os, "windows");
        assert_eq!(config.models[1].provision, 2);
        assert_eq!(config.models[1].memory_mb, 1024);
    }

    #[test]
    fn test_overrides() {
        let file = models_file(MODELS);
        let config = load(&[
            ("HATCHERY_MODELS_FILE", file.path().to_str().unwrap()),
            ("HATCHERY_NAME", "ci-east"),
            ("HATCHERY_MAX_WORKERS", "1"),
            ("HATCHERY_MAX_CONCURRENT_KILLS", "16"),
            ("HATCHERY_REGISTRATION_TIMEOUT_SECS", "30"),
            ("HATCHERY_WORKER_MODE", "pool"),
            ("HATCHERY_BACKEND", "docker"),
            ("HATCHERY_QUEUE_URL", "https://queue.local"),
        ])
        .unwrap();

        assert_eq!(config.name, "ci-east");
        assert_eq!(config.limits.max_workers, 1);
        assert_eq!(config.limits.max_concurrent_kills, 16);
        assert_eq!(config.limits.max_concurrent_spawns, 4);
        assert_eq!(config.limits.registration_timeout, Duration::from_secs(30));
        assert_eq!(config.mode, WorkerMode::Pool);
        assert_eq!(
            config.backend,
            BackendConfig::Docker {
                url: DEFAULT_DOCKER_URL.to_string()
            }
        );
        assert_eq!(config.queue_url.as_deref(), Some("https://queue.local"));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let file = models_file(MODELS);
        let err = load(&[
            ("HATCHERY_MODELS_FILE", file.path().to_str().unwrap()),
            ("HATCHERY_MAX_WORKERS", "0"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("MAX_WORKERS"));

        let err = load(&[
            ("HATCHERY_MODELS_FILE", file.path().to_str().unwrap()),
            ("HATCHERY_MAX_CONCURRENT_KILLS", "0"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("MAX_CONCURRENT_KILLS"));
    }

    #[test]
    fn test_rejects_garbage_number() {
        let file = models_file(MODELS);
        let err = load(&[
            ("HATCHERY_MODELS_FILE", file.path().to_str().unwrap()),
            ("HATCHERY_TICK_INTERVAL_SECS", "soon"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("HATCHERY_TICK_INTERVAL_SECS"));
    }

    #[test]
    fn test_rejects_duplicate_models() {
        let file = models_file(
            r#"
[[models]]
name = "a"
image = "x"

[[models]]
name = "a"
image = "y"
"#,
        );
        let err = load(&[("HATCHERY_MODELS_FILE", file.path().to_str().unwrap())]).unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_rejects_empty_models() {
        let file = models_file("");
        let err = load(&[("HATCHERY_MODELS_FILE", file.path().to_str().unwrap())]).unwrap_err();
        assert!(err.to_string().contains("at least one worker model"));
    }

    #[test]
    fn test_vsphere_requires_credentials() {
        let file = models_file(MODELS);
        let err = load(&[
            ("HATCHERY_MODELS_FILE", file.path().to_str().unwrap()),
            ("HATCHERY_BACKEND", "vsphere"),
            ("HATCHERY_VSPHERE_ENDPOINT", "vcenter.local"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("HATCHERY_VSPHERE_USER"));
    }

    #[test]
    fn test_rejects_unsanitary_name() {
        let config = Config::local("CI East", vec![WorkerModel::new("a", "b")]);
        assert!(config.validate().is_err());

        let config = Config::local("ci-east", vec![WorkerModel::new("a", "b")]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_interval() {
        let limits = Limits {
            heartbeat_timeout: Duration::from_secs(90),
            ..Limits::default()
        };
        assert_eq!(limits.heartbeat_interval(), Duration::from_secs(30));
    }
}
