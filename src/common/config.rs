//! Configuration for fleetsync peers

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::retry::RetryPolicy;
use crate::common::{Error, Result};

/// Environment prefix for overrides, e.g. `FLEETSYNC__VOLUME__ROOT=/srv/shared`
pub const ENV_PREFIX: &str = "FLEETSYNC";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unit name of this peer (e.g. "app/1")
    pub unit_name: String,

    /// Identity written into the lock file; defaults to the unit name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_id: Option<String>,

    /// Whether this peer is the leader (assigned externally)
    #[serde(default)]
    pub leader: bool,

    /// Shared volume config
    pub volume: VolumeConfig,

    /// Download lock config
    #[serde(default)]
    pub lock: LockConfig,

    /// Polling policy shared by all wait loops
    #[serde(default)]
    pub poll: PollConfig,

    /// Upgrade protocol config
    #[serde(default)]
    pub upgrade: UpgradeConfig,

    /// Consuming service config
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where the filesystem identity of the shared volume comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemIdSource {
    /// UUID stored in `.volume_id` at the volume root (works across hosts)
    #[default]
    Marker,
    /// Device number of the mount (single host only)
    Device,
}

/// Shared volume configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Mount point of the shared volume
    pub root: PathBuf,

    #[serde(default)]
    pub id_source: FilesystemIdSource,

    /// Filesystem id every peer must observe; checked at startup when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_filesystem_id: Option<String>,

    /// Binaries (relative to `bin/`) that must exist and be executable
    #[serde(default)]
    pub required_binaries: Vec<String>,
}

/// What an acquirer does when it finds a stale lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StalePolicy {
    /// Take the lock over
    #[default]
    Reclaim,
    /// Surface `Error::StaleLock` and let the caller decide
    Report,
}

/// Download lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Age after which a lock is presumed abandoned
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    #[serde(default)]
    pub stale_policy: StalePolicy,
}

fn default_stale_after() -> u64 {
    600
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            stale_policy: StalePolicy::default(),
        }
    }
}

impl LockConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_max_poll_interval")]
    pub max_interval_ms: u64,

    /// Growth factor applied to the interval after each miss (1.0 = fixed)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default)]
    pub jitter_ms: u64,
}

fn default_poll_interval() -> u64 {
    5_000
}
fn default_max_poll_interval() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    1.0
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            max_interval_ms: default_max_poll_interval(),
            multiplier: default_multiplier(),
            jitter_ms: 0,
        }
    }
}

impl PollConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.interval_ms))
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
            .with_multiplier(self.multiplier)
            .with_jitter(Duration::from_millis(self.jitter_ms))
    }
}

/// Upgrade protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// How long the leader waits for followers to acknowledge Prepare
    #[serde(default = "default_workers_ready_timeout")]
    pub workers_ready_timeout_secs: u64,

    /// How long the leader waits for followers to restart after Complete
    #[serde(default = "default_restart_timeout")]
    pub workers_restarted_timeout_secs: u64,

    /// How long the leader waits for the download lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

fn default_workers_ready_timeout() -> u64 {
    120
}
fn default_restart_timeout() -> u64 {
    300
}
fn default_lock_timeout() -> u64 {
    60
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            workers_ready_timeout_secs: default_workers_ready_timeout(),
            workers_restarted_timeout_secs: default_restart_timeout(),
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

/// Consuming service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unit name of the consuming service
    #[serde(default = "default_service_name")]
    pub name: String,

    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

fn default_service_name() -> String {
    "fleet-worker.service".to_string()
}
fn default_service_timeout() -> u64 {
    30
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            timeout_secs: default_service_timeout(),
        }
    }
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Minimal config for a peer on the given volume
    pub fn new(unit_name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            unit_name: unit_name.into(),
            holder_id: None,
            leader: false,
            volume: VolumeConfig {
                root: root.into(),
                id_source: FilesystemIdSource::default(),
                expected_filesystem_id: None,
                required_binaries: Vec::new(),
            },
            lock: LockConfig::default(),
            poll: PollConfig::default(),
            upgrade: UpgradeConfig::default(),
            service: ServiceConfig::default(),
            log_level: default_log_level(),
        }
    }

    /// Load config from an optional TOML file, then `FLEETSYNC__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.unit_name.trim().is_empty() {
            return Err(Error::InvalidConfig("unit_name cannot be empty".into()));
        }
        if !self.volume.root.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "volume root must be absolute: {}",
                self.volume.root.display()
            )));
        }
        if self.lock.stale_after_secs == 0 {
            return Err(Error::InvalidConfig(
                "lock.stale_after_secs must be positive".into(),
            ));
        }
        if self.poll.interval_ms == 0 {
            return Err(Error::InvalidConfig("poll.interval_ms must be positive".into()));
        }
        if self.poll.multiplier < 1.0 {
            return Err(Error::InvalidConfig(
                "poll.multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Identity written into the lock file
    pub fn holder_id(&self) -> String {
        self.holder_id
            .clone()
            .unwrap_or_else(|| self.unit_name.clone())
    }
}
