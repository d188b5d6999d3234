//! Configuration for the circuit build orchestrator (`.circuit-ci.toml`).
//!
//! A top-level struct of nested, `#[serde(default)]` sub-configs, loaded
//! from a TOML file with `CliOverrides` applied on top, then validated
//! before use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A config value that would make the worker loop or store unusable.
/// Distinct from the ingest path's `ErrorKind::Input` failures (a bad
/// request body): a config problem is fatal to the whole process, found
/// once at startup rather than per-request.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("retry.backoff_base must be greater than 0")]
    ZeroBackoffBase,
    #[error("retry.backoff_cap must be >= retry.backoff_base")]
    BackoffCapBelowBase,
    #[error("worker.max_attempt_duration must be greater than 0")]
    ZeroMaxAttemptDuration,
    #[error("worker.idle_poll_interval must be greater than 0")]
    ZeroIdlePollInterval,
    #[error("fetch.max_archive_bytes must be greater than 0")]
    ZeroMaxArchiveBytes,
}

/// Accepts either a humantime string (`"20m"`) or a raw millisecond
/// integer when deserializing a duration field; always serializes back
/// as milliseconds.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

macro_rules! duration_field {
    ($default_fn:ident, $ms:expr) => {
        fn $default_fn() -> Duration {
            Duration::from_millis($ms)
        }
    };
}

duration_field!(default_max_attempt_duration, 20 * 60 * 1000);
duration_field!(default_backoff_base_ms, 1000);
duration_field!(default_backoff_cap_ms, 30_000);
duration_field!(default_idle_poll_interval_ms, 5000);

fn default_max_retries() -> u32 {
    3
}

fn default_max_archive_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir()
}

/// Retry/lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_backoff_base_ms"
    )]
    pub backoff_base: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_backoff_cap_ms"
    )]
    pub backoff_cap: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base_ms(),
            backoff_cap: default_backoff_cap_ms(),
        }
    }
}

/// Worker loop / lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_max_attempt_duration"
    )]
    pub max_attempt_duration: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_idle_poll_interval_ms"
    )]
    pub idle_poll_interval: Duration,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempt_duration: default_max_attempt_duration(),
            idle_poll_interval: default_idle_poll_interval_ms(),
            workspace_root: default_workspace_root(),
        }
    }
}

/// Fetch-step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_archive_bytes: default_max_archive_bytes(),
        }
    }
}

/// Provider credential configuration. Credentials are read once at
/// startup and passed per call; never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Credential used for out-of-band comments when the triggering
    /// user's credential is unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_credential: Option<String>,
}

/// Store location configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("circuit-ci.sqlite3"),
        }
    }
}

/// Top-level configuration, loaded from `.circuit-ci.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            fetch: FetchConfig::default(),
            provider: ProviderConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Overrides supplied on the CLI, applied on top of a loaded file (or the
/// defaults, if no file exists).
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_retries: Option<u32>,
    pub workspace_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a workspace root by searching for
    /// `.circuit-ci.toml`. Returns `Ok(None)` if no config file exists —
    /// defaults then apply.
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Option<Self>> {
        let config_path = workspace_root.join(".circuit-ci.toml");
        if !config_path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&config_path).map(Some)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(max_retries) = overrides.max_retries {
            self.retry.max_retries = max_retries;
        }
        if let Some(workspace_root) = &overrides.workspace_root {
            self.worker.workspace_root = workspace_root.clone();
        }
        if let Some(database_path) = &overrides.database_path {
            self.store.database_path = database_path.clone();
        }
    }

    /// Reject configuration values that would make the worker loop or
    /// store unusable. Schema/config mismatches are `ErrorKind::Fatal`
    /// — this is where that kind is raised.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.retry.backoff_base.is_zero() {
            return Err(ConfigError::ZeroBackoffBase);
        }
        if self.retry.backoff_cap < self.retry.backoff_base {
            return Err(ConfigError::BackoffCapBelowBase);
        }
        if self.worker.max_attempt_duration.is_zero() {
            return Err(ConfigError::ZeroMaxAttemptDuration);
        }
        if self.worker.idle_poll_interval.is_zero() {
            return Err(ConfigError::ZeroIdlePollInterval);
        }
        if self.fetch.max_archive_bytes == 0 {
            return Err(ConfigError::ZeroMaxArchiveBytes);
        }
        Ok(())
    }
}
