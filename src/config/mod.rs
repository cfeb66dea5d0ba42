//! Engine configuration.
//!
//! Aggregates every tunable the dispatcher, subscriber, mutex, transport
//! and store need into a single [`EngineConfig`], loadable from a YAML
//! file plus environment overrides.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default configuration file name, used when [`CONFIG_ENV_VAR`] is unset.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable naming an explicit config file path.
pub const CONFIG_ENV_VAR: &str = "SAGA_ENGINE_CONFIG";
/// Prefix for environment variable overrides (`SAGA_ENGINE__DISPATCHER__POOL_SIZE`, ...).
pub const CONFIG_ENV_PREFIX: &str = "SAGA_ENGINE";

/// Dispatcher and subscriber loop tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Bounded worker pool size (`max_tasks_in_progress`).
    pub pool_size: usize,
    /// Seconds to wait for an incoming envelope before giving up a held slot.
    pub schedule_timeout_secs: u64,
    /// Seconds allowed for one turn before it is abandoned unacked.
    pub package_processing_max_time_secs: u64,
    /// Seconds to wait for in-flight turns to finish during shutdown.
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: 100,
            schedule_timeout_secs: 3,
            package_processing_max_time_secs: 60,
            graceful_shutdown_timeout_secs: 120,
        }
    }
}

impl DispatcherConfig {
    pub fn schedule_timeout(&self) -> Duration {
        Duration::from_secs(self.schedule_timeout_secs)
    }

    pub fn package_processing_max_time(&self) -> Duration {
        Duration::from_secs(self.package_processing_max_time_secs)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}

/// Distributed mutex tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MutexConfig {
    /// Lease duration granted to a saga lock before it expires unattended.
    pub lock_ttl_secs: u64,
    /// Grace period allowed for releasing a lock after a turn.
    pub release_grace_secs: u64,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 30,
            release_grace_secs: 30,
        }
    }
}

impl MutexConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_secs(self.release_grace_secs)
    }
}

/// Transport connection settings. `kind` selects the backend; the
/// irrelevant fields for a given kind are simply left at their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// "channel" (in-process) or "amqp".
    pub kind: String,
    /// AMQP connection URL, required when `kind` is "amqp".
    pub amqp_url: Option<String>,
    /// Consumer prefetch count, mirrors the dispatcher pool size by default.
    pub prefetch: Option<u16>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: "channel".to_string(),
            amqp_url: None,
            prefetch: None,
        }
    }
}

/// Storage connection settings. `kind` selects the SQL backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "postgres" or "sqlite".
    pub kind: String,
    /// Connection URL (Postgres DSN or SQLite file path).
    pub connection_url: String,
    /// Pool size passed to `sqlx::PoolOptions`.
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: "sqlite".to_string(),
            connection_url: "sqlite://./data/sagas.db".to_string(),
            max_connections: 10,
        }
    }
}

/// Aggregates every tunable the engine needs to run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub mutex: MutexConfig,
    pub transport: TransportConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Loads configuration from, in increasing priority:
    /// 1. compiled-in defaults
    /// 2. `config.yaml` in the current directory, if present
    /// 3. the file named by [`CONFIG_ENV_VAR`], if set
    /// 4. environment variables prefixed `SAGA_ENGINE__`
    pub fn load() -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigSource, Environment, File, FileFormat};

        let mut builder = ConfigSource::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&path, FileFormat::Yaml).required(true));
        }

        let source = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        source
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads from an explicit YAML file only, ignoring the environment
    /// lookup in [`load`]. Environment variable overrides still apply.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigSource, Environment, File, FileFormat};

        let source = ConfigSource::builder()
            .add_source(File::new(path, FileFormat::Yaml).required(true))
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        source
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to assemble configuration sources: {0}")]
    Load(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}
