//! Process configuration (§4.6, §6): layered compile-time defaults, an
//! optional TOML file, and `NODEFORGE_*` environment overrides. The CLI
//! crate applies flag overrides last, on top of a loaded [`RuntimeConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::registry::RuntimeProfile;

const DEFAULT_MAX_IN_FLIGHT: usize = 100;
const MIN_MAX_IN_FLIGHT: usize = 1;
const MAX_MAX_IN_FLIGHT: usize = 1000;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config file at {path}: {message}")]
    File { path: String, message: String },
    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
    #[error("max_in_flight must be between {min} and {max}, got {value}")]
    MaxInFlightOutOfRange { value: usize, min: usize, max: usize },
}

/// Broker connection settings (§4.7, §6): bootstrap addresses and an
/// optional prefix applied to every contract's `consumer_group`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub bootstrap_servers: Vec<String>,
    #[serde(default)]
    pub consumer_group_prefix: Option<String>,
}

/// The fully resolved process configuration a `main`/`run` invocation
/// builds its [`crate::router::Router`] and [`crate::health::HealthMonitor`]
/// from.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: RuntimeProfile,
    pub contracts_dir: PathBuf,
    pub max_in_flight: usize,
    pub shutdown_grace_period: Duration,
    pub health_check_interval: Duration,
    pub broker: BrokerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            profile: RuntimeProfile::All,
            contracts_dir: PathBuf::from("contracts"),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            shutdown_grace_period: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            broker: BrokerConfig::default(),
        }
    }
}

/// TOML document shape: every field optional so a partial file only
/// overrides what it names, leaving the rest at their compile-time default.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    profile: Option<String>,
    contracts_dir: Option<String>,
    max_in_flight: Option<usize>,
    shutdown_grace_period_secs: Option<u64>,
    health_check_interval_secs: Option<u64>,
    #[serde(default)]
    broker: BrokerConfig,
}

impl RuntimeConfig {
    /// Builds the layered configuration: compile-time defaults, then an
    /// optional TOML file (if `path` is `Some` and exists), then
    /// `NODEFORGE_*` environment variables, each layer overriding only the
    /// fields it sets (§6).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = RuntimeConfig::default();

        if let Some(path) = path {
            config.apply_file(path)?;
        }

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        if let Some(profile) = raw.profile {
            self.profile = RuntimeProfile::parse(&profile)
                .ok_or_else(|| ConfigError::Invalid { field: "profile".to_string(), message: format!("unknown profile '{profile}'") })?;
        }
        if let Some(dir) = raw.contracts_dir {
            self.contracts_dir = PathBuf::from(dir);
        }
        if let Some(n) = raw.max_in_flight {
            self.max_in_flight = n;
        }
        if let Some(secs) = raw.shutdown_grace_period_secs {
            self.shutdown_grace_period = Duration::from_secs(secs);
        }
        if let Some(secs) = raw.health_check_interval_secs {
            self.health_check_interval = Duration::from_secs(secs);
        }
        if !raw.broker.bootstrap_servers.is_empty() {
            self.broker.bootstrap_servers = raw.broker.bootstrap_servers;
        }
        if raw.broker.consumer_group_prefix.is_some() {
            self.broker.consumer_group_prefix = raw.broker.consumer_group_prefix;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(profile) = std::env::var("NODEFORGE_PROFILE") {
            self.profile = RuntimeProfile::parse(&profile)
                .ok_or_else(|| ConfigError::Invalid { field: "NODEFORGE_PROFILE".to_string(), message: format!("unknown profile '{profile}'") })?;
        }
        if let Ok(dir) = std::env::var("NODEFORGE_CONTRACTS_DIR") {
            self.contracts_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = std::env::var("NODEFORGE_MAX_IN_FLIGHT") {
            self.max_in_flight = raw
                .parse()
                .map_err(|_| ConfigError::Invalid { field: "NODEFORGE_MAX_IN_FLIGHT".to_string(), message: format!("'{raw}' is not an integer") })?;
        }
        if let Ok(raw) = std::env::var("NODEFORGE_SHUTDOWN_GRACE_PERIOD_SECS") {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
                field: "NODEFORGE_SHUTDOWN_GRACE_PERIOD_SECS".to_string(),
                message: format!("'{raw}' is not an integer"),
            })?;
            self.shutdown_grace_period = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("NODEFORGE_HEALTH_CHECK_INTERVAL_SECS") {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
                field: "NODEFORGE_HEALTH_CHECK_INTERVAL_SECS".to_string(),
                message: format!("'{raw}' is not an integer"),
            })?;
            self.health_check_interval = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("NODEFORGE_BROKER_BOOTSTRAP_SERVERS") {
            self.broker.bootstrap_servers = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        }
        if let Ok(prefix) = std::env::var("NODEFORGE_CONSUMER_GROUP_PREFIX") {
            self.broker.consumer_group_prefix = Some(prefix);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight < MIN_MAX_IN_FLIGHT || self.max_in_flight > MAX_MAX_IN_FLIGHT {
            return Err(ConfigError::MaxInFlightOutOfRange {
                value: self.max_in_flight,
                min: MIN_MAX_IN_FLIGHT,
                max: MAX_MAX_IN_FLIGHT,
            });
        }
        Ok(())
    }

    /// Effective consumer group for a contract's declared `consumer_group`,
    /// applying `broker.consumer_group_prefix` when set (§6).
    pub fn consumer_group_for(&self, declared: &str) -> String {
        match &self.broker.consumer_group_prefix {
            Some(prefix) => format!("{prefix}-{declared}"),
            None => declared.to_string(),
        }
    }
}
