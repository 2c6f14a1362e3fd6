//! Agent configuration
//!
//! Values come from the defaults below, then an optional JSON file, then
//! `APM_AGENT_*` environment variables. Command line flags are applied last
//! by the binary.

use crate::domain::ConfigError;
use apm_agent_common::COORDINATOR_QUEUE_CAPACITY;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "APM_AGENT_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub transport: TransportConfig,
    pub periodic: PeriodicConfig,
    pub coordinator: CoordinatorConfig,
    /// `env_logger` filter used when `RUST_LOG` is not set
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            periodic: PeriodicConfig::default(),
            coordinator: CoordinatorConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bytes of queued payloads above which new payloads are dropped
    pub max_send_queue_size: usize,
    /// How long shutdown keeps draining the queue; 0 drains until empty
    pub shutdown_drain_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { max_send_queue_size: 2 * 1024 * 1024, shutdown_drain_timeout_ms: 5_000 }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodicConfig {
    pub interval_ms: u64,
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self { interval_ms: 20 }
    }
}

impl PeriodicConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Period of the parent liveness check
    pub maintenance_interval_ms: u64,
    /// Bounded wait of one receive on the IPC channel
    pub receive_timeout_ms: u64,
    /// Minimum time between two sweeps of abandoned partial messages
    pub cleanup_interval_ms: u64,
    /// Partial messages idle for longer than this are discarded
    pub abandoned_message_max_age_ms: u64,
    /// Frames the IPC channel can hold
    pub queue_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_ms: 100,
            receive_timeout_ms: 10,
            cleanup_interval_ms: 60_000,
            abandoned_message_max_age_ms: 10_000,
            queue_capacity: COORDINATOR_QUEUE_CAPACITY,
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    #[must_use]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    #[must_use]
    pub fn abandoned_message_max_age(&self) -> Duration {
        Duration::from_millis(self.abandoned_message_max_age_ms)
    }
}

impl AgentConfig {
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or is not valid JSON.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Defaults, then `file` when given, then the process environment
    ///
    /// # Errors
    ///
    /// Returns an error for an unreadable file or an invalid override.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply `APM_AGENT_*` overrides found through `lookup`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first variable that
    /// does not parse.
    pub fn apply_overrides<L>(&mut self, lookup: L) -> Result<(), ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let env = Overrides { lookup };

        env.apply("MAX_SEND_QUEUE_SIZE", &mut self.transport.max_send_queue_size)?;
        env.apply("SHUTDOWN_DRAIN_TIMEOUT_MS", &mut self.transport.shutdown_drain_timeout_ms)?;
        env.apply("PERIODIC_INTERVAL_MS", &mut self.periodic.interval_ms)?;
        env.apply("COORDINATOR_MAINTENANCE_INTERVAL_MS", &mut self.coordinator.maintenance_interval_ms)?;
        env.apply("COORDINATOR_RECEIVE_TIMEOUT_MS", &mut self.coordinator.receive_timeout_ms)?;
        env.apply("COORDINATOR_CLEANUP_INTERVAL_MS", &mut self.coordinator.cleanup_interval_ms)?;
        env.apply("COORDINATOR_ABANDONED_MESSAGE_MAX_AGE_MS", &mut self.coordinator.abandoned_message_max_age_ms)?;
        env.apply("COORDINATOR_QUEUE_CAPACITY", &mut self.coordinator.queue_capacity)?;
        if let Some(level) = env.get("LOG_LEVEL") {
            self.log_level = level;
        }

        self.validate()
    }

    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name: &str, value: u64| {
            if value == 0 {
                Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                })
            } else {
                Ok(())
            }
        };

        positive("periodic.interval_ms", self.periodic.interval_ms)?;
        positive("coordinator.maintenance_interval_ms", self.coordinator.maintenance_interval_ms)?;
        positive("coordinator.receive_timeout_ms", self.coordinator.receive_timeout_ms)?;
        positive("coordinator.queue_capacity", self.coordinator.queue_capacity as u64)
    }
}

struct Overrides<L> {
    lookup: L,
}

impl<L: Fn(&str) -> Option<String>> Overrides<L> {
    fn get(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{suffix}"))
    }

    fn apply<T>(&self, suffix: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.get(suffix) else {
            return Ok(());
        };
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name: format!("{ENV_PREFIX}{suffix}"),
            value: raw.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}
