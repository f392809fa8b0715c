//! Runtime configuration.
//!
//! Loaded from the YAML file named by `TETHER_CONFIG`, or defaults when the
//! variable is unset. Durations are expressed in milliseconds.

use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;

/// Environment variable naming the YAML configuration file.
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub client: ClientConfig,
    pub demo: DemoConfig,
}

/// Idle-connection pool limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum idle connections kept per destination.
    pub per_destination_idle_cap: usize,
    /// Maximum idle connections kept across all destinations.
    pub global_idle_cap: usize,
    /// How long a connection may sit idle before it is evicted.
    #[serde(rename = "idle_timeout_ms", with = "millis")]
    pub idle_timeout: Duration,
    /// Interval of the background idle sweep, if any.
    #[serde(rename = "sweep_interval_ms", with = "opt_millis")]
    pub sweep_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            per_destination_idle_cap: 2,
            global_idle_cap: 16,
            idle_timeout: Duration::from_secs(90),
            sweep_interval: None,
        }
    }
}

/// Request execution and release settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Unread body bytes above which release closes instead of draining.
    pub max_drain_bytes: u64,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Deadline for writing the request and reading the response head.
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    /// Deadline for each body read, including drains.
    #[serde(rename = "read_timeout_ms", with = "millis")]
    pub read_timeout: Duration,
    pub max_header_bytes: usize,
    /// Retry once on a fresh connection when a pooled one turns out stale.
    pub retry_stale_connections: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_drain_bytes: 64 * 1024,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            max_header_bytes: 64 * 1024,
            retry_stale_connections: true,
        }
    }
}

/// Settings for the leak demonstration binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub url: String,
    pub requests: usize,
    /// Release each response after reading it.
    pub release: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            url: "http://example.com/".to_string(),
            requests: 6,
            release: true,
        }
    }
}

impl Config {
    /// Load the configuration named by `TETHER_CONFIG`, or the defaults.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        Self::from_yaml_str(&raw).with_context(|| format!("Invalid config file {}", path))
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).context("Failed to parse YAML config")
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
