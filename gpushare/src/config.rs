//! Configuration module for gpushare
//!
//! Handles loading and validating configuration from YAML files.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Device backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Try NVIDIA, fall back to mock
    #[default]
    Auto,
    /// NVIDIA GPU
    Nvidia,
    /// Mock devices (development only)
    Mock,
}

/// What the monitor does when the reporter falls behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Block the monitor until there is room
    #[default]
    Block,
    /// Drop the newest notification
    DropNewest,
    /// Never block, never drop
    Unbounded,
}

/// Notification queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Backpressure policy
    #[serde(default)]
    pub policy: BackpressurePolicy,

    /// Queue capacity for bounded policies
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            policy: BackpressurePolicy::default(),
            capacity: default_capacity(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device backend
    #[serde(default)]
    pub device_type: DeviceType,

    /// Upper bound on one XID event wait, and on shutdown latency
    #[serde(with = "humantime_serde", default = "default_event_timeout")]
    pub event_timeout: Duration,

    /// Notification queue configuration
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            event_timeout: default_event_timeout(),
            notifications: NotificationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.event_timeout.is_zero() {
            anyhow::bail!("event_timeout must be > 0");
        }
        if self.event_timeout.as_millis() > u128::from(u32::MAX) {
            anyhow::bail!("event_timeout must fit in u32 milliseconds");
        }
        if self.notifications.policy != BackpressurePolicy::Unbounded
            && self.notifications.capacity == 0
        {
            anyhow::bail!("notifications.capacity must be > 0 for bounded policies");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        Ok(())
    }
}

// Default value functions
fn default_event_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_capacity() -> usize {
    64
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_true() -> bool {
    true
}
