//! Device catalog
//!
//! Enumerates physical GPUs and expands each one into `factor` virtual
//! devices, the list advertised to the orchestrator.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::device::{DeviceInterface, PhysicalDevice};
use crate::error::PluginError;
use crate::identity;

/// Advertised health of a virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "Healthy"),
            Health::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// One oversubscribed allocation slot on a physical GPU
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualDevice {
    /// Virtual device ID, see [`identity::encode`]
    pub id: String,
    pub health: Health,
}

impl VirtualDevice {
    /// Physical device UUID this virtual device was derived from
    pub fn real_id(&self) -> &str {
        identity::decode(&self.id)
    }

    /// Copy of this device marked unhealthy
    pub fn unhealthy(&self) -> Self {
        Self {
            id: self.id.clone(),
            health: Health::Unhealthy,
        }
    }
}

/// Number of virtual devices created per physical GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OversubscriptionFactor(NonZeroU32);

impl OversubscriptionFactor {
    pub const ONE: Self = Self(NonZeroU32::MIN);

    /// Largest accepted factor; every virtual device is held in memory and
    /// advertised to the orchestrator.
    pub const MAX: u32 = 1024;

    /// `None` for 0 or anything above [`Self::MAX`]
    pub fn new(factor: u32) -> Option<Self> {
        if factor > Self::MAX {
            return None;
        }
        NonZeroU32::new(factor).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Parse the raw external setting.
    ///
    /// `None` means unset and yields 1. Anything that is not a decimal
    /// integer in `1..=MAX` is a fatal configuration error.
    pub fn from_setting(value: Option<&str>) -> Result<Self, PluginError> {
        let Some(raw) = value else {
            return Ok(Self::ONE);
        };

        let invalid = |reason: String| PluginError::InvalidOversubscription {
            value: raw.to_string(),
            reason,
        };

        let parsed: i64 = raw
            .trim()
            .parse()
            .map_err(|e| invalid(format!("not an integer ({})", e)))?;

        if parsed < 1 {
            return Err(invalid("must be >= 1".to_string()));
        }

        u32::try_from(parsed)
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| invalid(format!("must be <= {}", Self::MAX)))
    }
}

impl Default for OversubscriptionFactor {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for OversubscriptionFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Expand physical devices into virtual devices.
///
/// Replica-major order: every device's replica 0, then every device's
/// replica 1, and so on.
pub fn virtualize(
    physical: &[PhysicalDevice],
    factor: OversubscriptionFactor,
) -> Vec<VirtualDevice> {
    let mut devices = Vec::with_capacity(physical.len().saturating_mul(factor.get() as usize));

    for replica in 0..factor.get() {
        for device in physical {
            devices.push(VirtualDevice {
                id: identity::encode(&device.real_id, replica),
                health: Health::Healthy,
            });
        }
    }

    devices
}

/// Result of a catalog build
#[derive(Debug, Clone)]
pub struct DeviceInventory {
    pub physical: Vec<PhysicalDevice>,
    /// Advertised virtual devices, replica-major
    pub devices: Vec<VirtualDevice>,
}

/// Discovers GPUs through the device interface
pub struct DeviceCatalog {
    device: Arc<dyn DeviceInterface>,
}

impl DeviceCatalog {
    pub fn new(device: Arc<dyn DeviceInterface>) -> Self {
        Self { device }
    }

    /// List physical devices in index order
    pub async fn enumerate_physical(&self) -> Result<Vec<PhysicalDevice>, PluginError> {
        let count = self
            .device
            .device_count()
            .await
            .map_err(PluginError::Discovery)?;

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self
                .device
                .device_by_index(index)
                .await
                .map_err(PluginError::Discovery)?;
            debug!(device = %device, name = %device.name, "Found physical device");
            devices.push(device);
        }

        Ok(devices)
    }

    /// Enumerate and virtualize in one step
    pub async fn build(
        &self,
        factor: OversubscriptionFactor,
    ) -> Result<DeviceInventory, PluginError> {
        let physical = self.enumerate_physical().await?;
        let devices = virtualize(&physical, factor);

        info!(
            backend = %self.device.device_type(),
            physical = physical.len(),
            factor = factor.get(),
            virtual_devices = devices.len(),
            "Built device catalog"
        );
        for device in &devices {
            info!(device = %device.id, "Device ID");
        }

        Ok(DeviceInventory { physical, devices })
    }
}
