//! Device interface traits and common types
//!
//! Defines the hardware collaborator used by the catalog (enumeration) and by
//! the health monitor (critical XID event subscription).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Try NVIDIA, fall back to mock
    #[default]
    Auto,
    /// NVIDIA GPU through NVML
    Nvidia,
    /// In-process mock devices
    Mock,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Auto => write!(f, "auto"),
            DeviceType::Nvidia => write!(f, "nvidia"),
            DeviceType::Mock => write!(f, "mock"),
        }
    }
}

/// A physical GPU as reported by the hardware
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalDevice {
    /// Device index (0-based)
    pub index: u32,
    /// Hardware UUID, the identity every virtual device is derived from
    pub real_id: String,
    /// Device name/model
    pub name: String,
}

impl fmt::Display for PhysicalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU{} ({})", self.index, self.real_id)
    }
}

/// Class of a hardware event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultClass {
    /// Critical XID error
    Critical,
    /// Any other event type
    Other,
}

/// A single fault observation from the event subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultEvent {
    /// XID code
    pub fault_code: u64,
    /// Event class
    pub fault_class: FaultClass,
    /// UUID of the device that raised the event, if known
    pub real_id: Option<String>,
}

impl FaultEvent {
    /// Critical XID attributed to a device
    pub fn critical(fault_code: u64, real_id: impl Into<String>) -> Self {
        Self {
            fault_code,
            fault_class: FaultClass::Critical,
            real_id: Some(real_id.into()),
        }
    }

    /// Critical XID with no device attribution
    pub fn unattributed(fault_code: u64) -> Self {
        Self {
            fault_code,
            fault_class: FaultClass::Critical,
            real_id: None,
        }
    }

    /// Device UUID, treating an empty string as missing
    pub fn device_id(&self) -> Option<&str> {
        self.real_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Errors that can occur during device operations
#[derive(Debug, Error)]
pub enum DeviceError {
    /// NVML initialization failed
    #[error("Failed to initialize NVML: {0}")]
    NvmlInitError(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to query device
    #[error("Failed to query device: {0}")]
    QueryError(String),

    /// No event arrived within the wait timeout
    #[error("No event within {0:?}")]
    Timeout(Duration),

    /// Event subscription failure
    #[error("Event subscription error: {0}")]
    EventError(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Outcome of registering a device for critical XID events
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Device hardware cannot report XID events
    #[error("Not Supported")]
    NotSupported,

    /// Registration failed for any other reason
    #[error(transparent)]
    Failed(#[from] DeviceError),
}

/// A failed event wait
///
/// NVML can fail a wait and still hand back event data. When it does, the
/// event is kept so the caller can decide whether it still matters.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct WaitError {
    /// Event delivered alongside the error, if any
    pub event: Option<FaultEvent>,
    /// Underlying failure
    #[source]
    pub source: DeviceError,
}

impl WaitError {
    /// Attach an event to a wait failure
    pub fn with_event(event: FaultEvent, source: DeviceError) -> Self {
        Self {
            event: Some(event),
            source,
        }
    }

    /// Whether the wait simply expired
    pub fn is_timeout(&self) -> bool {
        matches!(self.source, DeviceError::Timeout(_))
    }

    /// The carried event, if it is a critical one
    pub fn critical_event(&self) -> Option<&FaultEvent> {
        self.event
            .as_ref()
            .filter(|e| e.fault_class == FaultClass::Critical)
    }
}

impl From<DeviceError> for WaitError {
    fn from(source: DeviceError) -> Self {
        Self {
            event: None,
            source,
        }
    }
}

/// Subscription to critical XID events
///
/// Dropping the set releases the underlying subscription.
pub trait FaultEventSet {
    /// Register a device (by UUID) for critical XID events
    fn register_critical_faults(&mut self, real_id: &str) -> Result<(), RegistrationError>;

    /// Block until the next event arrives or the timeout expires
    ///
    /// Expiry is reported as `DeviceError::Timeout` with no event.
    fn wait(&mut self, timeout: Duration) -> Result<FaultEvent, WaitError>;
}

/// Device interface trait
///
/// Implementations should be thread-safe. Event sets are created and used on
/// the monitor's own thread, so they do not need to be `Send`.
#[async_trait]
pub trait DeviceInterface: Send + Sync {
    /// Number of physical devices
    async fn device_count(&self) -> Result<u32, DeviceError>;

    /// Look up a physical device by index
    async fn device_by_index(&self, index: u32) -> Result<PhysicalDevice, DeviceError>;

    /// Create a new, empty event subscription
    fn new_event_set(&self) -> Result<Box<dyn FaultEventSet>, DeviceError>;

    /// Get the device type
    fn device_type(&self) -> DeviceType;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_device_display() {
        let device = PhysicalDevice {
            index: 0,
            real_id: "GPU-12345".to_string(),
            name: "Tesla V100".to_string(),
        };
        assert_eq!(format!("{}", device), "GPU0 (GPU-12345)");
    }

    #[test]
    fn test_fault_event_device_id() {
        assert_eq!(FaultEvent::critical(48, "GPU-1").device_id(), Some("GPU-1"));
        assert_eq!(FaultEvent::unattributed(48).device_id(), None);

        let empty = FaultEvent {
            fault_code: 48,
            fault_class: FaultClass::Critical,
            real_id: Some(String::new()),
        };
        assert_eq!(empty.device_id(), None);
    }

    #[test]
    fn test_registration_error_message() {
        assert_eq!(RegistrationError::NotSupported.to_string(), "Not Supported");
        let failed = RegistrationError::from(DeviceError::EventError("boom".to_string()));
        assert!(failed.to_string().contains("boom"));
    }

    #[test]
    fn test_wait_error_critical_event() {
        let timeout = WaitError::from(DeviceError::Timeout(Duration::from_secs(1)));
        assert!(timeout.is_timeout());
        assert!(timeout.critical_event().is_none());

        let lost = WaitError::with_event(
            FaultEvent::unattributed(79),
            DeviceError::EventError("GPU is lost".to_string()),
        );
        assert!(!lost.is_timeout());
        assert_eq!(lost.critical_event().map(|e| e.fault_code), Some(79));
        assert_eq!(lost.to_string(), "Event subscription error: GPU is lost");

        let other = WaitError::with_event(
            FaultEvent {
                fault_code: 0,
                fault_class: FaultClass::Other,
                real_id: None,
            },
            DeviceError::EventError("unknown".to_string()),
        );
        assert!(other.critical_event().is_none());
    }
}
