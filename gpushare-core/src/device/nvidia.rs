//! NVIDIA GPU device implementation
//!
//! Uses NVML (NVIDIA Management Library) for enumeration and XID events.

use std::time::Duration;

use async_trait::async_trait;
use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::error::{NvmlError, NvmlErrorWithSource};
use nvml_wrapper::event::EventSet;
use nvml_wrapper::Nvml;
use once_cell::sync::OnceCell;
use tracing::{debug, trace, warn};

use super::{
    DeviceError, DeviceInterface, DeviceType, FaultClass, FaultEvent, FaultEventSet,
    PhysicalDevice, RegistrationError, WaitError,
};
use crate::xid;

/// Global NVML instance
static NVML: OnceCell<Nvml> = OnceCell::new();

/// Get or initialize the global NVML instance
fn get_nvml() -> Result<&'static Nvml, DeviceError> {
    NVML.get_or_try_init(|| Nvml::init().map_err(|e| DeviceError::NvmlInitError(e.to_string())))
}

/// NVIDIA GPU device implementation
pub struct NvidiaDevice {
    nvml: &'static Nvml,
}

impl NvidiaDevice {
    /// Create a new NVIDIA device interface
    pub fn new() -> Result<Self, DeviceError> {
        let nvml = get_nvml()?;
        Ok(Self { nvml })
    }
}

#[async_trait]
impl DeviceInterface for NvidiaDevice {
    async fn device_count(&self) -> Result<u32, DeviceError> {
        self.nvml
            .device_count()
            .map_err(|e| DeviceError::QueryError(e.to_string()))
    }

    async fn device_by_index(&self, index: u32) -> Result<PhysicalDevice, DeviceError> {
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|e| DeviceError::DeviceNotFound(e.to_string()))?;

        let real_id = device
            .uuid()
            .map_err(|e| DeviceError::QueryError(e.to_string()))?;

        let name = device.name().unwrap_or_else(|e| {
            debug!(index = index, error = %e, "Failed to query device name");
            String::from("unknown")
        });

        Ok(PhysicalDevice {
            index,
            real_id,
            name,
        })
    }

    fn new_event_set(&self) -> Result<Box<dyn FaultEventSet>, DeviceError> {
        let set = self
            .nvml
            .create_event_set()
            .map_err(|e| DeviceError::EventError(e.to_string()))?;

        Ok(Box::new(NvmlEventSet {
            nvml: self.nvml,
            set: Some(set),
        }))
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Nvidia
    }
}

/// NVML event set registered for critical XID errors
struct NvmlEventSet {
    nvml: &'static Nvml,
    // NVML hands the set back from every registration, successful or not
    set: Option<EventSet<'static>>,
}

impl FaultEventSet for NvmlEventSet {
    fn register_critical_faults(&mut self, real_id: &str) -> Result<(), RegistrationError> {
        let device = self
            .nvml
            .device_by_uuid(real_id)
            .map_err(|e| DeviceError::DeviceNotFound(format!("{}: {}", real_id, e)))?;

        let set = self.set.take().ok_or_else(|| {
            DeviceError::EventError("event set was lost by an earlier registration".to_string())
        })?;

        match device.register_events(EventTypes::CRITICAL_XID_ERROR, set) {
            Ok(set) => {
                self.set = Some(set);
                trace!(device = %real_id, "Registered for critical XID events");
                Ok(())
            }
            Err(NvmlErrorWithSource { error, source }) => {
                self.set = source;
                match error {
                    NvmlError::NotSupported => Err(RegistrationError::NotSupported),
                    e => Err(DeviceError::EventError(e.to_string()).into()),
                }
            }
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<FaultEvent, WaitError> {
        let set = self
            .set
            .as_ref()
            .ok_or_else(|| DeviceError::EventError("event set is not available".to_string()))?;

        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);

        match set.wait(timeout_ms) {
            Ok(data) => {
                let fault_class = if data.event_type.contains(EventTypes::CRITICAL_XID_ERROR) {
                    FaultClass::Critical
                } else {
                    FaultClass::Other
                };

                let fault_code = data.event_data.unwrap_or_default();
                let real_id = match data.device.uuid() {
                    Ok(uuid) => Some(uuid),
                    Err(e) => {
                        warn!(
                            xid = fault_code,
                            error = %e,
                            "Cannot resolve faulting device UUID, treating XID as unattributed"
                        );
                        None
                    }
                };

                Ok(FaultEvent {
                    fault_code,
                    fault_class,
                    real_id,
                })
            }
            Err(NvmlError::Timeout) => Err(DeviceError::Timeout(timeout).into()),
            // The driver cannot say which GPU is gone
            Err(NvmlError::GpuLost) => Err(WaitError::with_event(
                FaultEvent::unattributed(xid::GPU_FALLEN_OFF_BUS),
                DeviceError::EventError(NvmlError::GpuLost.to_string()),
            )),
            Err(e) => Err(DeviceError::EventError(e.to_string()).into()),
        }
    }
}

impl Drop for NvmlEventSet {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            if let Err(e) = set.release_events() {
                warn!(error = %e, "Failed to release NVML event set");
            }
        }
    }
}
