//! gpushare Core Library
//!
//! Device virtualization and XID health monitoring for the gpushare device
//! plugin. This crate provides device abstraction, the virtual device catalog,
//! and the health monitor that reports unhealthy virtual devices.

pub mod catalog;
pub mod device;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod xid;

// Re-export common types
pub use catalog::{DeviceCatalog, DeviceInventory, Health, OversubscriptionFactor, VirtualDevice};
pub use device::{DeviceError, DeviceInterface, DeviceType, FaultEvent, PhysicalDevice};
pub use error::{PluginError, Severity};
pub use monitor::HealthMonitor;
pub use notify::{
    notification_channel, Notification, NotificationPolicy, NotificationReceiver,
    NotificationSender, UnhealthyReason,
};
