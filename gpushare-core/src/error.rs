//! Plugin error taxonomy
//!
//! Every error is either fatal (the process must stop before or while
//! advertising devices) or recoverable (absorbed inside the monitor loop).
//! Only the binary decides what to do with a fatal error.

use std::fmt;

use thiserror::Error;

use crate::device::DeviceError;

/// How an error must be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Abort the plugin
    Fatal,
    /// Log and keep going
    Recoverable,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Fatal => write!(f, "fatal"),
            Severity::Recoverable => write!(f, "recoverable"),
        }
    }
}

/// Errors surfaced by the catalog and the health monitor
#[derive(Debug, Error)]
pub enum PluginError {
    /// GPU enumeration failed
    #[error("Device discovery failed: {0}")]
    Discovery(#[source] DeviceError),

    /// Creating the XID event subscription failed
    #[error("Failed to create XID event subscription: {0}")]
    Subscription(#[source] DeviceError),

    /// Registering a device for XID events failed
    #[error("Failed to register {real_id} for XID events: {source}")]
    Registration {
        real_id: String,
        #[source]
        source: DeviceError,
    },

    /// Oversubscription setting is not an integer >= 1
    #[error("Invalid oversubscription factor {value:?}: {reason}")]
    InvalidOversubscription { value: String, reason: String },

    /// The notification consumer went away
    #[error("Notification channel closed")]
    NotificationChannelClosed,

    /// Device hardware cannot report XID events
    #[error("{real_id} does not support health checking")]
    TelemetryNotSupported { real_id: String },

    /// Waiting for the next XID event failed or timed out
    #[error("Event wait failed: {0}")]
    EventWait(#[source] DeviceError),
}

impl PluginError {
    /// Classify the error
    pub fn severity(&self) -> Severity {
        match self {
            PluginError::Discovery(_)
            | PluginError::Subscription(_)
            | PluginError::Registration { .. }
            | PluginError::InvalidOversubscription { .. }
            | PluginError::NotificationChannelClosed => Severity::Fatal,
            PluginError::TelemetryNotSupported { .. } | PluginError::EventWait(_) => {
                Severity::Recoverable
            }
        }
    }

    /// Shorthand for `severity() == Severity::Fatal`
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}
