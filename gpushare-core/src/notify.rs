//! Unhealthy-device notifications
//!
//! The monitor is the only writer and the device plugin's reporter the only
//! reader. How a slow reader affects the monitor is chosen explicitly with a
//! [`NotificationPolicy`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::catalog::VirtualDevice;
use crate::error::PluginError;

/// Default queue length for bounded policies
pub const DEFAULT_CAPACITY: usize = 64;

/// Why a device was reported unhealthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum UnhealthyReason {
    /// Hardware cannot report XID events; reported once at setup
    TelemetryNotSupported,
    /// Critical XID with no device attribution
    UnattributedFault { xid: u64 },
    /// Critical XID raised by this device's GPU
    DeviceFault { xid: u64 },
}

impl UnhealthyReason {
    /// Short label, used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            UnhealthyReason::TelemetryNotSupported => "not_supported",
            UnhealthyReason::UnattributedFault { .. } => "unattributed",
            UnhealthyReason::DeviceFault { .. } => "device_fault",
        }
    }
}

impl fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnhealthyReason::TelemetryNotSupported => write!(f, "health checking not supported"),
            UnhealthyReason::UnattributedFault { xid } => write!(f, "unattributed XID {}", xid),
            UnhealthyReason::DeviceFault { xid } => write!(f, "XID {}", xid),
        }
    }
}

/// A virtual device that must be reported unhealthy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub device: VirtualDevice,
    pub reason: UnhealthyReason,
    pub reported_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(device: &VirtualDevice, reason: UnhealthyReason) -> Self {
        Self {
            device: device.unhealthy(),
            reason,
            reported_at: Utc::now(),
        }
    }
}

/// Backpressure policy for the notification queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPolicy {
    /// Bounded queue; the monitor blocks while it is full
    Block { capacity: usize },
    /// Bounded queue; new notifications are dropped while it is full
    DropNewest { capacity: usize },
    /// No bound; memory grows with a stalled reader
    Unbounded,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        NotificationPolicy::Block {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Result of a successful `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue was full under [`NotificationPolicy::DropNewest`]
    Dropped,
}

enum SenderInner {
    Blocking(mpsc::Sender<Notification>),
    Dropping(mpsc::Sender<Notification>),
    Unbounded(mpsc::UnboundedSender<Notification>),
}

/// Writing half, used from the monitor's blocking thread
pub struct NotificationSender {
    inner: SenderInner,
}

impl NotificationSender {
    /// Queue a notification according to the policy.
    ///
    /// Must not be called from async code: the blocking policy parks the
    /// calling thread.
    pub fn send(&self, notification: Notification) -> Result<Delivery, PluginError> {
        match &self.inner {
            SenderInner::Blocking(tx) => tx
                .blocking_send(notification)
                .map(|_| Delivery::Queued)
                .map_err(|_| PluginError::NotificationChannelClosed),
            SenderInner::Dropping(tx) => match tx.try_send(notification) {
                Ok(()) => Ok(Delivery::Queued),
                Err(TrySendError::Full(_)) => Ok(Delivery::Dropped),
                Err(TrySendError::Closed(_)) => Err(PluginError::NotificationChannelClosed),
            },
            SenderInner::Unbounded(tx) => tx
                .send(notification)
                .map(|_| Delivery::Queued)
                .map_err(|_| PluginError::NotificationChannelClosed),
        }
    }
}

enum ReceiverInner {
    Bounded(mpsc::Receiver<Notification>),
    Unbounded(mpsc::UnboundedReceiver<Notification>),
}

/// Reading half, owned by the reporter
pub struct NotificationReceiver {
    inner: ReceiverInner,
}

impl NotificationReceiver {
    /// Wait for the next notification; `None` once the monitor is gone
    pub async fn recv(&mut self) -> Option<Notification> {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.recv().await,
            ReceiverInner::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Take a queued notification without waiting
    pub fn try_recv(&mut self) -> Option<Notification> {
        let result = match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.try_recv(),
            ReceiverInner::Unbounded(rx) => rx.try_recv(),
        };
        match result {
            Ok(notification) => Some(notification),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Create a notification queue with the given policy
///
/// A bounded capacity of 0 is raised to 1.
pub fn notification_channel(
    policy: NotificationPolicy,
) -> (NotificationSender, NotificationReceiver) {
    match policy {
        NotificationPolicy::Block { capacity } => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                NotificationSender {
                    inner: SenderInner::Blocking(tx),
                },
                NotificationReceiver {
                    inner: ReceiverInner::Bounded(rx),
                },
            )
        }
        NotificationPolicy::DropNewest { capacity } => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                NotificationSender {
                    inner: SenderInner::Dropping(tx),
                },
                NotificationReceiver {
                    inner: ReceiverInner::Bounded(rx),
                },
            )
        }
        NotificationPolicy::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                NotificationSender {
                    inner: SenderInner::Unbounded(tx),
                },
                NotificationReceiver {
                    inner: ReceiverInner::Unbounded(rx),
                },
            )
        }
    }
}
