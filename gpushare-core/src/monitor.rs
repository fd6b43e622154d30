//! XID health monitor
//!
//! Subscribes to critical XID events for every physical GPU behind the
//! virtual device list and reports the affected virtual devices as unhealthy.
//!
//! The loop blocks in the NVML event wait, so it runs on a blocking thread.
//! Cancellation is only observed between waits; latency is bounded by the
//! event timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::catalog::VirtualDevice;
use crate::device::{DeviceInterface, FaultClass, FaultEvent, RegistrationError, WaitError};
use crate::error::PluginError;
use crate::metrics::{MetricsRegistry, XidDisposition};
use crate::notify::{Delivery, Notification, NotificationSender, UnhealthyReason};
use crate::xid;

/// Default upper bound on a single event wait
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Watches XID events and emits unhealthy virtual devices
pub struct HealthMonitor {
    device: Arc<dyn DeviceInterface>,
    metrics: Arc<MetricsRegistry>,
    event_timeout: Duration,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(device: Arc<dyn DeviceInterface>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            device,
            metrics,
            event_timeout: DEFAULT_EVENT_TIMEOUT,
        }
    }

    /// Override the event wait timeout
    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    /// Run the monitor on the blocking thread pool
    pub fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
        devices: Arc<[VirtualDevice]>,
        notifications: NotificationSender,
    ) -> JoinHandle<Result<(), PluginError>> {
        tokio::task::spawn_blocking(move || self.run(shutdown, &devices, &notifications))
    }

    /// Run the monitor on the current thread until cancelled.
    ///
    /// Returns `Ok(())` on cancellation. Any error returned is fatal. The
    /// event subscription is released on every exit path.
    pub fn run(
        &self,
        shutdown: watch::Receiver<bool>,
        devices: &[VirtualDevice],
        notifications: &NotificationSender,
    ) -> Result<(), PluginError> {
        let mut events = self
            .device
            .new_event_set()
            .map_err(PluginError::Subscription)?;

        // Replicas share a physical GPU; register each real ID once.
        let mut supported: HashMap<&str, bool> = HashMap::new();
        let mut monitored: Vec<&VirtualDevice> = Vec::with_capacity(devices.len());

        for device in devices {
            let real_id = device.real_id();

            let is_supported = match supported.get(real_id) {
                Some(&known) => known,
                None => {
                    let outcome = match events.register_critical_faults(real_id) {
                        Ok(()) => true,
                        Err(RegistrationError::NotSupported) => false,
                        Err(RegistrationError::Failed(source)) => {
                            return Err(PluginError::Registration {
                                real_id: real_id.to_string(),
                                source,
                            });
                        }
                    };
                    supported.insert(real_id, outcome);
                    outcome
                }
            };

            if is_supported {
                monitored.push(device);
            } else {
                let err = PluginError::TelemetryNotSupported {
                    real_id: real_id.to_string(),
                };
                warn!(
                    device = %device.id,
                    error = %err,
                    "Device is too old to support health checking, marking it unhealthy"
                );
                self.emit(notifications, device, UnhealthyReason::TelemetryNotSupported)?;
            }
        }

        self.metrics.set_monitored_devices(monitored.len() as i64);
        info!(
            monitored = monitored.len(),
            unsupported = devices.len() - monitored.len(),
            timeout = ?self.event_timeout,
            "Watching for critical XID events"
        );

        loop {
            if is_cancelled(&shutdown) {
                info!("Shutdown signal received, stopping health monitor");
                return Ok(());
            }

            let event = match events.wait(self.event_timeout) {
                Ok(event) => event,
                Err(err) if err.is_timeout() => continue,
                Err(WaitError { event, source }) => {
                    self.metrics.inc_event_wait_error();
                    match event.filter(|e| e.fault_class == FaultClass::Critical) {
                        // A critical event still counts even when the wait failed
                        Some(event) => {
                            debug!(
                                error = %source,
                                xid = event.fault_code,
                                "XID event wait failed with a critical event"
                            );
                            event
                        }
                        None => {
                            let err = PluginError::EventWait(source);
                            debug!(
                                error = %err,
                                severity = %err.severity(),
                                "XID event wait failed"
                            );
                            continue;
                        }
                    }
                }
            };

            self.handle_event(&event, &monitored, notifications)?;
        }
    }

    /// Map one event onto the monitored devices; returns the number emitted
    fn handle_event(
        &self,
        event: &FaultEvent,
        monitored: &[&VirtualDevice],
        notifications: &NotificationSender,
    ) -> Result<usize, PluginError> {
        let code = event.fault_code;

        if xid::is_benign_application_fault(code) {
            self.metrics.inc_xid_event(code, XidDisposition::Benign);
            debug!(
                xid = code,
                description = xid::describe(code),
                device = ?event.real_id,
                "Application-level XID, device stays healthy"
            );
            return Ok(0);
        }

        let Some(real_id) = event.device_id() else {
            self.metrics.inc_xid_event(code, XidDisposition::Unattributed);
            warn!(
                xid = code,
                description = xid::describe(code),
                devices = monitored.len(),
                "XID event without a device, marking all devices unhealthy"
            );
            let reason = UnhealthyReason::UnattributedFault { xid: code };
            for device in monitored {
                self.emit(notifications, device, reason)?;
            }
            return Ok(monitored.len());
        };

        self.metrics.inc_xid_event(code, XidDisposition::Attributed);

        let mut emitted = 0;
        for device in monitored.iter().filter(|d| d.real_id() == real_id) {
            warn!(
                device = %device.id,
                xid = code,
                description = xid::describe(code),
                "Critical XID error, marking device unhealthy"
            );
            self.emit(notifications, device, UnhealthyReason::DeviceFault { xid: code })?;
            emitted += 1;
        }

        if emitted == 0 {
            trace!(xid = code, device = %real_id, "XID event for an unmonitored device");
        }

        Ok(emitted)
    }

    fn emit(
        &self,
        notifications: &NotificationSender,
        device: &VirtualDevice,
        reason: UnhealthyReason,
    ) -> Result<(), PluginError> {
        match notifications.send(Notification::new(device, reason))? {
            Delivery::Queued => self.metrics.inc_unhealthy(&reason),
            Delivery::Dropped => {
                self.metrics.inc_dropped_notification();
                warn!(device = %device.id, reason = %reason, "Notification queue full, dropping");
            }
        }
        Ok(())
    }
}

/// Non-blocking check; a dropped sender also counts as cancellation
fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{virtualize, OversubscriptionFactor};
    use crate::device::{MockDevice, PhysicalDevice};
    use crate::notify::{notification_channel, NotificationPolicy, NotificationReceiver};
    use tokio_test::assert_ok;

    struct Harness {
        mock: Arc<MockDevice>,
        monitor: HealthMonitor,
        devices: Vec<VirtualDevice>,
    }

    fn harness(uuids: &[&str], factor: u32) -> Harness {
        let mock = Arc::new(MockDevice::with_uuids(uuids.iter().copied()));
        let physical: Vec<PhysicalDevice> = uuids
            .iter()
            .enumerate()
            .map(|(i, id)| PhysicalDevice {
                index: i as u32,
                real_id: id.to_string(),
                name: "Mock GPU".to_string(),
            })
            .collect();
        let devices = virtualize(&physical, OversubscriptionFactor::new(factor).unwrap());
        let monitor = HealthMonitor::new(mock.clone(), Arc::new(MetricsRegistry::new()))
            .with_event_timeout(Duration::from_millis(10));

        Harness {
            mock,
            monitor,
            devices,
        }
    }

    /// Signal cancellation once the mock has served `waits` waits
    fn cancel_after(mock: &MockDevice, waits: u32) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        mock.on_wait(move |count| {
            if count >= waits {
                let _ = tx.send(true);
            }
        });
        rx
    }

    fn drain(rx: &mut NotificationReceiver) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Some(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    fn ids(notifications: &[Notification]) -> Vec<&str> {
        notifications.iter().map(|n| n.device.id.as_str()).collect()
    }

    #[test]
    fn test_unattributed_fault_marks_every_device() {
        let h = harness(&["GPU-A", "GPU-B", "GPU-C"], 1);
        h.mock.push_event(FaultEvent::unattributed(48));
        let shutdown = cancel_after(&h.mock, 1);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));

        let out = drain(&mut rx);
        assert_eq!(ids(&out), ["GPU-A-_-0", "GPU-B-_-0", "GPU-C-_-0"]);
        assert!(out
            .iter()
            .all(|n| n.reason == UnhealthyReason::UnattributedFault { xid: 48 }));
    }

    #[test]
    fn test_empty_device_id_is_unattributed() {
        let h = harness(&["GPU-A", "GPU-B"], 1);
        h.mock.push_event(FaultEvent::critical(79, ""));
        let shutdown = cancel_after(&h.mock, 1);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn test_attributed_fault_marks_every_replica() {
        let h = harness(&["GPU-U", "GPU-V"], 3);
        h.mock.push_event(FaultEvent::critical(79, "GPU-U"));
        let shutdown = cancel_after(&h.mock, 1);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));

        let out = drain(&mut rx);
        assert_eq!(ids(&out), ["GPU-U-_-0", "GPU-U-_-1", "GPU-U-_-2"]);
        assert!(out.iter().all(|n| n.reason == UnhealthyReason::DeviceFault { xid: 79 }));
        assert!(out.iter().all(|n| n.device.health == crate::catalog::Health::Unhealthy));
    }

    #[test]
    fn test_fault_on_unknown_device_emits_nothing() {
        let h = harness(&["GPU-A"], 2);
        h.mock.push_event(FaultEvent::critical(79, "GPU-OTHER"));
        let shutdown = cancel_after(&h.mock, 1);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_benign_xids_are_ignored() {
        let h = harness(&["GPU-A"], 1);
        for code in [31, 43, 45, 13] {
            h.mock.push_event(FaultEvent::critical(code, "GPU-A"));
        }
        let shutdown = cancel_after(&h.mock, 4);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));

        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].reason, UnhealthyReason::DeviceFault { xid: 13 });
    }

    #[test]
    fn test_wait_errors_are_absorbed() {
        let h = harness(&["GPU-A"], 1);
        h.mock.push_wait_error("transient");
        h.mock.push_event(FaultEvent::critical(79, "GPU-A"));
        let shutdown = cancel_after(&h.mock, 4);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));

        assert_eq!(drain(&mut rx).len(), 1);
        // two trailing waits timed out without emitting
        assert_eq!(h.mock.wait_count(), 4);
    }

    #[test]
    fn test_critical_event_with_wait_error_is_handled() {
        let h = harness(&["GPU-A", "GPU-B"], 2);
        h.mock
            .push_wait_error_with_event(FaultEvent::critical(48, "GPU-B"), "driver hiccup");
        h.mock.push_wait_error_with_event(FaultEvent::unattributed(79), "GPU is lost");
        let shutdown = cancel_after(&h.mock, 2);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));

        let out = drain(&mut rx);
        let (attributed, lost) = out.split_at(2);
        assert_eq!(ids(attributed), ["GPU-B-_-0", "GPU-B-_-1"]);
        assert!(attributed
            .iter()
            .all(|n| n.reason == UnhealthyReason::DeviceFault { xid: 48 }));
        assert_eq!(lost.len(), 4);
        assert!(lost
            .iter()
            .all(|n| n.reason == UnhealthyReason::UnattributedFault { xid: 79 }));
    }

    #[test]
    fn test_non_critical_event_with_wait_error_is_skipped() {
        let h = harness(&["GPU-A"], 1);
        let other = FaultEvent {
            fault_code: 48,
            fault_class: FaultClass::Other,
            real_id: Some("GPU-A".to_string()),
        };
        h.mock.push_wait_error_with_event(other, "unknown");
        let shutdown = cancel_after(&h.mock, 1);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_event_set_failure_is_fatal() {
        let h = harness(&["GPU-A", "GPU-B"], 2);
        h.mock.set_fail_event_set(true);
        let (_cancel, shutdown) = watch::channel(false);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        let err = h.monitor.run(shutdown, &h.devices, &tx).unwrap_err();
        assert!(matches!(err, PluginError::Subscription(_)));
        assert!(err.is_fatal());
        assert!(h.mock.registered().is_empty());
        assert_eq!(h.mock.wait_count(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_cancel_between_waits_stops_and_releases() {
        let h = harness(&["GPU-A"], 2);
        h.mock.push_event(FaultEvent::critical(79, "GPU-A"));
        h.mock.push_event(FaultEvent::critical(79, "GPU-A"));
        let shutdown = cancel_after(&h.mock, 1);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));

        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(h.mock.wait_count(), 1);
        assert_eq!(h.mock.pending_events(), 1);
        assert_eq!(h.mock.sets_created(), 1);
        assert_eq!(h.mock.sets_released(), 1);
    }

    #[test]
    fn test_cancelled_before_first_wait() {
        let h = harness(&["GPU-A"], 1);
        let (cancel, shutdown) = watch::channel(false);
        cancel.send(true).unwrap();
        let (tx, _rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));
        assert_eq!(h.mock.registered(), ["GPU-A"]);
        assert_eq!(h.mock.wait_count(), 0);
        assert_eq!(h.mock.sets_released(), 1);
    }

    #[test]
    fn test_dropped_shutdown_sender_stops_monitor() {
        let h = harness(&["GPU-A"], 1);
        let (cancel, shutdown) = watch::channel(false);
        drop(cancel);
        let (tx, _rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));
        assert_eq!(h.mock.wait_count(), 0);
    }

    #[test]
    fn test_not_supported_reported_once_and_skipped() {
        let h = harness(&["GPU-OLD", "GPU-NEW"], 2);
        h.mock.mark_unsupported("GPU-OLD");
        h.mock.push_event(FaultEvent::unattributed(79));
        h.mock.push_event(FaultEvent::critical(48, "GPU-OLD"));
        let shutdown = cancel_after(&h.mock, 2);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));

        let out = drain(&mut rx);
        let (setup, events) = out.split_at(2);
        assert_eq!(ids(setup), ["GPU-OLD-_-0", "GPU-OLD-_-1"]);
        assert!(setup
            .iter()
            .all(|n| n.reason == UnhealthyReason::TelemetryNotSupported));
        assert_eq!(ids(events), ["GPU-NEW-_-0", "GPU-NEW-_-1"]);
        assert_eq!(h.mock.registered(), ["GPU-NEW"]);
    }

    #[test]
    fn test_registration_failure_is_fatal() {
        let h = harness(&["GPU-A", "GPU-B"], 1);
        h.mock.mark_registration_failure("GPU-B");
        let (_cancel, shutdown) = watch::channel(false);
        let (tx, _rx) = notification_channel(NotificationPolicy::Unbounded);

        let err = h.monitor.run(shutdown, &h.devices, &tx).unwrap_err();
        match &err {
            PluginError::Registration { real_id, .. } => assert_eq!(real_id, "GPU-B"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.is_fatal());
        assert_eq!(h.mock.wait_count(), 0);
        assert_eq!(h.mock.sets_released(), 1);
    }

    #[test]
    fn test_closed_channel_stops_monitor() {
        let h = harness(&["GPU-A"], 1);
        h.mock.push_event(FaultEvent::critical(79, "GPU-A"));
        let (_cancel, shutdown) = watch::channel(false);
        let (tx, rx) = notification_channel(NotificationPolicy::Unbounded);
        drop(rx);

        let err = h.monitor.run(shutdown, &h.devices, &tx).unwrap_err();
        assert!(matches!(err, PluginError::NotificationChannelClosed));
        assert_eq!(h.mock.sets_released(), 1);
    }

    #[test]
    fn test_repeated_faults_are_reported_again() {
        let h = harness(&["GPU-A"], 1);
        h.mock.push_event(FaultEvent::critical(79, "GPU-A"));
        h.mock.push_event(FaultEvent::critical(79, "GPU-A"));
        let shutdown = cancel_after(&h.mock, 2);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Unbounded);

        assert_ok!(h.monitor.run(shutdown, &h.devices, &tx));
        assert_eq!(ids(&drain(&mut rx)), ["GPU-A-_-0", "GPU-A-_-0"]);
    }

    #[tokio::test]
    async fn test_spawned_monitor_streams_notifications() {
        let h = harness(&["GPU-A", "GPU-B"], 2);
        h.mock.push_event(FaultEvent::critical(79, "GPU-B"));
        let (cancel, shutdown) = watch::channel(false);
        let (tx, mut rx) = notification_channel(NotificationPolicy::Block { capacity: 1 });

        let handle = h.monitor.spawn(shutdown, h.devices.into(), tx);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.device.id, "GPU-B-_-0");
        assert_eq!(second.device.id, "GPU-B-_-1");

        cancel.send(true).unwrap();
        let result = handle.await.unwrap();
        assert_ok!(result);
        assert!(rx.recv().await.is_none());
        assert_eq!(h.mock.sets_released(), 1);
    }
}
