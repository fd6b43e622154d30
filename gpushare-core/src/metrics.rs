//! Prometheus metrics for gpushare

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

use crate::notify::UnhealthyReason;

/// Number of physical GPUs discovered
static PHYSICAL_DEVICES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "gpushare_physical_devices",
        "Number of physical GPUs discovered"
    ))
    .expect("Failed to create physical_devices metric")
});

/// Number of virtual devices advertised
static VIRTUAL_DEVICES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "gpushare_virtual_devices",
        "Number of virtual devices advertised"
    ))
    .expect("Failed to create virtual_devices metric")
});

/// Number of virtual devices registered for XID events
static MONITORED_DEVICES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "gpushare_monitored_devices",
        "Number of virtual devices registered for XID events"
    ))
    .expect("Failed to create monitored_devices metric")
});

/// XID events received, by code and how they were handled
static XID_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("gpushare_xid_events_total", "Total number of XID events received"),
        &["xid", "disposition"]
    )
    .expect("Failed to create xid_events metric")
});

/// Unhealthy notifications emitted
static UNHEALTHY_NOTIFICATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "gpushare_unhealthy_notifications_total",
            "Total number of unhealthy device notifications"
        ),
        &["reason"]
    )
    .expect("Failed to create unhealthy_notifications metric")
});

/// Notifications dropped by a full queue
static DROPPED_NOTIFICATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "gpushare_dropped_notifications_total",
        "Total number of notifications dropped because the queue was full"
    ))
    .expect("Failed to create dropped_notifications metric")
});

/// Event waits that failed with something other than a timeout
static EVENT_WAIT_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "gpushare_event_wait_errors_total",
        "Total number of failed XID event waits"
    ))
    .expect("Failed to create event_wait_errors metric")
});

/// How the monitor handled an XID event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidDisposition {
    /// Application-level fault, ignored
    Benign,
    /// No device attribution, every device reported
    Unattributed,
    /// Matched against monitored devices
    Attributed,
}

impl XidDisposition {
    fn as_str(self) -> &'static str {
        match self {
            XidDisposition::Benign => "benign",
            XidDisposition::Unattributed => "unattributed",
            XidDisposition::Attributed => "attributed",
        }
    }
}

/// Metrics registry wrapper
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*PHYSICAL_DEVICES;
        let _ = &*VIRTUAL_DEVICES;
        let _ = &*MONITORED_DEVICES;
        let _ = &*XID_EVENTS;
        let _ = &*UNHEALTHY_NOTIFICATIONS;
        let _ = &*DROPPED_NOTIFICATIONS;
        let _ = &*EVENT_WAIT_ERRORS;
        Self
    }

    pub fn set_physical_devices(&self, count: i64) {
        PHYSICAL_DEVICES.set(count);
    }

    pub fn set_virtual_devices(&self, count: i64) {
        VIRTUAL_DEVICES.set(count);
    }

    pub fn set_monitored_devices(&self, count: i64) {
        MONITORED_DEVICES.set(count);
    }

    /// Count a received XID event
    pub fn inc_xid_event(&self, xid: u64, disposition: XidDisposition) {
        XID_EVENTS
            .with_label_values(&[&xid.to_string(), disposition.as_str()])
            .inc();
    }

    /// Count an emitted unhealthy notification
    pub fn inc_unhealthy(&self, reason: &UnhealthyReason) {
        UNHEALTHY_NOTIFICATIONS
            .with_label_values(&[reason.label()])
            .inc();
    }

    pub fn inc_dropped_notification(&self) {
        DROPPED_NOTIFICATIONS.inc();
    }

    pub fn inc_event_wait_error(&self) {
        EVENT_WAIT_ERRORS.inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let registry = MetricsRegistry::new();

        registry.set_physical_devices(2);
        registry.set_virtual_devices(8);
        registry.set_monitored_devices(8);
        registry.inc_xid_event(43, XidDisposition::Benign);
        registry.inc_xid_event(79, XidDisposition::Attributed);
        registry.inc_unhealthy(&UnhealthyReason::DeviceFault { xid: 79 });
        registry.inc_dropped_notification();
        registry.inc_event_wait_error();

        assert!(DROPPED_NOTIFICATIONS.get() >= 1);
        assert!(
            XID_EVENTS
                .with_label_values(&["79", "attributed"])
                .get()
                >= 1
        );
    }
}
