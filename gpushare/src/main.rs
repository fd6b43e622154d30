//! gpushare
//!
//! GPU device plugin core that advertises several virtual devices per
//! physical GPU and reports virtual devices unhealthy when their GPU raises a
//! critical XID error. Registration with the kubelet and allocation live
//! outside this binary; here the notification stream is consumed by a
//! log-only reporter.

mod cli;
mod config;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::{BackpressurePolicy, Config};
use gpushare_core::device::{create_device_interface, DeviceType as CoreDeviceType};
use gpushare_core::metrics::MetricsRegistry;
use gpushare_core::{
    notification_channel, DeviceCatalog, DeviceInventory, Health, HealthMonitor,
    NotificationPolicy, NotificationReceiver, OversubscriptionFactor, PluginError, VirtualDevice,
};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Convert config device type to core device type
fn to_core_device_type(dt: config::DeviceType) -> CoreDeviceType {
    match dt {
        config::DeviceType::Auto => CoreDeviceType::Auto,
        config::DeviceType::Nvidia => CoreDeviceType::Nvidia,
        config::DeviceType::Mock => CoreDeviceType::Mock,
    }
}

/// Convert config notification settings to the core queue policy
fn to_core_policy(config: &config::NotificationConfig) -> NotificationPolicy {
    match config.policy {
        BackpressurePolicy::Block => NotificationPolicy::Block {
            capacity: config.capacity,
        },
        BackpressurePolicy::DropNewest => NotificationPolicy::DropNewest {
            capacity: config.capacity,
        },
        BackpressurePolicy::Unbounded => NotificationPolicy::Unbounded,
    }
}

/// The process-level boundary for core errors
fn fatal(err: PluginError) -> anyhow::Error {
    error!(error = %err, severity = %err.severity(), "Fatal plugin error");
    anyhow::Error::new(err)
}

/// Consume notifications until the monitor goes away.
///
/// Health state is owned here, not by the monitor. Repeated notifications for
/// an already unhealthy device are expected.
async fn report(mut notifications: NotificationReceiver, devices: &[VirtualDevice]) {
    let mut health: HashMap<&str, Health> =
        devices.iter().map(|d| (d.id.as_str(), d.health)).collect();

    while let Some(notification) = notifications.recv().await {
        let id = notification.device.id.as_str();
        match health.get_mut(id) {
            Some(state) if *state == Health::Healthy => {
                *state = Health::Unhealthy;
                warn!(
                    device = %id,
                    reason = %notification.reason,
                    at = %notification.reported_at,
                    "Device is unhealthy"
                );
            }
            Some(_) => {
                info!(device = %id, reason = %notification.reason, "Device still unhealthy");
            }
            None => {
                warn!(device = %id, "Notification for an unknown device");
            }
        }
    }

    let unhealthy = health.values().filter(|h| **h == Health::Unhealthy).count();
    info!(unhealthy = unhealthy, total = devices.len(), "Reporter stopped");
}

/// Build the catalog and run the health monitor until shutdown
async fn run(cli: Cli, config: Config, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let factor = OversubscriptionFactor::from_setting(cli.containers_per_gpu.as_deref())
        .map_err(fatal)?;

    let device = create_device_interface(to_core_device_type(config.device_type))
        .context("Failed to create device interface")?;

    let DeviceInventory { physical, devices } = DeviceCatalog::new(device.clone())
        .build(factor)
        .await
        .map_err(fatal)?;

    if physical.is_empty() {
        warn!("No GPU devices found on this node");
    }

    if cli.list {
        let json = serde_json::to_string_pretty(&devices)?;
        println!("{}", json);
        return Ok(());
    }

    // Initialize metrics registry
    let metrics = Arc::new(MetricsRegistry::new());
    metrics.set_physical_devices(physical.len() as i64);
    metrics.set_virtual_devices(devices.len() as i64);

    // Start metrics server if enabled
    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let policy = to_core_policy(&config.notifications);
    info!(
        policy = ?policy,
        event_timeout = %humantime::format_duration(config.event_timeout),
        "Starting health monitor"
    );

    let devices: Arc<[VirtualDevice]> = devices.into();
    let (tx, rx) = notification_channel(policy);
    let monitor = HealthMonitor::new(device, metrics).with_event_timeout(config.event_timeout);
    let handle = monitor.spawn(shutdown_rx, devices.clone(), tx);

    // Ends once the monitor drops its sender
    report(rx, &devices).await;

    handle
        .await
        .context("Health monitor task panicked")?
        .map_err(fatal)?;

    info!("gpushare shutdown complete");
    Ok(())
}

/// Start the Prometheus metrics HTTP server
async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = port, "Metrics server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics_output = prometheus::TextEncoder::new()
                .encode_to_string(&prometheus::gather())
                .unwrap_or_default();

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics_output.len(),
                metrics_output
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "gpushare starting");

    // Load configuration
    let config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    // Setup shutdown signal handler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }

        let _ = shutdown_tx.send(true);
    });

    run(cli, config, shutdown_rx).await
}
