use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod dbus_interface;
mod descriptor_client;
mod http_store;
mod outbox;
mod reconciler;
mod scanner;
#[cfg(test)]
mod testing;

use config::Config;
use controller::Controller;
use descriptor_client::HttpDescriptorSource;
use http_store::HttpStore;
use outbox::Outbox;
use reconciler::{Reconciler, ReconcilerConfig};
use rollcall_hw::CameraProvider;
use scanner::{Scanner, ScannerConfig};

#[cfg(feature = "v4l2")]
fn camera_provider(config: &Config) -> Arc<dyn CameraProvider> {
    Arc::new(rollcall_hw::V4lCameraProvider::new(config.camera_device.clone()))
}

#[cfg(not(feature = "v4l2"))]
fn camera_provider(config: &Config) -> Arc<dyn CameraProvider> {
    tracing::warn!(
        device = %config.camera_device,
        "built without V4L2 support; scans will fail to open the camera"
    );
    Arc::new(NoCamera(config.camera_device.clone()))
}

#[cfg(not(feature = "v4l2"))]
struct NoCamera(String);

#[cfg(not(feature = "v4l2"))]
impl CameraProvider for NoCamera {
    fn open(&self) -> Result<Box<dyn rollcall_hw::FrameSource>, rollcall_hw::CameraError> {
        Err(rollcall_hw::CameraError::DeviceNotFound(format!(
            "{}: V4L2 support not compiled in",
            self.0
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        api_base = %config.api_base,
        camera = %config.camera_device,
        descriptor_url = %config.descriptor_url,
        threshold = config.match_threshold,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "configuration loaded"
    );

    let store = Arc::new(
        HttpStore::new(&config.api_base, config.request_timeout)
            .context("failed to build backend client")?,
    );
    let outbox = Outbox::open(&config.outbox_path)
        .await
        .with_context(|| format!("failed to open outbox at {}", config.outbox_path.display()))?;
    let pending = outbox.count(None).await?;
    if pending > 0 {
        tracing::info!(pending, "attendance writes carried over from a previous run");
    }

    let shutdown = CancellationToken::new();
    let reconciler = Reconciler::new(Arc::clone(&store), outbox, ReconcilerConfig::from(&config));
    let (events_tx, events_rx) = reconciler.channel();
    let reconciler_task = tokio::spawn(reconciler.clone().run(events_rx, shutdown.clone()));

    let descriptors = HttpDescriptorSource::new(&config.descriptor_url, config.request_timeout)
        .context("failed to build descriptor client")?;
    let scanner = Scanner::new(
        store,
        camera_provider(&config),
        Box::new(descriptors),
        events_tx,
        ScannerConfig::from(&config),
    );
    let controller = Controller::new(scanner, reconciler);

    let service = dbus_interface::AttendanceService {
        controller: controller.clone(),
    };
    let _conn = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus_name = dbus_interface::BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    controller.stop_scan().await;
    shutdown.cancel();
    reconciler_task.await?;

    Ok(())
}
