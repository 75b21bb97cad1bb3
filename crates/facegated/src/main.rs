use anyhow::{Context, Result};
use facegate_core::{LivenessSignal, ModelPaths, OnnxAnalyzer};
use facegate_hw::Camera;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod service;
mod session;
mod store;
#[cfg(test)]
mod testing;

use config::Config;
use dbus_interface::{FaceGateService, BUS_NAME, OBJECT_PATH};
use service::{Service, SourceOpener};
use session::Scanner;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        models = %config.model_dir.display(),
        db = %config.db_path.display(),
        session_bus = config.session_bus,
        "configuration loaded"
    );

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("opening enrollment store {}", config.db_path.display()))?;

    // Models load lazily on the first scan.
    let analyzer = OnnxAnalyzer::new(ModelPaths::in_dir(&config.model_dir), config.verify_model_checksums);
    let scanner = Scanner::new(analyzer, LivenessSignal::new(config.ear_threshold));

    let device = config.camera_device.clone();
    let open_camera: SourceOpener<Camera> = Arc::new(move || Camera::open(&device));

    let session_bus = config.session_bus;
    let service = FaceGateService {
        service: Service::new(scanner, store, config, open_camera),
    };

    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = if session_bus { "session" } else { "system" }, name = BUS_NAME, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
