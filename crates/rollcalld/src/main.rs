use anyhow::{Context, Result};
use rollcall_core::Gallery;
use rollcall_store::AttendanceStore;
use rollcall_vision::FaceEncoder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod notify;
mod service;

use config::Config;
use dbus_interface::AttendanceInterface;
use notify::LogNotifier;
use service::{spawn_encoder, AttendanceService};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data dir {}", parent.display()))?;
    }

    let store = Arc::new(AttendanceStore::open(&config.db_path)?);

    let gallery = if config.gallery_path.exists() {
        Arc::new(Gallery::load(&config.gallery_path)?)
    } else {
        tracing::info!(
            path = %config.gallery_path.display(),
            dim = config.embedding_dim,
            "no persisted gallery; starting empty"
        );
        Arc::new(Gallery::new(config.embedding_dim))
    };

    let encoder = FaceEncoder::load(
        &config.detector_model_path(),
        &config.embedder_model_path(),
    )
    .context("loading face models")?;
    let encoder_handle = spawn_encoder(Box::new(encoder));

    let service = Arc::new(AttendanceService::new(
        gallery,
        config.gallery_path.clone(),
        encoder_handle,
        store,
        Box::new(LogNotifier),
        config.confidence_threshold,
    ));

    let _conn = zbus::connection::Builder::session()?
        .name("org.rollcall.Attendance1")?
        .serve_at(
            "/org/rollcall/Attendance1",
            AttendanceInterface::new(Arc::clone(&service)),
        )?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(
        threshold = service.threshold(),
        gallery_entries = service.gallery_len(),
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
