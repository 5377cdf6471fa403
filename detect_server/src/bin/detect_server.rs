//! Detection server binary.
//!
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use detect_server::{
    config::Config, context::AppContext, meter::spawn_meter_logger, router::app,
    sensors::device_supported,
};
use env_logger::TimestampPrecision;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    config.validate()?;
    if !device_supported(&config.device) {
        log::warn!(
            "Built without the `v4l2` feature, camera {} cannot be opened. Use `--device synthetic` or rebuild with `--features v4l2`",
            &config.device
        );
    }
    log::info!("Starting RockUGV detection server");

    let context = Arc::new(AppContext::from_config(&config).await);
    if config.autostart {
        if let Err(err) = context.ensure_camera_started().await {
            log::error!("Camera autostart failed: {err}");
        }
    } else {
        log::info!("Camera will start on the first request");
    }

    spawn_meter_logger(Arc::clone(&context.meter));

    // Serve HTTP server
    let app = app(Arc::clone(&context), config.max_upload_bytes());
    log::info!("Listening on http://{}", &config.server_address);
    axum::Server::bind(&config.server_address)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&context)))
        .await?;

    log::info!("Shutdown complete");

    Ok(())
}

/// Resolve on Ctrl-C after releasing the camera.
///
/// Open streams only end once the camera is stopped, so it has to go first for the server to drain.
async fn shutdown_signal(context: Arc<AppContext>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }

    log::info!("Shutting down, releasing camera");
    if let Err(err) = context.stop_camera().await {
        log::error!("Failed to stop camera: {err}");
    }
}
