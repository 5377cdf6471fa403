//! Application context handed to every request handler.
//!
use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use chrono::{DateTime, Local};

use crate::{
    annotate::Annotator,
    config::Config,
    error::ApiError,
    frame_source::FrameSource,
    meter::Meter,
    nn::{load_class_names, ClassFilter, InferModel, YoloModel},
    sensors::default_opener,
    utils::{cached_model_path, fetch_if_missing},
};

/// Per-request tunables taken from the configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    pub confidence: f32,
    pub stream_quality: u8,
    pub snapshot_quality: u8,
    /// Longest wait for a first frame after a snapshot started the camera.
    pub warmup: Duration,
    /// Pause of the streaming loop while no frame is buffered.
    pub empty_frame_retry: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            stream_quality: 80,
            snapshot_quality: 95,
            warmup: Duration::from_millis(500),
            empty_frame_retry: Duration::from_millis(100),
        }
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            confidence: config.confidence,
            stream_quality: config.stream_quality,
            snapshot_quality: config.snapshot_quality,
            ..Default::default()
        }
    }
}

/// Detector together with the file it was loaded from.
pub struct LoadedModel {
    pub model: Arc<dyn InferModel>,
    pub path: PathBuf,
}

/// Owned handles to the camera, the detector and the shared bookkeeping.
pub struct AppContext {
    pub camera: FrameSource,
    pub model: Option<LoadedModel>,
    pub annotator: Annotator,
    pub meter: Arc<Meter>,
    pub settings: Settings,
    pub started_at: DateTime<Local>,
    started: Instant,
}

impl AppContext {
    pub fn new(
        camera: FrameSource,
        model: Option<LoadedModel>,
        annotator: Annotator,
        meter: Arc<Meter>,
        settings: Settings,
    ) -> Self {
        Self {
            camera,
            model,
            annotator,
            meter,
            settings,
            started_at: Local::now(),
            started: Instant::now(),
        }
    }

    /// Build the context of the server binary. A model that fails to load is logged, not fatal.
    pub async fn from_config(config: &Config) -> Self {
        let meter = Arc::new(Meter::new());
        let camera = FrameSource::new(config.camera_config(), default_opener(), meter.clone());
        log::info!("Camera {} initialized", &config.device);

        let model = match load_model(config).await {
            Ok(model) => Some(model),
            Err(err) => {
                log::error!("Detection model unavailable: {err:#}");
                None
            }
        };

        let annotator = Annotator::load(&config.font);

        Self::new(camera, model, annotator, meter, Settings::from(config))
    }

    /// Detector, or `ModelUnavailable` for handlers that cannot do without one.
    pub fn require_model(&self) -> Result<Arc<dyn InferModel>, ApiError> {
        self.model
            .as_ref()
            .map(|loaded| loaded.model.clone())
            .ok_or(ApiError::ModelUnavailable)
    }

    pub fn model(&self) -> Option<Arc<dyn InferModel>> {
        self.model.as_ref().map(|loaded| loaded.model.clone())
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Start the camera off the async runtime, no-op if it already runs.
    pub async fn ensure_camera_started(self: &Arc<Self>) -> Result<(), ApiError> {
        if self.camera.is_running() {
            return Ok(());
        }

        let context = Arc::clone(self);
        tokio::task::spawn_blocking(move || context.camera.start()).await??;
        Ok(())
    }

    /// Stop the camera off the async runtime.
    pub async fn stop_camera(self: &Arc<Self>) -> Result<(), ApiError> {
        let context = Arc::clone(self);
        tokio::task::spawn_blocking(move || context.camera.stop()).await?;
        Ok(())
    }
}

/// Load the configured model, falling back to the fallback model and downloading it if needed.
pub async fn load_model(config: &Config) -> Result<LoadedModel> {
    let path = resolve_model_path(config).await?;
    let class_names = load_class_names(config.class_names.as_deref())?;
    log::info!("Loading model {} ({} classes)", path.display(), class_names.len());

    let (model_path, input_size, iou) = (path.clone(), config.model_input_size, config.iou);
    let yolo =
        tokio::task::spawn_blocking(move || YoloModel::new(model_path, input_size, iou, class_names))
            .await??;

    let model: Arc<dyn InferModel> = if config.classes.is_empty() {
        Arc::new(yolo)
    } else {
        log::info!("Reporting only classes {:?}", &config.classes);
        Arc::new(ClassFilter::new(Arc::new(yolo), config.classes.clone()))
    };
    log::info!("Loaded model {}", path.display());

    Ok(LoadedModel { model, path })
}

async fn resolve_model_path(config: &Config) -> Result<PathBuf> {
    if config.model.exists() {
        return Ok(config.model.clone());
    }
    log::warn!("Model not found at {}", config.model.display());

    if config.fallback_model.exists() {
        log::info!("Using fallback model {}", config.fallback_model.display());
        return Ok(config.fallback_model.clone());
    }

    if let Some(url) = &config.fallback_model_url {
        let target = cached_model_path(url)?;
        fetch_if_missing(url, &target).await?;
        return Ok(target);
    }

    bail!(
        "neither {} nor {} exist and no download URL is configured",
        config.model.display(),
        config.fallback_model.display()
    )
}
