//! Endpoints of HTTP server.
//!
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use axum::{
    body::{Bytes, StreamBody},
    extract::{Multipart, Query},
    http::{header, HeaderName, HeaderValue},
    response::{Html, IntoResponse, Response},
    Extension, Json,
};
use chrono::Local;
use common::protocol::{
    CameraInfo, CameraStatus, Detection, FrameSummary, Health, ImageDetections, Info, ModelInfo,
    RuntimeInfo, SystemInfo, VideoSummary,
};
use image::RgbImage;
use serde::Deserialize;

use crate::{
    context::AppContext,
    dashboard,
    encoder::{as_jpeg_stream_item, encode_jpeg, split_mjpeg, FpsCounter, MJPEG_CONTENT_TYPE},
    error::ApiError,
    frame_source::{Frame, ACQUISITION_THROTTLE},
    nn::InferModel,
};

/// Response header carrying the number of drawn detections.
pub const DETECTION_COUNT_HEADER: &str = "x-detection-count";

/// Multipart field holding uploaded files.
const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Deserialize)]
pub struct ImageParams {
    #[serde(default)]
    annotated: bool,
}

#[derive(Debug, Deserialize)]
pub struct VideoParams {
    #[serde(default)]
    stride: Option<usize>,
    #[serde(default)]
    max_frames: Option<usize>,
}

/// Dashboard page.
pub async fn index(Extension(context): Extension<Arc<AppContext>>) -> Html<String> {
    Html(dashboard::render(&context))
}

/// Health check endpoint.
pub async fn health(Extension(context): Extension<Arc<AppContext>>) -> Json<Health> {
    Json(Health {
        status: "healthy".into(),
        timestamp: Local::now().to_rfc3339(),
        model_loaded: context.model.is_some(),
        model_path: context
            .model
            .as_ref()
            .map(|loaded| loaded.path.display().to_string()),
        camera_initialized: true,
        camera_active: context.camera.is_running(),
        uptime_seconds: context.uptime().as_secs_f64(),
        detections_total: context.meter.detections_total(),
    })
}

pub async fn info(Extension(context): Extension<Arc<AppContext>>) -> Json<Info> {
    let camera = context.camera.config();
    let threads = std::thread::available_parallelism()
        .map(|threads| threads.get())
        .unwrap_or(1);

    Json(Info {
        system: SystemInfo {
            name: "RockUGV Border Surveillance".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            start_time: context.started_at.to_rfc3339(),
        },
        model: ModelInfo {
            loaded: context.model.is_some(),
            classes: context
                .model
                .as_ref()
                .map(|loaded| loaded.model.class_names().to_vec()),
            kind: "YOLOv8".into(),
            path: context
                .model
                .as_ref()
                .map(|loaded| loaded.path.display().to_string()),
        },
        camera: CameraInfo {
            id: camera.device.clone(),
            resolution: format!("{}x{}", camera.width, camera.height),
            fps: camera.fps,
            running: context.camera.is_running(),
        },
        runtime: RuntimeInfo {
            backend: "tract-onnx".into(),
            threads,
        },
    })
}

/// Live MJPEG stream of annotated camera frames.
///
/// The stream ends when the client disconnects or the camera is stopped.
pub async fn video_feed(
    Extension(context): Extension<Arc<AppContext>>,
) -> Result<impl IntoResponse, ApiError> {
    context.ensure_camera_started().await?;
    log::info!("Stream requested");

    let stream = async_stream::stream! {
        let mut fps = FpsCounter::new();
        let mut last_seq = None;

        while context.camera.is_running() {
            let frame = match context.camera.read() {
                Some(frame) => frame,
                None => {
                    tokio::time::sleep(context.settings.empty_frame_retry).await;
                    continue;
                }
            };
            // Only annotate each captured frame once
            if last_seq == Some(frame.seq) {
                tokio::time::sleep(ACQUISITION_THROTTLE).await;
                continue;
            }
            last_seq = Some(frame.seq);

            let current_fps = fps.tick();
            let quality = context.settings.stream_quality;
            let worker_context = Arc::clone(&context);
            let rendered = tokio::task::spawn_blocking(move || {
                render_frame(&worker_context, &frame.image, Some(current_fps), quality)
            })
            .await;

            match rendered {
                Ok(Ok((jpeg, _))) => {
                    context.meter.tick_streamed();
                    yield Ok::<_, std::io::Error>(as_jpeg_stream_item(&jpeg));
                }
                Ok(Err(err)) => log::warn!("Skipping frame {}: {err:#}", last_seq.unwrap_or_default()),
                Err(err) => {
                    log::error!("Frame worker failed: {err}");
                    break;
                }
            }
        }

        log::info!("Stream ended, camera stopped");
    };

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [
        (header::CONTENT_TYPE, MJPEG_CONTENT_TYPE),
        (header::CACHE_CONTROL, "no-cache"),
    ];

    Ok((headers, body))
}

/// Single annotated JPEG of the current camera frame.
pub async fn snapshot(Extension(context): Extension<Arc<AppContext>>) -> Result<Response, ApiError> {
    let warmup = if context.camera.is_running() {
        Duration::ZERO
    } else {
        context.settings.warmup
    };
    if let Err(err) = context.ensure_camera_started().await {
        log::warn!("Snapshot without camera: {err}");
        return Err(ApiError::CameraNotReady);
    }

    let frame = wait_for_frame(&context, warmup)
        .await
        .ok_or(ApiError::CameraNotReady)?;

    let quality = context.settings.snapshot_quality;
    let worker_context = Arc::clone(&context);
    let (jpeg, detections) = tokio::task::spawn_blocking(move || {
        render_frame(&worker_context, &frame.image, None, quality)
    })
    .await??;

    let mut response = jpeg_response(jpeg, detections);
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("inline; filename=snapshot.jpg"),
    );
    Ok(response)
}

/// Detect objects in an uploaded image.
///
/// Returns the detections as JSON, or the annotated image with `?annotated=true`.
pub async fn detect_image(
    Extension(context): Extension<Arc<AppContext>>,
    Query(params): Query<ImageParams>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let model = context.require_model()?;
    let data = read_upload(multipart).await?;
    log::debug!("Detecting objects in uploaded image of {} bytes", data.len());

    let worker_context = Arc::clone(&context);
    let (mut image, detections, inference_ms) = tokio::task::spawn_blocking(move || {
        let image = decode_image(&data)?;
        let started = Instant::now();
        let detections = model.infer(&image, worker_context.settings.confidence)?;
        let inference_ms = started.elapsed().as_secs_f64() * 1000.0;
        worker_context.meter.tick_infered(detections.len());
        Ok::<_, ApiError>((image, detections, inference_ms))
    })
    .await??;

    if params.annotated {
        let quality = context.settings.snapshot_quality;
        let count = detections.len();
        let jpeg = tokio::task::spawn_blocking(move || {
            context.annotator.draw_detections(&mut image, &detections);
            encode_jpeg(&image, quality)
        })
        .await??;
        return Ok(jpeg_response(jpeg, count));
    }

    let (width, height) = image.dimensions();
    Ok(Json(ImageDetections {
        width,
        height,
        detection_count: detections.len(),
        detections,
        inference_ms,
    })
    .into_response())
}

/// Detect objects in an uploaded Motion-JPEG video.
pub async fn detect_video(
    Extension(context): Extension<Arc<AppContext>>,
    Query(params): Query<VideoParams>,
    multipart: Multipart,
) -> Result<Json<VideoSummary>, ApiError> {
    let model = context.require_model()?;
    let stride = params.stride.unwrap_or(1);
    if stride == 0 {
        return Err(ApiError::BadRequest("stride must be at least 1".into()));
    }
    let max_frames = params.max_frames.unwrap_or(usize::MAX);
    let data = read_upload(multipart).await?;
    log::info!("Analyzing uploaded video of {} bytes", data.len());

    let confidence = context.settings.confidence;
    let summary = tokio::task::spawn_blocking(move || {
        let summary = summarize_video(model.as_ref(), &data, stride, max_frames, confidence)?;
        context.meter.tick_infered(summary.total_detections);
        Ok::<_, ApiError>(summary)
    })
    .await??;

    log::info!(
        "Analyzed {} of {} frames, {} detections",
        summary.frames_analyzed,
        summary.frames_total,
        summary.total_detections
    );
    Ok(Json(summary))
}

pub async fn camera_start(
    Extension(context): Extension<Arc<AppContext>>,
) -> Result<Json<CameraStatus>, ApiError> {
    context.ensure_camera_started().await?;
    Ok(Json(context.camera.status()))
}

pub async fn camera_stop(
    Extension(context): Extension<Arc<AppContext>>,
) -> Result<Json<CameraStatus>, ApiError> {
    context.stop_camera().await?;
    Ok(Json(context.camera.status()))
}

pub async fn camera_status(Extension(context): Extension<Arc<AppContext>>) -> Json<CameraStatus> {
    Json(context.camera.status())
}

/// Detect, annotate and encode one frame. Returns the JPEG and the number of detections.
///
/// Without a model the frame is encoded as captured.
fn render_frame(
    context: &AppContext,
    frame: &RgbImage,
    fps: Option<f32>,
    quality: u8,
) -> Result<(Vec<u8>, usize)> {
    let mut canvas = frame.clone();
    let mut detection_count = 0;

    if let Some(model) = context.model() {
        let detections = model.infer(&canvas, context.settings.confidence)?;
        context.meter.tick_infered(detections.len());
        context.annotator.draw_detections(&mut canvas, &detections);
        detection_count = detections.len();
    }
    if let Some(fps) = fps {
        context.annotator.draw_fps(&mut canvas, fps);
    }

    Ok((encode_jpeg(&canvas, quality)?, detection_count))
}

/// Poll the camera for a first frame until `timeout` has passed. Reads at least once.
async fn wait_for_frame(context: &AppContext, timeout: Duration) -> Option<Frame> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(frame) = context.camera.read() {
            return Some(frame);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(ACQUISITION_THROTTLE).await;
    }
}

fn summarize_video(
    model: &dyn InferModel,
    data: &[u8],
    stride: usize,
    max_frames: usize,
    confidence: f32,
) -> Result<VideoSummary, ApiError> {
    let jpegs = split_mjpeg(data);
    if jpegs.is_empty() {
        return Err(ApiError::BadRequest("no JPEG frames in upload".into()));
    }

    let mut classes = BTreeMap::new();
    let mut frames = Vec::new();
    let mut total_detections = 0;

    for (index, jpeg) in jpegs.iter().enumerate().step_by(stride).take(max_frames) {
        let image = match image::load_from_memory(jpeg) {
            Ok(image) => image.to_rgb8(),
            Err(err) => {
                log::warn!("Skipping undecodable frame {index}: {err}");
                continue;
            }
        };
        let detections: Vec<Detection> = model.infer(&image, confidence)?;
        let summary = FrameSummary::from_detections(index, &detections);
        for (label, count) in summary.classes.iter() {
            *classes.entry(label.clone()).or_insert(0) += count;
        }
        total_detections += summary.detection_count;
        frames.push(summary);
    }

    Ok(VideoSummary {
        frames_total: jpegs.len(),
        frames_analyzed: frames.len(),
        total_detections,
        classes,
        frames,
    })
}

async fn read_upload(mut multipart: Multipart) -> Result<Bytes, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("invalid upload: {err}")))?
    {
        if field.name() == Some(UPLOAD_FIELD) {
            return field
                .bytes()
                .await
                .map_err(|err| ApiError::BadRequest(format!("invalid upload: {err}")));
        }
    }

    Err(ApiError::BadRequest(format!(
        "missing multipart field `{UPLOAD_FIELD}`"
    )))
}

fn decode_image(data: &[u8]) -> Result<RgbImage, ApiError> {
    image::load_from_memory(data)
        .map(|image| image.to_rgb8())
        .map_err(|err| ApiError::BadRequest(format!("cannot decode image: {err}")))
}

fn jpeg_response(jpeg: Vec<u8>, detection_count: usize) -> Response {
    let mut response = ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response();
    response.headers_mut().insert(
        HeaderName::from_static(DETECTION_COUNT_HEADER),
        HeaderValue::from(detection_count),
    );
    response
}
