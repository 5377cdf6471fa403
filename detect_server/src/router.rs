//! Routes of the HTTP server.
//!
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};

use crate::{
    context::AppContext,
    endpoints::{
        camera_start, camera_status, camera_stop, detect_image, detect_video, health, index, info,
        snapshot, video_feed,
    },
};

/// Build the application router around a shared context.
pub fn app(context: Arc<AppContext>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/video_feed", get(video_feed))
        .route("/snapshot", get(snapshot))
        .route("/detect/image", post(detect_image))
        .route("/detect/video", post(detect_video))
        .route("/camera/start", post(camera_start))
        .route("/camera/stop", post(camera_stop))
        .route("/camera/status", get(camera_status))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(Extension(context))
}
