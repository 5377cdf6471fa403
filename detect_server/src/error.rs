//! Error types of the camera and the HTTP surface.
//!
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::ErrorBody;
use thiserror::Error;

/// Failure to bring a capture device up.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("failed to open camera {device}: {reason}")]
    DeviceUnavailable { device: String, reason: String },
}

/// Errors returned by request handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("Camera not available")]
    CameraNotReady,
    #[error("Detection model not loaded")]
    ModelUnavailable,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Camera(_) | ApiError::CameraNotReady | ApiError::ModelUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("Request failed: {:#}", &self);
        } else {
            log::warn!("Request rejected ({}): {}", status, &self);
        }

        let body = ErrorBody {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(anyhow::anyhow!("worker task failed: {err}"))
    }
}
