//! JSON bodies exchanged over the HTTP API.
//!
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in pixel coordinates of the analyzed frame.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

/// Single detected object.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Result of `POST /detect/image`.
#[derive(Debug, Deserialize, Serialize)]
pub struct ImageDetections {
    pub width: u32,
    pub height: u32,
    pub detection_count: usize,
    pub detections: Vec<Detection>,
    pub inference_ms: f64,
}

/// Per-frame entry of a video analysis.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct FrameSummary {
    pub index: usize,
    pub detection_count: usize,
    pub classes: BTreeMap<String, usize>,
}

impl FrameSummary {
    pub fn from_detections(index: usize, detections: &[Detection]) -> Self {
        let mut classes = BTreeMap::new();
        for detection in detections {
            *classes.entry(detection.label.clone()).or_insert(0) += 1;
        }
        Self {
            index,
            detection_count: detections.len(),
            classes,
        }
    }
}

/// Result of `POST /detect/video`.
#[derive(Debug, Deserialize, Serialize)]
pub struct VideoSummary {
    pub frames_total: usize,
    pub frames_analyzed: usize,
    pub total_detections: usize,
    pub classes: BTreeMap<String, usize>,
    pub frames: Vec<FrameSummary>,
}

/// Camera state as reported by `/camera/*`.
#[derive(Debug, Deserialize, Serialize)]
pub struct CameraStatus {
    pub device: String,
    pub running: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub frames_captured: u64,
    pub has_frame: bool,
}

/// Result of `GET /health`.
#[derive(Debug, Deserialize, Serialize)]
pub struct Health {
    pub status: String,
    pub timestamp: String,
    pub model_loaded: bool,
    pub model_path: Option<String>,
    pub camera_initialized: bool,
    pub camera_active: bool,
    pub uptime_seconds: f64,
    pub detections_total: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SystemInfo {
    pub name: String,
    pub version: String,
    pub start_time: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ModelInfo {
    pub loaded: bool,
    pub classes: Option<Vec<String>>,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CameraInfo {
    pub id: String,
    pub resolution: String,
    pub fps: u32,
    pub running: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RuntimeInfo {
    pub backend: String,
    pub threads: usize,
}

/// Result of `GET /info`.
#[derive(Debug, Deserialize, Serialize)]
pub struct Info {
    pub system: SystemInfo,
    pub model: ModelInfo,
    pub camera: CameraInfo,
    pub runtime: RuntimeInfo,
}

/// Error body of every failed request.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}
