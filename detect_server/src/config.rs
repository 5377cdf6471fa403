//! Command line and environment configuration.
//!
use std::{net::SocketAddr, path::PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};

/// Pixel format requested from a V4L2 device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PixelFormat {
    /// Motion-JPEG, decoded on the acquisition thread
    Mjpg,
    /// Packed YUV 4:2:2, converted to RGB on the acquisition thread
    Yuyv,
}

impl PixelFormat {
    pub fn fourcc(&self) -> &'static [u8] {
        match self {
            PixelFormat::Mjpg => b"MJPG",
            PixelFormat::Yuyv => b"YUYV",
        }
    }
}

/// Camera geometry and device selection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: PixelFormat,
}

impl CameraConfig {
    pub fn new(device: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            device: device.into(),
            width,
            height,
            fps,
            pixel_format: PixelFormat::Mjpg,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self::new("0", 640, 480, 30)
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "RockUGV object detection server")]
pub struct Config {
    /// Address the HTTP server binds to
    #[clap(long, env = "ROCKUGV_SERVER_ADDRESS", default_value = "0.0.0.0:8000")]
    pub server_address: SocketAddr,

    /// Camera index (`0` is `/dev/video0`) or device path, which need a build with the `v4l2`
    /// feature, or `synthetic`
    #[clap(long, env = "ROCKUGV_DEVICE", default_value = "0")]
    pub device: String,

    /// Requested frame width
    #[clap(long, env = "ROCKUGV_WIDTH", default_value_t = 640)]
    pub width: u32,

    /// Requested frame height
    #[clap(long, env = "ROCKUGV_HEIGHT", default_value_t = 480)]
    pub height: u32,

    /// Requested frame rate, advisory only
    #[clap(long, env = "ROCKUGV_FPS", default_value_t = 30)]
    pub fps: u32,

    /// Pixel format requested from the device
    #[clap(long, env = "ROCKUGV_PIXEL_FORMAT", value_enum, default_value = "mjpg")]
    pub pixel_format: PixelFormat,

    /// YOLOv8 model exported to ONNX
    #[clap(long, env = "ROCKUGV_MODEL", default_value = "models/best.onnx")]
    pub model: PathBuf,

    /// Model used when `--model` does not exist
    #[clap(long, env = "ROCKUGV_FALLBACK_MODEL", default_value = "yolov8n.onnx")]
    pub fallback_model: PathBuf,

    /// Download location of the fallback model if it is missing locally
    #[clap(long, env = "ROCKUGV_FALLBACK_MODEL_URL")]
    pub fallback_model_url: Option<String>,

    /// Square input size of the model
    #[clap(long, env = "ROCKUGV_MODEL_INPUT_SIZE", default_value_t = 640)]
    pub model_input_size: u32,

    /// File with one class label per line, COCO labels if omitted
    #[clap(long, env = "ROCKUGV_CLASS_NAMES")]
    pub class_names: Option<PathBuf>,

    /// Only report these classes (comma separated labels)
    #[clap(long, env = "ROCKUGV_CLASSES", value_delimiter = ',')]
    pub classes: Vec<String>,

    /// Minimum confidence of reported detections
    #[clap(long, env = "ROCKUGV_CONFIDENCE", default_value_t = 0.25)]
    pub confidence: f32,

    /// Maximum IoU between two boxes of the same class
    #[clap(long, env = "ROCKUGV_IOU", default_value_t = 0.45)]
    pub iou: f32,

    /// JPEG quality of streamed frames
    #[clap(long, env = "ROCKUGV_STREAM_QUALITY", default_value_t = 80)]
    pub stream_quality: u8,

    /// JPEG quality of snapshots
    #[clap(long, env = "ROCKUGV_SNAPSHOT_QUALITY", default_value_t = 95)]
    pub snapshot_quality: u8,

    /// TrueType font used for labels and the FPS overlay
    #[clap(
        long,
        env = "ROCKUGV_FONT",
        default_value = "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf"
    )]
    pub font: PathBuf,

    /// Start the camera at boot instead of on the first request
    #[clap(long, env = "ROCKUGV_AUTOSTART")]
    pub autostart: bool,

    /// Largest accepted upload in MiB
    #[clap(long, env = "ROCKUGV_MAX_UPLOAD_MB", default_value_t = 64)]
    pub max_upload_mb: usize,
}

impl Config {
    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            bail!("frame size must be non-zero, got {}x{}", self.width, self.height);
        }
        if self.fps == 0 {
            bail!("frame rate must be non-zero");
        }
        if self.model_input_size == 0 || self.model_input_size % 32 != 0 {
            bail!(
                "model input size must be a positive multiple of 32, got {}",
                self.model_input_size
            );
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            bail!("confidence must be within [0, 1], got {}", self.confidence);
        }
        if !(0.0..=1.0).contains(&self.iou) {
            bail!("iou must be within [0, 1], got {}", self.iou);
        }
        for quality in [self.stream_quality, self.snapshot_quality] {
            if !(1..=100).contains(&quality) {
                bail!("JPEG quality must be within 1..=100, got {}", quality);
            }
        }

        Ok(())
    }

    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            device: self.device.clone(),
            width: self.width,
            height: self.height,
            fps: self.fps,
            pixel_format: self.pixel_format,
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("detect_server").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        config.validate().expect("defaults are valid");

        assert_eq!(config.camera_config(), CameraConfig::default());
        assert_eq!(config.server_address.port(), 8000);
        assert_eq!(config.stream_quality, 80);
        assert_eq!(config.snapshot_quality, 95);
        assert!(config.classes.is_empty());
        assert!(!config.autostart);
    }

    #[test]
    fn test_class_filter_is_comma_separated() {
        let config = parse(&["--classes", "person,car"]);
        assert_eq!(config.classes, vec!["person".to_string(), "car".to_string()]);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(parse(&["--width", "0"]).validate().is_err());
        assert!(parse(&["--confidence", "1.5"]).validate().is_err());
        assert!(parse(&["--stream-quality", "0"]).validate().is_err());
        assert!(parse(&["--model-input-size", "600"]).validate().is_err());
    }

    #[test]
    fn test_device_help_names_v4l2_feature() {
        use clap::CommandFactory;

        let command = Config::command();
        let help = command
            .get_arguments()
            .find(|arg| arg.get_id() == "device")
            .and_then(|arg| arg.get_help())
            .map(|help| help.to_string())
            .unwrap_or_default();

        assert!(help.contains("v4l2"));
        assert!(help.contains("synthetic"));
    }

    #[test]
    fn test_yuyv_pixel_format() {
        let config = parse(&["--pixel-format", "yuyv", "--device", "/dev/video2"]);
        let camera = config.camera_config();
        assert_eq!(camera.pixel_format.fourcc(), b"YUYV");
        assert_eq!(camera.device, "/dev/video2");
    }
}
