//! Sensors module.
//!
//! Opening a device yields a [`CaptureFn`] that blocks until the next frame is available and
//! returns it decoded to RGB. Dropping the capture function releases the device.
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use image::{Rgb, RgbImage};

use crate::config::{CameraConfig, PixelFormat};

/// Capture the next frame of an opened device.
pub type CaptureFn = Box<dyn FnMut() -> Result<RgbImage> + Send>;

/// Open a device described by a camera configuration.
pub type OpenFn = Arc<dyn Fn(&CameraConfig) -> Result<CaptureFn> + Send + Sync>;

/// Device identifier that opens the synthetic test pattern.
pub const SYNTHETIC_DEVICE: &str = "synthetic";

/// Opener used by the server: synthetic devices in-process, everything else through V4L2.
pub fn default_opener() -> OpenFn {
    Arc::new(open_capture_fn)
}

/// Get a capture function for the configured device.
pub fn open_capture_fn(config: &CameraConfig) -> Result<CaptureFn> {
    if is_synthetic(&config.device) {
        return get_capture_fn_synthetic(config);
    }

    get_capture_fn_linux(config)
}

/// Map a camera index to its device node, pass paths through unchanged.
pub fn device_path(device: &str) -> String {
    match device.parse::<u32>() {
        Ok(index) => format!("/dev/video{index}"),
        Err(_) => device.to_owned(),
    }
}

fn is_synthetic(device: &str) -> bool {
    device == SYNTHETIC_DEVICE || device.starts_with("stub://")
}

/// Whether this build can open `device`. Real devices need the `v4l2` feature.
pub fn device_supported(device: &str) -> bool {
    cfg!(feature = "v4l2") || is_synthetic(device)
}

/// Synthetic camera drawing a vertical bar that moves one step per frame.
///
/// `stub://unavailable` simulates a device that cannot be opened.
fn get_capture_fn_synthetic(config: &CameraConfig) -> Result<CaptureFn> {
    if config.device == "stub://unavailable" {
        bail!("synthetic device {} is unavailable", &config.device);
    }

    let (width, height) = (config.width, config.height);
    let frame_interval = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);
    let mut counter: u32 = 0;
    let mut last_frame: Option<Instant> = None;

    log::info!(
        "Using synthetic camera {} ({}x{} @ {}fps)",
        &config.device,
        width,
        height,
        config.fps
    );

    let callback = move || -> Result<RgbImage> {
        // Pace like a real device would
        if let Some(last) = last_frame {
            if let Some(remaining) = frame_interval.checked_sub(last.elapsed()) {
                thread::sleep(remaining);
            }
        }
        last_frame = Some(Instant::now());

        let frame = synthetic_pattern(width, height, counter);
        counter = counter.wrapping_add(1);
        Ok(frame)
    };
    Ok(Box::new(callback))
}

/// Test pattern number `counter`: a white bar over a gradient.
fn synthetic_pattern(width: u32, height: u32, counter: u32) -> RgbImage {
    let bar_width = (width / 16).max(1);
    let bar_x = counter.wrapping_mul(8) % width.max(1);
    let shade = (counter % 200) as u8;

    RgbImage::from_fn(width, height, |x, y| {
        if x >= bar_x && x < bar_x + bar_width {
            Rgb([255, 255, 255])
        } else {
            Rgb([shade, (y * 255 / height.max(1)) as u8, 64])
        }
    })
}

/// Get a capture function to a video device on a Linux machine.
#[cfg(feature = "v4l2")]
pub fn get_capture_fn_linux(config: &CameraConfig) -> Result<CaptureFn> {
    use rscam::{Camera, Config};

    let device_name = device_path(&config.device);
    let mut cam = Camera::new(&device_name)?;
    let format = config.pixel_format.fourcc();
    log_supported_formats(&cam, format);

    log::info!("Using camera {}", &device_name);

    let requested = (config.width, config.height);
    let resolution = if resolution_supported(&cam, format, requested)? {
        requested
    } else {
        let fallback = get_max_resolution(&cam, format)?;
        log::warn!(
            "Camera {} does not offer {}x{}, using {}x{}",
            &device_name,
            requested.0,
            requested.1,
            fallback.0,
            fallback.1
        );
        fallback
    };

    let requested_interval = (1, config.fps);
    let interval = if interval_supported(&cam, format, resolution, requested_interval)? {
        requested_interval
    } else {
        let fallback = get_max_frame_rate(&cam, format, resolution)?;
        log::warn!(
            "Camera {} does not offer {}fps, using interval {}/{}s",
            &device_name,
            config.fps,
            fallback.0,
            fallback.1
        );
        fallback
    };

    cam.start(&Config {
        interval,
        resolution,
        format,
        ..Default::default()
    })?;

    let pixel_format = config.pixel_format;
    let callback = move || -> Result<RgbImage> {
        let frame = cam.capture()?;
        decode_frame(&frame[..], frame.resolution, pixel_format)
    };
    Ok(Box::new(callback))
}

#[cfg(not(feature = "v4l2"))]
pub fn get_capture_fn_linux(config: &CameraConfig) -> Result<CaptureFn> {
    bail!(
        "cannot open {}: built without the `v4l2` feature",
        device_path(&config.device)
    )
}

/// Decode a raw device buffer to RGB.
pub fn decode_frame(
    data: &[u8],
    resolution: (u32, u32),
    pixel_format: PixelFormat,
) -> Result<RgbImage> {
    match pixel_format {
        PixelFormat::Mjpg => {
            Ok(image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?.to_rgb8())
        }
        PixelFormat::Yuyv => yuyv_to_rgb(data, resolution.0, resolution.1),
    }
}

/// Convert a packed YUYV (YUV 4:2:2) buffer to RGB with BT.601 coefficients.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let expected = width as usize * height as usize * 2;
    if width % 2 != 0 || data.len() < expected {
        bail!(
            "YUYV buffer of {} bytes does not match {}x{}",
            data.len(),
            width,
            height
        );
    }

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for chunk in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow::anyhow!("RGB buffer does not match {}x{}", width, height))
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;

    let r = 1.164 * c + 1.596 * e;
    let g = 1.164 * c - 0.392 * d - 0.813 * e;
    let b = 1.164 * c + 2.017 * d;

    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(feature = "v4l2")]
fn resolution_supported(
    cam: &rscam::Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<bool> {
    Ok(match cam.resolutions(format)? {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions.contains(&resolution),
        rscam::ResolutionInfo::Stepwise { min, max, step: _ } => {
            (min.0..=max.0).contains(&resolution.0) && (min.1..=max.1).contains(&resolution.1)
        }
    })
}

#[cfg(feature = "v4l2")]
fn interval_supported(
    cam: &rscam::Camera,
    format: &[u8],
    resolution: (u32, u32),
    interval: (u32, u32),
) -> Result<bool> {
    Ok(match cam.intervals(format, resolution)? {
        rscam::IntervalInfo::Discretes(intervals) => intervals.contains(&interval),
        rscam::IntervalInfo::Stepwise { min, max, step: _ } => {
            // Compare as fractions of a second
            let seconds = |(num, den): (u32, u32)| num as f64 / den.max(1) as f64;
            (seconds(min)..=seconds(max)).contains(&seconds(interval))
        }
    })
}

/// Get the maximum supported resolution for the given format.
#[cfg(feature = "v4l2")]
fn get_max_resolution(cam: &rscam::Camera, format: &[u8]) -> Result<(u32, u32)> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Highest resolution in terms of number of pixels
            .max_by_key(|res| res.0 * res.1)
            .copied(),
        rscam::ResolutionInfo::Stepwise {
            min: _,
            max,
            step: _,
        } => Some(max),
    }
    .ok_or_else(|| anyhow::anyhow!("No resolution found"))
}

/// Get the interval of the maximum supported frame rate for the given format and resolution.
#[cfg(feature = "v4l2")]
fn get_max_frame_rate(
    cam: &rscam::Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32)> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame intervals: {:?}", &interval_info);
    match interval_info {
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            // Shortest interval is the highest frame rate
            .min_by(|a, b| {
                let a = a.0 as f64 / a.1.max(1) as f64;
                let b = b.0 as f64 / b.1.max(1) as f64;
                a.total_cmp(&b)
            })
            .copied(),
        rscam::IntervalInfo::Stepwise {
            min,
            max: _,
            step: _,
        } => Some(min),
    }
    .ok_or_else(|| anyhow::anyhow!("No frame rate found"))
}

#[cfg(feature = "v4l2")]
fn log_supported_formats(cam: &rscam::Camera, format: &[u8]) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        String::from_utf8_lossy(format)
    );
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_device_path() {
        assert_eq!(device_path("0"), "/dev/video0");
        assert_eq!(device_path("12"), "/dev/video12");
        assert_eq!(device_path("/dev/v4l/by-id/usb-cam"), "/dev/v4l/by-id/usb-cam");
    }

    #[test]
    fn test_synthetic_frames_match_config() -> Result<()> {
        let config = CameraConfig::new(SYNTHETIC_DEVICE, 64, 48, 100);
        let mut capture = open_capture_fn(&config)?;

        let first = capture()?;
        let second = capture()?;
        assert_eq!(first.dimensions(), (64, 48));
        assert_eq!(second.dimensions(), (64, 48));
        assert_ne!(first, second);

        Ok(())
    }

    #[test]
    fn test_unavailable_stub_fails_to_open() {
        let config = CameraConfig::new("stub://unavailable", 64, 48, 30);
        assert!(open_capture_fn(&config).is_err());
    }

    #[test]
    fn test_synthetic_pattern_survives_counter_wrap() {
        // 0xFFFF_FFF8 % 64
        let frame = synthetic_pattern(64, 48, u32::MAX);
        assert_eq!(frame.get_pixel(56, 10), &Rgb([255, 255, 255]));
        assert_eq!(frame.get_pixel(0, 0), &Rgb([95, 0, 64]));

        let wrapped = synthetic_pattern(64, 48, u32::MAX.wrapping_add(1));
        assert_eq!(wrapped.get_pixel(0, 10), &Rgb([255, 255, 255]));
    }

    #[cfg(not(feature = "v4l2"))]
    #[test]
    fn test_device_requires_v4l2_feature() {
        assert!(!device_supported("0"));
        assert!(!device_supported("/dev/video2"));
        assert!(device_supported(SYNTHETIC_DEVICE));
        assert!(device_supported("stub://camera"));

        let config = CameraConfig::new("0", 640, 480, 30);
        let err = open_capture_fn(&config).err().map(|e| e.to_string());
        let err = err.unwrap_or_default();
        assert!(err.contains("/dev/video0"));
        assert!(err.contains("v4l2"));
    }

    #[test]
    fn test_yuyv_gray_and_white() -> Result<()> {
        // Two pixels of black (Y=16) and two of white (Y=235), neutral chroma
        let data = [16, 128, 16, 128, 235, 128, 235, 128];
        let image = yuyv_to_rgb(&data, 2, 2)?;

        assert_eq!(image.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(1, 0), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(0, 1), &Rgb([255, 255, 255]));

        Ok(())
    }

    #[test]
    fn test_yuyv_rejects_short_buffer() {
        assert!(yuyv_to_rgb(&[0; 6], 2, 2).is_err());
    }

    #[test]
    fn test_decode_mjpg_frame() -> Result<()> {
        let image = RgbImage::from_pixel(16, 8, Rgb([10, 200, 30]));
        let jpeg = crate::encoder::encode_jpeg(&image, 90)?;

        let decoded = decode_frame(&jpeg, (16, 8), PixelFormat::Mjpg)?;
        assert_eq!(decoded.dimensions(), (16, 8));

        Ok(())
    }

    #[cfg(feature = "v4l2")]
    #[test]
    fn get_cam_info_if_available() -> Result<()> {
        let cam_name = "/dev/video0";
        let cam = rscam::Camera::new(cam_name);

        match cam {
            Err(err) => println!("Could not initialize camera (maybe non available): {err}"),
            Ok(cam) => {
                let format = b"MJPG";
                let selected_resolution = get_max_resolution(&cam, format)?;
                let interval = get_max_frame_rate(&cam, format, selected_resolution)?;
                println!("Max resolution {selected_resolution:?} at interval {interval:?}");
            }
        }

        Ok(())
    }
}
