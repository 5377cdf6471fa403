//! JPEG encoding and multipart framing.
//!
use std::{
    io::Cursor,
    time::{Duration, Instant},
};

use anyhow::Result;
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, ColorType, RgbImage};

/// Boundary token separating the parts of an MJPEG stream.
pub const BOUNDARY: &str = "frame";

/// Content type of an MJPEG stream response.
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Frames per FPS measurement window.
pub const FPS_WINDOW: u32 = 30;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI_MARKER: u8 = 0xD9;
const JPEG_SOS_MARKER: u8 = 0xDA;

#[cfg(test)]
const JPEG_EOI: [u8; 2] = [0xFF, JPEG_EOI_MARKER];

/// Encode an RGB frame as JPEG with the given quality (1-100).
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let (width, height) = frame.dimensions();
    let mut buf = Cursor::new(Vec::new());

    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        frame,
        width,
        height,
        ColorType::Rgb8,
    )?;

    Ok(buf.into_inner())
}

/// Frame a JPEG as one part of a `multipart/x-mixed-replace` stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n").as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}

/// Frame rate observed over windows of [`FPS_WINDOW`] frames.
///
/// Reports zero until the first window is complete.
#[derive(Debug)]
pub struct FpsCounter {
    window_start: Instant,
    frames: u32,
    current: f32,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
            current: 0.0,
        }
    }

    /// Count a frame and return the current estimate.
    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> f32 {
        self.frames += 1;
        if self.frames >= FPS_WINDOW {
            let elapsed = now
                .saturating_duration_since(self.window_start)
                .max(Duration::from_micros(1));
            self.current = self.frames as f32 / elapsed.as_secs_f32();
            self.frames = 0;
            self.window_start = now;
        }
        self.current
    }

    pub fn current(&self) -> f32 {
        self.current
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a Motion-JPEG byte stream into its JPEG images.
///
/// Every image runs from a start-of-image marker to the end-of-image marker that follows its
/// entropy-coded data. Marker segments are skipped by their length, so images embedded in them
/// (EXIF thumbnails) stay part of their frame. Bytes between images (multipart headers, padding)
/// are skipped and a trailing incomplete image is dropped.
pub fn split_mjpeg(data: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut pos = 0;

    while let Some(start) = find_marker(data, pos, JPEG_SOI) {
        match find_jpeg_end(data, start) {
            JpegEnd::Complete(end) => {
                frames.push(&data[start..end]);
                pos = end;
            }
            JpegEnd::Truncated => break,
            JpegEnd::Malformed => pos = start + 2,
        }
    }

    frames
}

fn find_marker(data: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|window| window == &marker[..])
        .map(|offset| from + offset)
}

enum JpegEnd {
    /// Offset just past the end-of-image marker
    Complete(usize),
    Truncated,
    Malformed,
}

/// Walk the marker segments of the image starting at `start`.
fn find_jpeg_end(data: &[u8], start: usize) -> JpegEnd {
    let mut pos = start + 2;

    loop {
        let Some(&[prefix, marker]) = data.get(pos..pos + 2) else {
            return JpegEnd::Truncated;
        };
        if prefix != 0xFF {
            return JpegEnd::Malformed;
        }

        match marker {
            JPEG_EOI_MARKER => return JpegEnd::Complete(pos + 2),
            // Fill byte before a marker
            0xFF => pos += 1,
            // Standalone markers without a length
            0x01 | 0xD0..=0xD7 => pos += 2,
            _ => {
                let Some(&[high, low]) = data.get(pos + 2..pos + 4) else {
                    return JpegEnd::Truncated;
                };
                let length = u16::from_be_bytes([high, low]) as usize;
                if length < 2 {
                    return JpegEnd::Malformed;
                }
                pos += 2 + length;

                if marker == JPEG_SOS_MARKER {
                    match skip_entropy_coded(data, pos) {
                        Some(next) => pos = next,
                        None => return JpegEnd::Truncated,
                    }
                }
            }
        }
    }
}

/// Offset of the first marker after entropy-coded data.
///
/// Stuffed `FF 00` bytes and restart markers belong to the scan.
fn skip_entropy_coded(data: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while pos + 1 < data.len() {
        if data[pos] == 0xFF {
            match data[pos + 1] {
                0x00 | 0xD0..=0xD7 => {
                    pos += 2;
                    continue;
                }
                0xFF => {
                    pos += 1;
                    continue;
                }
                _ => return Some(pos),
            }
        }
        pos += 1;
    }

    None
}

#[cfg(test)]
mod test {
    use image::Rgb;

    use super::*;

    #[test]
    fn test_encoded_frame_is_jpeg() -> Result<()> {
        let frame = RgbImage::from_pixel(32, 16, Rgb([200, 10, 10]));
        let jpeg = encode_jpeg(&frame, 80)?;

        assert!(jpeg.starts_with(&JPEG_SOI));
        assert!(jpeg.ends_with(&JPEG_EOI));
        let decoded = image::load_from_memory(&jpeg)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (32, 16));

        Ok(())
    }

    #[test]
    fn test_stream_item_framing() {
        let item = as_jpeg_stream_item(&[0xFF, 0xD8, 0x01, 0xFF, 0xD9]);

        assert!(item.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(item.ends_with(&[0xFF, 0xD9, b'\r', b'\n', b'\r', b'\n']));
    }

    #[test]
    fn test_fps_counter_updates_per_window() {
        let start = Instant::now();
        let mut counter = FpsCounter {
            window_start: start,
            frames: 0,
            current: 0.0,
        };

        for i in 1..FPS_WINDOW {
            let fps = counter.tick_at(start + Duration::from_millis(10 * i as u64));
            assert_eq!(fps, 0.0);
        }
        let fps = counter.tick_at(start + Duration::from_secs(1));
        assert!((fps - FPS_WINDOW as f32).abs() < 1e-3);
        assert_eq!(counter.frames, 0);
        assert_eq!(counter.current(), fps);
    }

    #[test]
    fn test_split_mjpeg() -> Result<()> {
        let first = encode_jpeg(&RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])), 90)?;
        let second = encode_jpeg(&RgbImage::from_pixel(16, 8, Rgb([4, 5, 6])), 90)?;

        let mut data = Vec::new();
        data.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        data.extend_from_slice(&first);
        data.extend_from_slice(b"\r\n\r\n");
        data.extend_from_slice(&second);
        // Truncated third image
        data.extend_from_slice(&first[..first.len() / 2]);

        let frames = split_mjpeg(&data);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], &first[..]);
        assert_eq!(frames[1], &second[..]);

        Ok(())
    }

    /// JPEG carrying another JPEG as thumbnail in its APP1 segment.
    fn with_exif_thumbnail(jpeg: &[u8], thumbnail: &[u8]) -> Vec<u8> {
        let mut payload = b"Exif\0\0".to_vec();
        payload.extend_from_slice(thumbnail);
        let length = (payload.len() + 2) as u16;

        let mut data = JPEG_SOI.to_vec();
        data.extend_from_slice(&[0xFF, 0xE1]);
        data.extend_from_slice(&length.to_be_bytes());
        data.extend_from_slice(&payload);
        data.extend_from_slice(&jpeg[2..]);
        data
    }

    #[test]
    fn test_split_mjpeg_keeps_embedded_thumbnail() -> Result<()> {
        let thumbnail = encode_jpeg(&RgbImage::from_pixel(8, 8, Rgb([9, 9, 9])), 80)?;
        let main = encode_jpeg(&RgbImage::from_pixel(24, 16, Rgb([200, 100, 50])), 90)?;
        let frame = with_exif_thumbnail(&main, &thumbnail);
        assert!(frame.windows(2).filter(|w| *w == &JPEG_EOI[..]).count() >= 2);

        let mut data = frame.clone();
        data.extend_from_slice(&frame);

        let frames = split_mjpeg(&data);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], &frame[..]);
        assert_eq!(frames[1], &frame[..]);
        let decoded = image::load_from_memory(frames[0])?.to_rgb8();
        assert_eq!(decoded.dimensions(), (24, 16));

        Ok(())
    }

    #[test]
    fn test_split_mjpeg_scan_with_stuffing_and_restarts() {
        let frame = [
            0xFF, 0xD8, // SOI
            0xFF, 0xDA, 0x00, 0x02, // SOS with empty header
            0x12, 0xFF, 0x00, 0x34, 0xFF, 0xD0, 0x56, 0xFF, 0xD1, // scan data
            0xFF, 0xD9, // EOI
        ];
        let mut data = b"--frame\r\n\r\n".to_vec();
        data.extend_from_slice(&frame);
        data.extend_from_slice(&frame[..8]);

        let frames = split_mjpeg(&data);
        assert_eq!(frames, vec![&frame[..]]);
    }

    #[test]
    fn test_split_mjpeg_skips_malformed_image() -> Result<()> {
        let jpeg = encode_jpeg(&RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])), 90)?;
        // Start marker followed by garbage instead of a segment
        let mut data = vec![0xFF, 0xD8, 0x00, 0x11];
        data.extend_from_slice(&jpeg);

        let frames = split_mjpeg(&data);
        assert_eq!(frames, vec![&jpeg[..]]);

        Ok(())
    }

    #[test]
    fn test_split_mjpeg_without_images() {
        assert!(split_mjpeg(b"not a video").is_empty());
        assert!(split_mjpeg(&[]).is_empty());
    }
}
