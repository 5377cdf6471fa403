//! Drawing detections and overlays onto frames.
//!
use std::path::Path;

use common::protocol::Detection;
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use rusttype::{Font, Scale};

const LABEL_SCALE: Scale = Scale { x: 16.0, y: 16.0 };
const FPS_SCALE: Scale = Scale { x: 22.0, y: 22.0 };
const FPS_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// Box colors, picked by class ID.
const PALETTE: [[u8; 3]; 12] = [
    [255, 56, 56],
    [72, 249, 10],
    [0, 194, 255],
    [255, 178, 29],
    [207, 210, 49],
    [146, 204, 23],
    [61, 219, 134],
    [26, 147, 52],
    [0, 212, 187],
    [44, 153, 168],
    [132, 56, 255],
    [255, 55, 199],
];

/// Draws boxes, labels and the FPS counter.
///
/// Without a font only the boxes are drawn.
pub struct Annotator {
    font: Option<Font<'static>>,
}

impl Annotator {
    pub fn new(font: Option<Font<'static>>) -> Self {
        Self { font }
    }

    /// Load the label font, falling back to box-only annotations if it is unusable.
    pub fn load(font_path: &Path) -> Self {
        match load_font(font_path) {
            Ok(font) => Self::new(Some(font)),
            Err(err) => {
                log::warn!(
                    "Cannot use font {}: {err:#}; drawing boxes without labels",
                    font_path.display()
                );
                Self::new(None)
            }
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw bounding boxes with labels and confidence scores on the image.
    pub fn draw_detections(&self, frame: &mut RgbImage, detections: &[Detection]) {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return;
        }

        for detection in detections.iter() {
            let color = class_color(detection.class_id);
            let bbox = &detection.bbox;

            // Coordinate frame basis is on the top left corner
            let x_tl = (bbox.x1.max(0.0) as u32).min(width - 1);
            let y_tl = (bbox.y1.max(0.0) as u32).min(height - 1);
            let rect_width = (bbox.width() as u32).clamp(1, width - x_tl);
            let rect_height = (bbox.height() as u32).clamp(1, height - y_tl);

            let rect = Rect::at(x_tl as i32, y_tl as i32).of_size(rect_width, rect_height);
            draw_hollow_rect_mut(frame, rect, color);
            if rect_width > 2 && rect_height > 2 {
                let inner = Rect::at(x_tl as i32 + 1, y_tl as i32 + 1)
                    .of_size(rect_width - 2, rect_height - 2);
                draw_hollow_rect_mut(frame, inner, color);
            }

            if let Some(font) = &self.font {
                let label = format!("{} {:.2}", &detection.label, detection.confidence);
                let (text_width, text_height) = text_size(LABEL_SCALE, font, &label);
                let label_height = text_height.max(1) + 4;
                // Above the box, inside it when there is no room
                let label_y = if y_tl as i32 >= label_height {
                    y_tl as i32 - label_height
                } else {
                    y_tl as i32
                };

                let background = Rect::at(x_tl as i32, label_y)
                    .of_size((text_width.max(1) + 4) as u32, label_height as u32);
                draw_filled_rect_mut(frame, background, color);
                draw_text_mut(
                    frame,
                    LABEL_TEXT_COLOR,
                    x_tl as i32 + 2,
                    label_y + 2,
                    LABEL_SCALE,
                    font,
                    &label,
                );
            }
        }
    }

    /// Draw the observed frame rate in the top left corner.
    pub fn draw_fps(&self, frame: &mut RgbImage, fps: f32) {
        if let Some(font) = &self.font {
            draw_text_mut(
                frame,
                FPS_COLOR,
                10,
                10,
                FPS_SCALE,
                font,
                &format!("FPS: {fps:.1}"),
            );
        }
    }
}

pub fn class_color(class_id: usize) -> Rgb<u8> {
    Rgb(PALETTE[class_id % PALETTE.len()])
}

fn load_font(path: &Path) -> anyhow::Result<Font<'static>> {
    let font_data = std::fs::read(path)?;
    Font::try_from_vec(font_data).ok_or_else(|| anyhow::anyhow!("not a TrueType font"))
}

#[cfg(test)]
mod test {
    use common::protocol::BoundingBox;

    use super::*;

    fn detection(class_id: usize, bbox: BoundingBox) -> Detection {
        Detection {
            class_id,
            label: "person".into(),
            confidence: 0.87,
            bbox,
        }
    }

    #[test]
    fn test_box_drawn_in_class_color() {
        let annotator = Annotator::new(None);
        let mut frame = RgbImage::new(100, 80);
        let detections = vec![detection(1, BoundingBox::new(10.0, 20.0, 50.0, 60.0))];

        annotator.draw_detections(&mut frame, &detections);

        assert_eq!(frame.get_pixel(10, 20), &class_color(1));
        assert_eq!(frame.get_pixel(30, 20), &class_color(1));
        assert_eq!(frame.get_pixel(30, 40), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_boxes_outside_frame_are_clamped() {
        let annotator = Annotator::new(None);
        let mut frame = RgbImage::new(40, 30);
        let detections = vec![
            detection(0, BoundingBox::new(-20.0, -5.0, 500.0, 400.0)),
            detection(0, BoundingBox::new(39.5, 29.5, 39.5, 29.5)),
        ];

        annotator.draw_detections(&mut frame, &detections);

        assert_eq!(frame.get_pixel(0, 0), &class_color(0));
        assert_eq!(frame.get_pixel(39, 29), &class_color(0));
    }

    #[test]
    fn test_missing_font_disables_text() {
        let annotator = Annotator::load(Path::new("/nonexistent/font.ttf"));
        assert!(!annotator.has_font());

        let mut frame = RgbImage::new(64, 48);
        annotator.draw_fps(&mut frame, 29.9);
        assert!(frame.pixels().all(|pixel| *pixel == Rgb([0, 0, 0])));
    }
}
