//! Object detection models.
//!
use std::{collections::HashSet, path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use common::protocol::{BoundingBox, Detection};
use image::RgbImage;
use tract_onnx::prelude::*;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Number of box coordinates preceding the class scores in a YOLOv8 prediction.
const CXCYWH_OFFSET: usize = 4;

/// Synchronous detector shared between request handlers.
pub trait InferModel: Send + Sync {
    /// Detect objects with a confidence of at least `min_confidence`.
    ///
    /// Boxes are given in pixel coordinates of `frame`, sorted by descending confidence.
    fn infer(&self, frame: &RgbImage, min_confidence: f32) -> Result<Vec<Detection>>;

    /// Labels indexed by class ID.
    fn class_names(&self) -> &[String];
}

/// YOLOv8 detector exported to ONNX, run with tract.
pub struct YoloModel {
    model: NnModel,
    input_size: u32,
    max_iou: f32,
    class_names: Vec<String>,
}

impl YoloModel {
    pub fn new(
        path: impl AsRef<Path>,
        input_size: u32,
        max_iou: f32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let size = input_size as usize;
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size));
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("failed to read model {}", path.display()))?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;

        Ok(Self {
            model,
            input_size,
            max_iou,
            class_names,
        })
    }

    fn preproc(&self, frame: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            frame,
            self.input_size,
            self.input_size,
            image::imageops::FilterType::Triangle,
        );

        let size = self.input_size as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            resized[(x as _, y as _)][c] as f32 / 255.0
        })
        .into()
    }

    fn postproc(
        &self,
        raw_nn_out: &Tensor,
        frame_size: (u32, u32),
        min_confidence: f32,
    ) -> Result<Vec<Detection>> {
        let output = raw_nn_out
            .to_array_view::<f32>()?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not three-dimensional")?;

        decode_yolov8(
            output,
            self.input_size,
            frame_size,
            min_confidence,
            self.max_iou,
            &self.class_names,
        )
    }
}

/// Decode a YOLOv8 output tensor into detections on the original frame.
///
/// The output is `[1, 4 + classes, anchors]` or, for some exports, `[1, anchors, 4 + classes]`.
/// Each anchor holds a box as center, width and height in model input pixels followed by one
/// score per class. Boxes are scaled to `frame_size` and clamped to the frame, the best class
/// below `min_confidence` is dropped and the rest goes through per-class NMS.
pub fn decode_yolov8(
    output: tract_ndarray::ArrayView3<f32>,
    input_size: u32,
    frame_size: (u32, u32),
    min_confidence: f32,
    max_iou: f32,
    class_names: &[String],
) -> Result<Vec<Detection>> {
    let shape = output.shape().to_vec();
    if shape[0] != 1 {
        bail!("unexpected model output shape {:?}", shape);
    }

    // Some exports put the anchors first
    let predictions = output.index_axis_move(tract_ndarray::Axis(0), 0);
    let predictions = if shape[1] > shape[2] {
        predictions.reversed_axes()
    } else {
        predictions
    };
    if predictions.shape()[0] <= CXCYWH_OFFSET {
        bail!("model output has no class scores: {:?}", shape);
    }

    let scale_x = frame_size.0 as f32 / input_size as f32;
    let scale_y = frame_size.1 as f32 / input_size as f32;
    let (max_x, max_y) = (frame_size.0 as f32, frame_size.1 as f32);

    let mut candidates = Vec::new();
    for prediction in predictions.axis_iter(tract_ndarray::Axis(1)) {
        let best = prediction
            .iter()
            .skip(CXCYWH_OFFSET)
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (id, &score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((id, score)),
            });
        let Some((class_id, confidence)) = best else {
            continue;
        };
        if confidence < min_confidence {
            continue;
        }

        let (cx, cy) = (prediction[0] * scale_x, prediction[1] * scale_y);
        let (w, h) = (prediction[2] * scale_x, prediction[3] * scale_y);
        let bbox = BoundingBox::new(
            (cx - w / 2.0).clamp(0.0, max_x),
            (cy - h / 2.0).clamp(0.0, max_y),
            (cx + w / 2.0).clamp(0.0, max_x),
            (cy + h / 2.0).clamp(0.0, max_y),
        );

        candidates.push(Detection {
            class_id,
            label: class_label(class_names, class_id),
            confidence,
            bbox,
        });
    }

    Ok(non_maximum_suppression(candidates, max_iou))
}

impl InferModel for YoloModel {
    fn infer(&self, frame: &RgbImage, min_confidence: f32) -> Result<Vec<Detection>> {
        let valid_input = tvec!(self.preproc(frame).into());
        let raw_nn_out = self.model.run(valid_input)?;
        self.postproc(&raw_nn_out[0], frame.dimensions(), min_confidence)
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

/// Detector reporting only an allow-listed set of labels.
pub struct ClassFilter {
    inner: Arc<dyn InferModel>,
    allowed: HashSet<String>,
}

impl ClassFilter {
    pub fn new(inner: Arc<dyn InferModel>, allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner,
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl InferModel for ClassFilter {
    fn infer(&self, frame: &RgbImage, min_confidence: f32) -> Result<Vec<Detection>> {
        let mut detections = self.inner.infer(frame, min_confidence)?;
        detections.retain(|detection| self.allowed.contains(&detection.label));
        Ok(detections)
    }

    fn class_names(&self) -> &[String] {
        self.inner.class_names()
    }
}

/// Read one label per line, or the COCO labels when no file is given.
pub fn load_class_names(path: Option<&Path>) -> Result<Vec<String>> {
    let Some(path) = path else {
        return Ok(COCO_CLASSES.iter().map(|name| name.to_string()).collect());
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read class names from {}", path.display()))?;
    let names: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect();
    if names.is_empty() {
        bail!("no class names in {}", path.display());
    }

    Ok(names)
}

fn class_label(class_names: &[String], class_id: usize) -> String {
    class_names
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| format!("class_{class_id}"))
}

/// Run non-maximum-suppression per class on candidate detections.
///
/// Start with the most confident detection and iterate over all others in the order of sinking
/// confidence. A candidate is kept only if its IoU with every kept detection of the same class is
/// at most `max_iou`.
pub fn non_maximum_suppression(mut candidates: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut selected: Vec<Detection> = Vec::with_capacity(candidates.len());
    'candidates: for candidate in candidates {
        for kept in selected.iter() {
            if kept.class_id == candidate.class_id && iou(&kept.bbox, &candidate.bbox) > max_iou {
                continue 'candidates;
            }
        }
        selected.push(candidate);
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
pub fn iou(bbox_a: &BoundingBox, bbox_b: &BoundingBox) -> f32 {
    // If the boxes do not overlap, the overlap box is inverted and its area zero.
    let overlap_box = BoundingBox::new(
        f32::max(bbox_a.x1, bbox_b.x1),
        f32::max(bbox_a.y1, bbox_b.y1),
        f32::min(bbox_a.x2, bbox_b.x2),
        f32::min(bbox_a.y2, bbox_b.y2),
    );

    let overlap_area = overlap_box.area();

    // Avoid division-by-zero with `EPS`
    overlap_area / (bbox_a.area() + bbox_b.area() - overlap_area + EPS)
}

/// Labels of the 80 COCO classes the stock YOLOv8 weights are trained on.
pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn detection(class_id: usize, confidence: f32, bbox: [f32; 4]) -> Detection {
        Detection {
            class_id,
            label: class_label(&load_class_names(None).unwrap_or_default(), class_id),
            confidence,
            bbox: BoundingBox::new(bbox[0], bbox[1], bbox[2], bbox[3]),
        }
    }

    struct FixedModel(Vec<Detection>);

    impl InferModel for FixedModel {
        fn infer(&self, _frame: &RgbImage, _min_confidence: f32) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }

        fn class_names(&self) -> &[String] {
            &[]
        }
    }

    fn assert_bbox(bbox: &BoundingBox, expected: [f32; 4]) {
        let actual = [bbox.x1, bbox.y1, bbox.x2, bbox.y2];
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-3, "{actual:?} != {expected:?}");
        }
    }

    /// YOLOv8 output for two classes and eight anchors, channels first.
    fn yolov8_output() -> tract_ndarray::Array3<f32> {
        let mut output = tract_ndarray::Array3::<f32>::zeros((1, 6, 8));
        let anchors = [
            // cx, cy, w, h, person, car
            [320.0, 320.0, 100.0, 100.0, 0.9, 0.1],
            // Sticks out over the top right corner
            [620.0, 40.0, 100.0, 100.0, 0.2, 0.8],
            // Below the threshold
            [100.0, 100.0, 50.0, 50.0, 0.1, 0.05],
        ];
        for (anchor, values) in anchors.iter().enumerate() {
            for (channel, value) in values.iter().enumerate() {
                output[[0, channel, anchor]] = *value;
            }
        }
        output
    }

    fn check_decoded(detections: &[Detection]) {
        assert_eq!(detections.len(), 2);

        assert_eq!(detections[0].class_id, 0);
        assert_eq!(detections[0].label, "person");
        assert!((detections[0].confidence - 0.9).abs() < 1e-6);
        assert_bbox(&detections[0].bbox, [135.0, 101.25, 185.0, 138.75]);

        assert_eq!(detections[1].class_id, 1);
        assert_eq!(detections[1].label, "car");
        assert!((detections[1].confidence - 0.8).abs() < 1e-6);
        assert_bbox(&detections[1].bbox, [285.0, 0.0, 320.0, 33.75]);
    }

    #[test]
    fn test_decode_yolov8_channels_first() -> Result<()> {
        let names = vec!["person".to_string(), "car".to_string()];
        let output = yolov8_output();

        let detections = decode_yolov8(output.view(), 640, (320, 240), 0.25, 0.45, &names)?;
        check_decoded(&detections);

        Ok(())
    }

    #[test]
    fn test_decode_yolov8_anchors_first() -> Result<()> {
        let names = vec!["person".to_string(), "car".to_string()];
        let output = yolov8_output();
        let transposed = output.view().permuted_axes([0, 2, 1]);
        assert_eq!(transposed.shape(), &[1, 8, 6]);

        let detections = decode_yolov8(transposed, 640, (320, 240), 0.25, 0.45, &names)?;
        check_decoded(&detections);

        Ok(())
    }

    #[test]
    fn test_decode_yolov8_rejects_bad_output() {
        let names = vec!["person".to_string()];

        let boxes_only = tract_ndarray::Array3::<f32>::zeros((1, 4, 8));
        assert!(decode_yolov8(boxes_only.view(), 640, (320, 240), 0.25, 0.45, &names).is_err());

        let batched = tract_ndarray::Array3::<f32>::zeros((2, 5, 8));
        assert!(decode_yolov8(batched.view(), 640, (320, 240), 0.25, 0.45, &names).is_err());
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        let c = BoundingBox::new(20.0, 20.0, 30.0, 30.0);

        assert!((iou(&a, &a) - 1.0).abs() < 1e-4);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-4);
        assert_eq!(iou(&a, &c), 0.0);
    }

    #[test]
    fn test_nms_keeps_most_confident_per_class() {
        let candidates = vec![
            detection(0, 0.6, [1.0, 1.0, 11.0, 11.0]),
            detection(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
            // Same place, other class
            detection(2, 0.5, [0.0, 0.0, 10.0, 10.0]),
            // Same class, no overlap
            detection(0, 0.4, [50.0, 50.0, 60.0, 60.0]),
        ];

        let selected = non_maximum_suppression(candidates, 0.45);
        let confidences: Vec<f32> = selected.iter().map(|d| d.confidence).collect();

        assert_eq!(confidences, vec![0.9, 0.5, 0.4]);
        assert_eq!(selected[1].label, "car");
    }

    #[test]
    fn test_class_filter() -> Result<()> {
        let inner = Arc::new(FixedModel(vec![
            detection(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
            detection(2, 0.8, [20.0, 20.0, 30.0, 30.0]),
        ]));
        let filtered = ClassFilter::new(inner, vec!["car".to_string()]);

        let detections = filtered.infer(&RgbImage::new(4, 4), 0.25)?;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "car");

        Ok(())
    }

    #[test]
    fn test_class_names() -> Result<()> {
        let coco = load_class_names(None)?;
        assert_eq!(coco.len(), 80);
        assert_eq!(coco[0], "person");
        assert_eq!(class_label(&coco, 80), "class_80");

        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "vehicle\n\n  person \nanimal")?;
        let names = load_class_names(Some(file.path()))?;
        assert_eq!(names, vec!["vehicle", "person", "animal"]);

        Ok(())
    }

    #[test]
    fn test_missing_model_fails() {
        let result = YoloModel::new("does-not-exist.onnx", 640, 0.45, vec![]);
        assert!(result.is_err());
    }
}
