//! Decoding of raw YOLO head output into image-space detections.
//!
//! The raw output is a channel-first `[1 x (4 + classes) x anchors]` buffer:
//! all `cx` values, then all `cy`, `w`, `h`, then one row of scores per
//! class. Decoding picks the best class per anchor, applies the confidence
//! threshold, maps boxes back to original image coordinates, and runs
//! per-class non-maximum suppression.

use std::cmp::Ordering;

use crate::DetectorError;
use crate::preprocess::InputSize;

/// Detection thresholds and head layout.
#[derive(Debug, Clone)]
pub struct PostprocessConfig {
    /// Minimum confidence score for a candidate to be kept.
    pub confidence_threshold: f32,
    /// IoU above which a lower-confidence detection of the same class is
    /// suppressed.
    pub nms_threshold: f32,
    /// Class scores per anchor row. 80 for COCO-trained heads.
    pub num_classes: usize,
    /// Single-class heads carry one confidence value at row 4 instead of a
    /// score per class.
    pub single_class: bool,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            num_classes: 80,
            single_class: false,
        }
    }
}

impl PostprocessConfig {
    /// Channels per anchor: 4 bbox values plus the score rows.
    pub fn data_width(&self) -> usize {
        if self.single_class {
            5
        } else {
            4 + self.num_classes
        }
    }
}

/// Axis-aligned bounding box in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    #[inline]
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    #[inline]
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection over union with another box, clamped to `[0, 1]`.
    #[inline]
    pub fn iou(&self, other: &Self) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            (intersection / union).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// One decoded detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: usize,
}

/// Decode a raw output buffer into NMS-filtered detections ordered by
/// descending confidence. Boxes are returned unclipped, in original image
/// coordinates obtained by scaling back from the model input dimensions.
pub fn decode_predictions(
    raw: &[f32],
    anchors: usize,
    model_size: InputSize,
    image_size: (u32, u32),
    config: &PostprocessConfig,
) -> Result<Vec<Detection>, DetectorError> {
    let data_width = config.data_width();
    let needed = anchors * data_width;
    if raw.len() < needed {
        return Err(DetectorError::InsufficientBuffer {
            needed,
            available: raw.len(),
        });
    }
    if model_size.width == 0 || model_size.height == 0 {
        return Err(DetectorError::InvalidInput(
            "model input dimensions must be non-zero".into(),
        ));
    }

    let scale_x = image_size.0 as f32 / model_size.width as f32;
    let scale_y = image_size.1 as f32 / model_size.height as f32;

    let mut detections = Vec::new();
    for i in 0..anchors {
        let cx = raw[i];
        let cy = raw[anchors + i];
        let w = raw[2 * anchors + i];
        let h = raw[3 * anchors + i];

        let (confidence, class_id) = if config.single_class {
            (raw[4 * anchors + i], 0)
        } else {
            let mut best = 0.0f32;
            let mut best_class = 0usize;
            for c in 0..config.num_classes {
                let score = raw[(4 + c) * anchors + i];
                if score > best {
                    best = score;
                    best_class = c;
                }
            }
            (best, best_class)
        };

        if !confidence.is_finite() || confidence < config.confidence_threshold {
            continue;
        }

        detections.push(Detection {
            bbox: BoundingBox {
                x: (cx - w / 2.0) * scale_x,
                y: (cy - h / 2.0) * scale_y,
                width: w * scale_x,
                height: h * scale_y,
            },
            confidence,
            class_id,
        });
    }

    apply_nms_per_class(&mut detections, config.nms_threshold);
    Ok(detections)
}

/// Per-class non-maximum suppression over candidates sorted by descending
/// confidence. The sort is stable, so equal-confidence candidates keep
/// their input order. Cross-class overlaps never suppress.
pub fn apply_nms_per_class(detections: &mut Vec<Detection>, threshold: f32) {
    let len = detections.len();
    if len <= 1 {
        return;
    }

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut suppressed = vec![false; len];
    let mut keep = 0;

    for i in 0..len {
        if suppressed[i] {
            continue;
        }

        if keep != i {
            detections.swap(keep, i);
            suppressed.swap(keep, i);
        }

        let reference = detections[keep].clone();
        for j in (keep + 1)..len {
            if suppressed[j] || detections[j].class_id != reference.class_id {
                continue;
            }
            if reference.bbox.iou(&detections[j].bbox) > threshold {
                suppressed[j] = true;
            }
        }

        keep += 1;
    }

    detections.truncate(keep);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Build a channel-first raw buffer from (cx, cy, w, h, scores) rows.
    fn raw_from_rows(rows: &[(f32, f32, f32, f32, Vec<f32>)], num_classes: usize) -> Vec<f32> {
        let anchors = rows.len();
        let mut raw = vec![0.0f32; anchors * (4 + num_classes)];
        for (i, (cx, cy, w, h, scores)) in rows.iter().enumerate() {
            raw[i] = *cx;
            raw[anchors + i] = *cy;
            raw[2 * anchors + i] = *w;
            raw[3 * anchors + i] = *h;
            for (c, score) in scores.iter().enumerate() {
                raw[(4 + c) * anchors + i] = *score;
            }
        }
        raw
    }

    fn config(classes: usize) -> PostprocessConfig {
        PostprocessConfig {
            confidence_threshold: 0.25,
            nms_threshold: 0.45,
            num_classes: classes,
            single_class: false,
        }
    }

    #[test]
    fn same_class_overlap_keeps_higher_confidence() {
        let rows = vec![
            (100.0, 100.0, 50.0, 50.0, vec![0.9, 0.0]),
            (102.0, 101.0, 50.0, 50.0, vec![0.7, 0.0]),
        ];
        let raw = raw_from_rows(&rows, 2);
        let dets = decode_predictions(
            &raw,
            rows.len(),
            InputSize::new(640, 640),
            (640, 640),
            &config(2),
        )
        .unwrap();

        assert_eq!(dets.len(), 1);
        assert!((dets[0].confidence - 0.9).abs() < f32::EPSILON);
        assert_eq!(dets[0].class_id, 0);
    }

    #[test]
    fn cross_class_identical_boxes_both_survive() {
        let rows = vec![
            (100.0, 100.0, 40.0, 40.0, vec![0.9, 0.0]),
            (100.0, 100.0, 40.0, 40.0, vec![0.0, 0.8]),
        ];
        let raw = raw_from_rows(&rows, 2);
        let dets = decode_predictions(
            &raw,
            rows.len(),
            InputSize::new(640, 640),
            (640, 640),
            &config(2),
        )
        .unwrap();

        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_id, 0);
        assert_eq!(dets[1].class_id, 1);
        assert!((dets[0].bbox.iou(&dets[1].bbox) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn coordinates_scale_back_to_image_space() {
        let rows = vec![(320.0, 320.0, 64.0, 32.0, vec![0.9])];
        let raw = raw_from_rows(&rows, 1);
        let dets = decode_predictions(
            &raw,
            rows.len(),
            InputSize::new(640, 640),
            (1920, 1080),
            &config(1),
        )
        .unwrap();

        let sx = 1920.0 / 640.0;
        let sy = 1080.0 / 640.0;
        let (cx, cy) = dets[0].bbox.center();
        assert!((cx - 320.0 * sx).abs() < 1e-3);
        assert!((cy - 320.0 * sy).abs() < 1e-3);
        assert!((dets[0].bbox.width - 64.0 * sx).abs() < 1e-3);
        assert!((dets[0].bbox.height - 32.0 * sy).abs() < 1e-3);
    }

    #[test]
    fn output_is_ordered_by_descending_confidence() {
        let rows = vec![
            (50.0, 50.0, 10.0, 10.0, vec![0.4, 0.0]),
            (200.0, 200.0, 10.0, 10.0, vec![0.0, 0.95]),
            (400.0, 400.0, 10.0, 10.0, vec![0.7, 0.0]),
        ];
        let raw = raw_from_rows(&rows, 2);
        let dets = decode_predictions(
            &raw,
            rows.len(),
            InputSize::new(640, 640),
            (640, 640),
            &config(2),
        )
        .unwrap();

        let confidences: Vec<f32> = dets.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.95, 0.7, 0.4]);
    }

    #[test]
    fn equal_confidence_ties_keep_input_order() {
        let mut dets = vec![
            Detection {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 10.0,
                    height: 10.0,
                },
                confidence: 0.5,
                class_id: 0,
            },
            Detection {
                bbox: BoundingBox {
                    x: 100.0,
                    y: 100.0,
                    width: 10.0,
                    height: 10.0,
                },
                confidence: 0.5,
                class_id: 1,
            },
        ];
        apply_nms_per_class(&mut dets, 0.45);
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_id, 0);
        assert_eq!(dets[1].class_id, 1);
    }

    #[test]
    fn single_class_head_reads_row_four() {
        let anchors = 2;
        let mut raw = vec![0.0f32; anchors * 5];
        raw[0] = 320.0; // cx
        raw[anchors] = 240.0; // cy
        raw[2 * anchors] = 20.0; // w
        raw[3 * anchors] = 20.0; // h
        raw[4 * anchors] = 0.85; // confidence
        let cfg = PostprocessConfig {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            num_classes: 80,
            single_class: true,
        };
        let dets =
            decode_predictions(&raw, anchors, InputSize::new(640, 640), (640, 640), &cfg).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 0);
        assert!((dets[0].confidence - 0.85).abs() < f32::EPSILON);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let raw = vec![0.0f32; 10];
        let err = decode_predictions(
            &raw,
            8400,
            InputSize::new(640, 640),
            (640, 640),
            &PostprocessConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DetectorError::InsufficientBuffer { .. }));
    }

    #[test]
    fn boxes_are_not_clipped_to_image_bounds() {
        let rows = vec![(5.0, 5.0, 40.0, 40.0, vec![0.9])];
        let raw = raw_from_rows(&rows, 1);
        let dets = decode_predictions(
            &raw,
            rows.len(),
            InputSize::new(640, 640),
            (640, 640),
            &config(1),
        )
        .unwrap();
        assert!(dets[0].bbox.x < 0.0);
        assert!(dets[0].bbox.y < 0.0);
    }
}
