//! Bounding box operations, IoU and Kalman measurement conversions

use ndarray::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kalman measurement `[center_x, center_y, area, aspect_ratio]`.
pub type Measurement = [f32; 4];

/// Axis-aligned bounding box.
///
/// Coordinates can be normalized `[0,1]` or absolute pixels depending on
/// context; the tracker operates in normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center_x(&self) -> f32 {
        (self.xmin + self.xmax) / 2.0
    }

    pub fn center_y(&self) -> f32 {
        (self.ymin + self.ymax) / 2.0
    }

    pub fn diagonal(&self) -> f32 {
        let w = self.width().max(0.0);
        let h = self.height().max(0.0);
        (w * w + h * h).sqrt()
    }

    /// Convert to bounds array [xmin, ymin, xmax, ymax]
    pub fn to_bounds(&self) -> [f32; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }

    /// Convert to measurement format [center_x, center_y, area, aspect_ratio]
    /// used for the Kalman filter state representation.
    pub fn to_z(&self) -> Measurement {
        let x = self.center_x();
        let y = self.center_y();
        let s = self.area();
        let r = self.width() / self.height().max(1e-6);
        [x, y, s, r]
    }

    /// Create from measurement format [center_x, center_y, area, aspect_ratio].
    ///
    /// Area and aspect ratio are clamped to 1e-6 so a drifted state never
    /// produces NaN geometry.
    pub fn from_z(z: &Measurement) -> Self {
        let x = z[0];
        let y = z[1];
        let s = z[2].max(1e-6);
        let r = z[3].max(1e-6);

        let w = (s * r).max(0.0).sqrt();
        let h = if w > 0.0 { s / w } else { 0.0 };

        Self {
            xmin: x - w / 2.0,
            ymin: y - h / 2.0,
            xmax: x + w / 2.0,
            ymax: y + h / 2.0,
        }
    }
}

impl fmt::Display for Bbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bbox({}, {}, {}, {})",
            self.xmin, self.ymin, self.xmax, self.ymax
        )
    }
}

/// Unpack a measurement into (center_x, center_y, width, height).
///
/// Shares the same clamps as [`Bbox::from_z`]; used by the ORU virtual
/// trajectory interpolation.
pub fn measurement_to_xywh(z: &Measurement) -> (f32, f32, f32, f32) {
    let s = z[2].max(1e-6);
    let r = z[3].max(1e-6);
    let w = (s * r).max(0.0).sqrt();
    let h = if w > 0.0 { s / w } else { 0.0 };
    (z[0], z[1], w, h)
}

/// Pack (center_x, center_y, width, height) into a measurement.
pub fn xywh_to_measurement(x: f32, y: f32, w: f32, h: f32) -> Measurement {
    let w = w.max(1e-6);
    let h = h.max(1e-6);
    [x, y, w * h, w / h]
}

/// Unit displacement direction between two box centers, as `(dy, dx)`.
///
/// The `(dy, dx)` component order matches the official OC-SORT convention.
pub fn speed_direction(from: &Bbox, to: &Bbox) -> [f32; 2] {
    let dx = to.center_x() - from.center_x();
    let dy = to.center_y() - from.center_y();
    let norm = (dx * dx + dy * dy).sqrt() + 1e-6;
    [dy / norm, dx / norm]
}

/// Calculate IoU between two bounding boxes
pub fn calculate_iou(bbox1: &Bbox, bbox2: &Bbox) -> f32 {
    let x1 = bbox1.xmin.max(bbox2.xmin);
    let y1 = bbox1.ymin.max(bbox2.ymin);
    let x2 = bbox1.xmax.min(bbox2.xmax);
    let y2 = bbox1.ymax.min(bbox2.ymax);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = bbox1.area() + bbox2.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Compute the IoU matrix between detections and tracks with parallel
/// processing. Returns an (n_detections, n_tracks) matrix.
pub fn ious(detections: &[Bbox], tracks: &[Bbox]) -> Array2<f32> {
    let n_dets = detections.len();
    let n_tracks = tracks.len();

    if n_dets == 0 || n_tracks == 0 {
        return Array2::zeros((n_dets, n_tracks));
    }

    let iou_data: Vec<f32> = detections
        .par_iter()
        .flat_map_iter(|det| tracks.iter().map(move |trk| calculate_iou(det, trk)))
        .collect();

    Array2::from_shape_vec((n_dets, n_tracks), iou_data).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_bbox_properties() {
        let bbox = Bbox::new(0.0, 0.0, 0.4, 0.2);
        assert_abs_diff_eq!(bbox.width(), 0.4);
        assert_abs_diff_eq!(bbox.height(), 0.2);
        assert_abs_diff_eq!(bbox.area(), 0.08);
        assert_abs_diff_eq!(bbox.center_x(), 0.2);
        assert_abs_diff_eq!(bbox.center_y(), 0.1);
    }

    #[test]
    fn test_iou_symmetric_and_bounded() {
        let a = Bbox::new(0.0, 0.0, 0.5, 0.5);
        let b = Bbox::new(0.25, 0.25, 0.75, 0.75);
        let ab = calculate_iou(&a, &b);
        let ba = calculate_iou(&b, &a);
        assert_abs_diff_eq!(ab, ba, epsilon = 1e-7);
        assert!((0.0..=1.0).contains(&ab));
        assert_abs_diff_eq!(calculate_iou(&a, &a), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = Bbox::new(0.0, 0.0, 0.1, 0.1);
        let b = Bbox::new(0.5, 0.5, 0.6, 0.6);
        assert_eq!(calculate_iou(&a, &b), 0.0);
    }

    #[test]
    fn test_measurement_roundtrip() {
        let bbox = Bbox::new(0.12, 0.34, 0.56, 0.78);
        let z = bbox.to_z();
        let back = Bbox::from_z(&z);

        assert_abs_diff_eq!(bbox.xmin, back.xmin, epsilon = 1e-5);
        assert_abs_diff_eq!(bbox.ymin, back.ymin, epsilon = 1e-5);
        assert_abs_diff_eq!(bbox.xmax, back.xmax, epsilon = 1e-5);
        assert_abs_diff_eq!(bbox.ymax, back.ymax, epsilon = 1e-5);
    }

    #[test]
    fn test_from_z_clamps_degenerate_scale() {
        let b = Bbox::from_z(&[0.5, 0.5, -1.0, -1.0]);
        assert!(b.width() >= 0.0);
        assert!(b.height() >= 0.0);
        assert!(b.to_bounds().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_speed_direction_is_unit() {
        let from = Bbox::new(0.1, 0.1, 0.2, 0.2);
        let to = Bbox::new(0.4, 0.1, 0.5, 0.2);
        let [dy, dx] = speed_direction(&from, &to);
        assert_abs_diff_eq!(dy, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(dx, 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(dx * dx + dy * dy, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_ious_matrix() {
        let dets = vec![Bbox::new(0.0, 0.0, 0.2, 0.2), Bbox::new(0.5, 0.5, 0.7, 0.7)];
        let trks = vec![Bbox::new(0.0, 0.0, 0.2, 0.2)];
        let m = ious(&dets, &trks);
        assert_eq!(m.shape(), &[2, 1]);
        assert_abs_diff_eq!(m[[0, 0]], 1.0, epsilon = 1e-6);
        assert_eq!(m[[1, 0]], 0.0);
    }
}
