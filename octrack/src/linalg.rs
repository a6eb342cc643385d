//! Small-matrix inverse and projective warp helpers

use crate::bbox::Bbox;
use nalgebra::{DMatrix, Matrix3};

/// Pivot magnitudes below this are treated as numerically singular.
const PIVOT_EPS: f32 = 1e-10;
/// Regularization value substituted for a singular pivot.
const PIVOT_REGULARIZATION: f32 = 1e-6;

/// Invert a small square matrix by Gauss-Jordan elimination with partial
/// pivoting.
///
/// Near-singular pivots are replaced with a small regularization value
/// instead of failing, so the Kalman update can always proceed. Intended
/// for well-conditioned matrices up to 7x7; relative error stays within
/// 1e-4 there.
pub fn regularized_inverse(m: &DMatrix<f32>) -> DMatrix<f32> {
    debug_assert!(m.is_square());
    let n = m.nrows();

    // Augmented matrix [A | I]
    let mut aug = DMatrix::<f32>::zeros(n, 2 * n);
    for i in 0..n {
        for j in 0..n {
            aug[(i, j)] = m[(i, j)];
        }
        aug[(i, n + i)] = 1.0;
    }

    for col in 0..n {
        // Partial pivoting
        let mut max_row = col;
        let mut max_val = aug[(col, col)].abs();
        for row in col + 1..n {
            let v = aug[(row, col)].abs();
            if v > max_val {
                max_val = v;
                max_row = row;
            }
        }
        if max_row != col {
            aug.swap_rows(col, max_row);
        }

        let mut pivot = aug[(col, col)];
        if pivot.abs() < PIVOT_EPS {
            pivot = PIVOT_REGULARIZATION;
            aug[(col, col)] = pivot;
        }

        for j in 0..2 * n {
            aug[(col, j)] /= pivot;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = aug[(row, col)];
            if factor == 0.0 {
                continue;
            }
            for j in 0..2 * n {
                aug[(row, j)] -= factor * aug[(col, j)];
            }
        }
    }

    let mut inv = DMatrix::<f32>::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            inv[(i, j)] = aug[(i, n + j)];
        }
    }
    inv
}

/// Apply a 3x3 projective warp to a point in pixel coordinates.
pub fn warp_point(w: &Matrix3<f32>, x: f32, y: f32) -> (f32, f32) {
    let nx = w[(0, 0)] * x + w[(0, 1)] * y + w[(0, 2)];
    let ny = w[(1, 0)] * x + w[(1, 1)] * y + w[(1, 2)];
    let d = w[(2, 0)] * x + w[(2, 1)] * y + w[(2, 2)];
    if d.abs() < 1e-6 {
        return (nx, ny);
    }
    (nx / d, ny / d)
}

/// Warp a normalized bbox through a pixel-space warp.
///
/// Converts to absolute pixels, warps all four corners, takes the
/// axis-aligned hull and converts back. Degenerate corner ordering is
/// repaired by swapping. Identity when frame dimensions are non-positive.
pub fn warp_bbox_norm(b: &Bbox, w: &Matrix3<f32>, frame_w: u32, frame_h: u32) -> Bbox {
    if frame_w == 0 || frame_h == 0 {
        return *b;
    }
    let fw = frame_w as f32;
    let fh = frame_h as f32;

    let x1 = b.xmin * fw;
    let y1 = b.ymin * fh;
    let x2 = b.xmax * fw;
    let y2 = b.ymax * fh;

    let corners = [
        warp_point(w, x1, y1),
        warp_point(w, x2, y1),
        warp_point(w, x2, y2),
        warp_point(w, x1, y2),
    ];

    let mut minx = corners[0].0;
    let mut maxx = corners[0].0;
    let mut miny = corners[0].1;
    let mut maxy = corners[0].1;
    for &(px, py) in &corners[1..] {
        minx = minx.min(px);
        maxx = maxx.max(px);
        miny = miny.min(py);
        maxy = maxy.max(py);
    }

    if maxx < minx {
        std::mem::swap(&mut maxx, &mut minx);
    }
    if maxy < miny {
        std::mem::swap(&mut maxy, &mut miny);
    }

    Bbox::new(minx / fw, miny / fh, maxx / fw, maxy / fh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Matrix3;

    #[test]
    fn test_inverse_well_conditioned() {
        let m = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        let inv = regularized_inverse(&m);
        let prod = &m * &inv;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(prod[(i, j)], expected, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_inverse_matches_nalgebra() {
        let m = DMatrix::from_row_slice(4, 4, &[
            10.0, 0.0, 1.0, 0.0, //
            0.0, 10.0, 0.0, 1.0, //
            1.0, 0.0, 11.0, 0.0, //
            0.0, 1.0, 0.0, 11.0,
        ]);
        let inv = regularized_inverse(&m);
        let reference = m.clone().try_inverse().unwrap();
        for i in 0..4 {
            for j in 0..4 {
                assert_abs_diff_eq!(inv[(i, j)], reference[(i, j)], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_inverse_singular_does_not_panic() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let inv = regularized_inverse(&m);
        assert!(inv.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_warp_identity_is_noop() {
        let b = Bbox::new(0.2, 0.3, 0.4, 0.5);
        let w = Matrix3::identity();
        let warped = warp_bbox_norm(&b, &w, 640, 480);
        assert_abs_diff_eq!(warped.xmin, b.xmin, epsilon = 1e-5);
        assert_abs_diff_eq!(warped.ymin, b.ymin, epsilon = 1e-5);
        assert_abs_diff_eq!(warped.xmax, b.xmax, epsilon = 1e-5);
        assert_abs_diff_eq!(warped.ymax, b.ymax, epsilon = 1e-5);
    }

    #[test]
    fn test_warp_translation_roundtrip() {
        let b = Bbox::new(0.4, 0.4, 0.6, 0.6);
        let mut w = Matrix3::identity();
        w[(0, 2)] = 32.0;
        w[(1, 2)] = -16.0;
        let mut winv = Matrix3::identity();
        winv[(0, 2)] = -32.0;
        winv[(1, 2)] = 16.0;

        let there = warp_bbox_norm(&b, &w, 640, 480);
        assert_abs_diff_eq!(there.center_x(), b.center_x() + 32.0 / 640.0, epsilon = 1e-5);
        let back = warp_bbox_norm(&there, &winv, 640, 480);
        assert_abs_diff_eq!(back.center_x(), b.center_x(), epsilon = 1e-5);
        assert_abs_diff_eq!(back.center_y(), b.center_y(), epsilon = 1e-5);
    }
}
