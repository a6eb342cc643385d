//! Global motion compensation: camera-warp estimation between frames

use log::debug;
use nalgebra::Matrix3;

/// Motion model requested from a GMC backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionModel {
    Similarity,
    Homography,
}

#[derive(Debug, Clone)]
pub struct GmcConfig {
    /// Downscale factor applied before estimation (>= 1).
    pub downscale: u32,
    pub model: MotionModel,
}

impl Default for GmcConfig {
    fn default() -> Self {
        Self {
            downscale: 4,
            model: MotionModel::Similarity,
        }
    }
}

/// Borrowed view of an interleaved RGB frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub rgb: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> FrameView<'a> {
    pub fn new(rgb: &'a [u8], width: u32, height: u32) -> Self {
        Self { rgb, width, height }
    }

    fn valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.rgb.len() >= (self.width as usize) * (self.height as usize) * 3
    }
}

/// Estimates a 3x3 warp mapping previous-frame pixels to current-frame
/// pixels. `None` means estimation failed; the caller continues with the
/// identity warp.
pub trait MotionEstimator: Send {
    fn estimate(&self, curr: &FrameView<'_>, prev: &FrameView<'_>) -> Option<Matrix3<f32>>;
}

/// Dependency-free translation-only estimator.
///
/// Brute-force SAD search over a sparse sample grid on downsampled luma.
/// Accepts a candidate shift only when it beats the identity shift by more
/// than 1% of the baseline SAD.
pub struct TranslationGmc {
    cfg: GmcConfig,
}

/// Search range in downsampled pixels. At downscale 4 this covers +/-32
/// full-resolution pixels.
const MAX_SHIFT_DS: i32 = 8;
/// Sampling stride on the downsampled grid.
const STEP_DS: i32 = 12;
/// Boundary margin on the downsampled grid.
const MARGIN_DS: i32 = 8;
/// Minimum downsampled frame side for a meaningful estimate.
const MIN_DS_SIDE: i32 = 32;

impl TranslationGmc {
    pub fn new(cfg: GmcConfig) -> Self {
        Self { cfg }
    }

    fn estimate_translation(&self, curr: &FrameView<'_>, prev: &FrameView<'_>) -> Option<(i32, i32)> {
        let w = curr.width as i32;
        let h = curr.height as i32;
        let down = self.cfg.downscale.max(1) as i32;

        let ds_w = (w / down).max(1);
        let ds_h = (h / down).max(1);
        if ds_w < MIN_DS_SIDE || ds_h < MIN_DS_SIDE {
            return None;
        }

        let x0 = MARGIN_DS;
        let x1 = ds_w - MARGIN_DS;
        let y0 = MARGIN_DS;
        let y1 = ds_h - MARGIN_DS;

        let sad_for = |dx_ds: i32, dy_ds: i32, best_so_far: u64| -> u64 {
            let mut sad = 0u64;
            let mut y = y0;
            while y < y1 {
                let y2 = y + dy_ds;
                if y2 < y0 || y2 >= y1 {
                    y += STEP_DS;
                    continue;
                }
                let py = y * down;
                let cy = y2 * down;
                let mut x = x0;
                while x < x1 {
                    let x2 = x + dx_ds;
                    if x2 < x0 || x2 >= x1 {
                        x += STEP_DS;
                        continue;
                    }
                    let px = x * down;
                    let cx = x2 * down;
                    let p = luma_u8(prev.rgb, ((py * w + px) * 3) as usize);
                    let c = luma_u8(curr.rgb, ((cy * w + cx) * 3) as usize);
                    sad += u64::from(p.abs_diff(c));
                    if sad >= best_so_far {
                        return sad;
                    }
                    x += STEP_DS;
                }
                y += STEP_DS;
            }
            sad
        };

        // Baseline (no shift).
        let sad0 = sad_for(0, 0, u64::MAX);
        if sad0 == 0 {
            return None;
        }

        let mut best = sad0;
        let mut best_dx = 0;
        let mut best_dy = 0;

        for dy in -MAX_SHIFT_DS..=MAX_SHIFT_DS {
            for dx in -MAX_SHIFT_DS..=MAX_SHIFT_DS {
                // Favor smaller motion slightly to reduce jitter in
                // ambiguous cases.
                let penalty = ((dx * dx + dy * dy) * 4) as u64;
                let sad = sad_for(dx, dy, best) + penalty;
                if sad < best {
                    best = sad;
                    best_dx = dx;
                    best_dy = dy;
                }
            }
        }

        let improvement = (sad0 - best) as f64 / sad0 as f64;
        if improvement <= 0.01 {
            return None;
        }

        Some((best_dx * down, best_dy * down))
    }
}

impl MotionEstimator for TranslationGmc {
    fn estimate(&self, curr: &FrameView<'_>, prev: &FrameView<'_>) -> Option<Matrix3<f32>> {
        if !curr.valid() || !prev.valid() {
            return None;
        }
        if curr.width != prev.width || curr.height != prev.height {
            debug!(
                "gmc: frame size mismatch {}x{} vs {}x{}",
                curr.width, curr.height, prev.width, prev.height
            );
            return None;
        }

        let (dx_px, dy_px) = self.estimate_translation(curr, prev)?;

        let mut warp = Matrix3::identity();
        warp[(0, 2)] = dx_px as f32;
        warp[(1, 2)] = dy_px as f32;
        Some(warp)
    }
}

#[inline]
fn luma_u8(rgb: &[u8], idx: usize) -> u8 {
    // Integer approx of BT.601: 0.299 R + 0.587 G + 0.114 B
    let r = rgb[idx] as u32;
    let g = rgb[idx + 1] as u32;
    let b = rgb[idx + 2] as u32;
    ((77 * r + 150 * g + 29 * b + 128) >> 8) as u8
}
