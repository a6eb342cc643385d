//! Face alignment, embedding quality scoring and extraction
//!
//! Crops are aligned to the canonical ArcFace 112x112 template via a
//! least-squares 5-point similarity transform, scored for size /
//! brightness / sharpness, gated on blur, then handed to the embedding
//! backend. The backend itself is an external collaborator behind
//! [`FaceEmbedder`].

use crate::error::Result;
use crate::types::ImageData;
use octrack::detection::{l2_normalize, Embedding, ReidSample};

/// Aligned crop side length expected by ArcFace-style embedders.
pub const ALIGNED_SIZE: usize = 112;

/// ArcFace 112x112 canonical 5-point template (eyes, nose, mouth corners).
const ARCFACE_TEMPLATE: [[f32; 2]; 5] = [
    [38.2946, 51.6963],
    [73.5318, 51.5014],
    [56.0252, 71.7366],
    [41.5493, 92.3655],
    [70.7299, 92.2041],
];

/// Common interface for face embedding backends.
pub trait FaceEmbedder: Send {
    /// Produce a 128-D embedding for an aligned 112x112 RGB crop.
    fn embed(&mut self, rgb112: &[u8]) -> Result<Embedding>;

    /// Embedder name (for logging/debugging)
    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Below this Laplacian variance the crop is too blurred to embed.
    pub blur_skip_var: f32,
    /// Below this variance the crop is sharpened before embedding and its
    /// quality scaled down.
    pub blur_sharpen_var: f32,
    /// Laplacian sharpening strength.
    pub sharpen_alpha: f32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            blur_skip_var: 12.0,
            blur_sharpen_var: 50.0,
            sharpen_alpha: 0.6,
        }
    }
}

/// Orchestrates alignment, quality gating and the embedding backend.
pub struct EmbeddingExtractor {
    embedder: Box<dyn FaceEmbedder>,
    cfg: EmbeddingConfig,
}

impl EmbeddingExtractor {
    pub fn new(embedder: Box<dyn FaceEmbedder>, cfg: EmbeddingConfig) -> Self {
        Self { embedder, cfg }
    }

    /// Extract an appearance sample for a face region.
    ///
    /// Returns `None` when the crop fails the blur gate or the backend
    /// fails; both degrade to "no appearance" downstream.
    pub fn extract(
        &mut self,
        image: &ImageData,
        bbox_abs: &[f32; 4],
        landmarks: Option<&[[f32; 2]; 5]>,
    ) -> Option<ReidSample> {
        if image.ensure_valid().is_err() {
            return None;
        }

        let bw = (bbox_abs[2] - bbox_abs[0]).max(1.0);
        let bh = (bbox_abs[3] - bbox_abs[1]).max(1.0);

        let mut quality;
        let mut crop;
        match landmarks.filter(|lms| landmarks_sane(lms, image.width, image.height)) {
            Some(lms) => match estimate_similarity(lms, &ARCFACE_TEMPLATE) {
                Some(sim) => {
                    let inv = sim.inverse();
                    crop = warp_aligned(image, &inv);
                    quality = quality_112(&crop, bw, bh, image.width, image.height);
                }
                None => {
                    crop = fallback_crop(image, bbox_abs);
                    quality = 0.75 * quality_112(&crop, bw, bh, image.width, image.height);
                }
            },
            None => {
                // No usable landmarks: expanded square crop, less trusted.
                crop = fallback_crop(image, bbox_abs);
                quality = 0.75 * quality_112(&crop, bw, bh, image.width, image.height);
            }
        }

        let blur_var = laplacian_variance(&crop);
        if blur_var < self.cfg.blur_skip_var {
            log::debug!("embedding skipped: blur variance {blur_var:.1} below floor");
            return None;
        }
        if blur_var < self.cfg.blur_sharpen_var {
            crop = laplacian_sharpen(&crop, self.cfg.sharpen_alpha);
            let denom = (self.cfg.blur_sharpen_var - self.cfg.blur_skip_var).max(1e-3);
            let blur_factor = ((blur_var - self.cfg.blur_skip_var) / denom).clamp(0.0, 1.0);
            quality *= blur_factor;
        }

        let mut feature = match self.embedder.embed(&crop) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("{} embedding failed: {e}", self.embedder.name());
                return None;
            }
        };
        l2_normalize(&mut feature);

        Some(ReidSample {
            feature,
            quality: quality.clamp(0.0, 1.0),
        })
    }
}

/// MobileFaceNet (ArcFace) embedding model handle.
///
/// Construction validates the model files; the inference backend itself is
/// an external collaborator and is not linked into this crate, so `embed`
/// fails and the extractor degrades to "no appearance".
pub struct MobileFaceNetEmbedder {
    param_path: std::path::PathBuf,
    bin_path: std::path::PathBuf,
}

impl MobileFaceNetEmbedder {
    pub fn new<P: AsRef<std::path::Path>>(model_dir: P) -> Result<Self> {
        let dir = model_dir.as_ref();
        // Prefer optimized files when present.
        let mut param_path = dir.join("mobilefacenet-opt.param");
        let mut bin_path = dir.join("mobilefacenet-opt.bin");
        if !param_path.is_file() || !bin_path.is_file() {
            param_path = dir.join("mobilefacenet.param");
            bin_path = dir.join("mobilefacenet.bin");
        }
        if !param_path.is_file() || !bin_path.is_file() {
            return Err(crate::error::PipelineError::model_load(format!(
                "missing mobilefacenet model files under {}",
                dir.display()
            )));
        }
        log::info!("MobileFaceNet model found: {}", dir.display());
        Ok(Self {
            param_path,
            bin_path,
        })
    }

    pub fn model_paths(&self) -> (&std::path::Path, &std::path::Path) {
        (&self.param_path, &self.bin_path)
    }
}

impl FaceEmbedder for MobileFaceNetEmbedder {
    fn embed(&mut self, _rgb112: &[u8]) -> Result<Embedding> {
        Err(crate::error::PipelineError::inference(
            "MobileFaceNet inference backend not linked in this build",
        ))
    }

    fn name(&self) -> &str {
        "MobileFaceNet"
    }
}

/// Similarity transform `dst = s*R*src + t`, stored as
/// `[ a -b tx; b a ty ]`.
#[derive(Debug, Clone, Copy)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn inverse(&self) -> Similarity {
        let det = self.a * self.a + self.b * self.b;
        if det <= 1e-12 {
            return Similarity {
                a: 1.0,
                b: 0.0,
                tx: 0.0,
                ty: 0.0,
            };
        }
        let p = self.a / det;
        let q = -self.b / det;
        Similarity {
            a: p,
            b: q,
            tx: -(p * self.tx - q * self.ty),
            ty: -(q * self.tx + p * self.ty),
        }
    }
}

/// Least-squares similarity transform from 5 source points to 5 target
/// points. Fails on degenerate point sets.
fn estimate_similarity(src: &[[f32; 2]; 5], dst: &[[f32; 2]; 5]) -> Option<Similarity> {
    let mut sxm = 0.0f32;
    let mut sym = 0.0f32;
    let mut dxm = 0.0f32;
    let mut dym = 0.0f32;
    for i in 0..5 {
        sxm += src[i][0];
        sym += src[i][1];
        dxm += dst[i][0];
        dym += dst[i][1];
    }
    sxm /= 5.0;
    sym /= 5.0;
    dxm /= 5.0;
    dym /= 5.0;

    let mut a = 0.0f64;
    let mut b = 0.0f64;
    let mut den = 0.0f64;
    for i in 0..5 {
        let xs = f64::from(src[i][0] - sxm);
        let ys = f64::from(src[i][1] - sym);
        let xd = f64::from(dst[i][0] - dxm);
        let yd = f64::from(dst[i][1] - dym);
        a += xd * xs + yd * ys;
        b += yd * xs - xd * ys;
        den += xs * xs + ys * ys;
    }
    if den <= 1e-8 {
        return None;
    }

    let r = (a * a + b * b).sqrt();
    if r <= 1e-12 {
        return None;
    }

    let scale = r / den;
    let c = a / r;
    let s = b / r;

    let sim = Similarity {
        a: (scale * c) as f32,
        b: (scale * s) as f32,
        tx: 0.0,
        ty: 0.0,
    };
    let sim = Similarity {
        tx: dxm - sim.a * sxm + sim.b * sym,
        ty: dym - sim.b * sxm - sim.a * sym,
        ..sim
    };

    let finite =
        sim.a.is_finite() && sim.b.is_finite() && sim.tx.is_finite() && sim.ty.is_finite();
    finite.then_some(sim)
}

fn landmarks_sane(lms: &[[f32; 2]; 5], width: u32, height: u32) -> bool {
    let max_x = (width.saturating_sub(1)) as f32;
    let max_y = (height.saturating_sub(1)) as f32;
    for p in lms {
        if !(p[0].is_finite() && p[1].is_finite()) {
            return false;
        }
        if p[0] < 0.0 || p[0] > max_x || p[1] < 0.0 || p[1] > max_y {
            return false;
        }
    }
    // Eye distance sanity: reject tiny or collapsed landmark sets.
    let ex = lms[1][0] - lms[0][0];
    let ey = lms[1][1] - lms[0][1];
    (ex * ex + ey * ey).sqrt() >= 4.0
}

fn sample_bilinear(image: &ImageData, x: f32, y: f32) -> [u8; 3] {
    let w = image.width as usize;
    let h = image.height as usize;
    let x = x.clamp(0.0, (w - 1) as f32);
    let y = y.clamp(0.0, (h - 1) as f32);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let dx = x - x0 as f32;
    let dy = y - y0 as f32;

    let idx = |xx: usize, yy: usize| (yy * w + xx) * 3;
    let mut out = [0u8; 3];
    for c in 0..3 {
        let v00 = f32::from(image.data[idx(x0, y0) + c]);
        let v10 = f32::from(image.data[idx(x1, y0) + c]);
        let v01 = f32::from(image.data[idx(x0, y1) + c]);
        let v11 = f32::from(image.data[idx(x1, y1) + c]);
        let v0 = v00 + (v10 - v00) * dx;
        let v1 = v01 + (v11 - v01) * dx;
        out[c] = (v0 + (v1 - v0) * dy).clamp(0.0, 255.0) as u8;
    }
    out
}

/// Inverse-warp a 112x112 aligned crop out of the source image.
fn warp_aligned(image: &ImageData, inv: &Similarity) -> Vec<u8> {
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE * 3];
    for v in 0..ALIGNED_SIZE {
        for u in 0..ALIGNED_SIZE {
            let (x, y) = inv.apply(u as f32, v as f32);
            let px = sample_bilinear(image, x, y);
            let idx = (v * ALIGNED_SIZE + u) * 3;
            out[idx..idx + 3].copy_from_slice(&px);
        }
    }
    out
}

/// Expanded square crop around the bbox, resampled to 112x112.
fn fallback_crop(image: &ImageData, bbox_abs: &[f32; 4]) -> Vec<u8> {
    let w = image.width as i32;
    let h = image.height as i32;
    let bw = (bbox_abs[2] - bbox_abs[0]).max(1.0);
    let bh = (bbox_abs[3] - bbox_abs[1]).max(1.0);
    let cx = (bbox_abs[0] + bbox_abs[2]) * 0.5;
    let cy = (bbox_abs[1] + bbox_abs[3]) * 0.5;
    let side = bw.max(bh) * 1.30;

    let roix = ((cx - side * 0.5).floor() as i32).clamp(0, w - 1);
    let roiy = ((cy - side * 0.5).floor() as i32).clamp(0, h - 1);
    let roiw = (side.ceil() as i32).clamp(1, w - roix);
    let roih = (side.ceil() as i32).clamp(1, h - roiy);

    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE * 3];
    let span = (ALIGNED_SIZE - 1) as f32;
    for v in 0..ALIGNED_SIZE {
        for u in 0..ALIGNED_SIZE {
            let fx = u as f32 / span;
            let fy = v as f32 / span;
            let x = roix as f32 + fx * (roiw - 1).max(1) as f32;
            let y = roiy as f32 + fy * (roih - 1).max(1) as f32;
            let px = sample_bilinear(image, x, y);
            let idx = (v * ALIGNED_SIZE + u) * 3;
            out[idx..idx + 3].copy_from_slice(&px);
        }
    }
    out
}

fn luma(px: &[u8]) -> f32 {
    // Rec. 601-ish luma
    0.299 * f32::from(px[0]) + 0.587 * f32::from(px[1]) + 0.114 * f32::from(px[2])
}

fn luma_at(rgb: &[u8], idx: usize) -> f32 {
    luma(&rgb[idx..idx + 3])
}

/// Laplacian variance over the aligned crop's luma; low values mean blur.
pub fn laplacian_variance(rgb112: &[u8]) -> f32 {
    const W: usize = ALIGNED_SIZE;
    const H: usize = ALIGNED_SIZE;
    if rgb112.len() < W * H * 3 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u32;
    for y in 1..H - 1 {
        for x in 1..W - 1 {
            let idx = (y * W + x) * 3;
            let c = luma_at(rgb112, idx);
            let n = luma_at(rgb112, idx - W * 3);
            let s = luma_at(rgb112, idx + W * 3);
            let west = luma_at(rgb112, idx - 3);
            let e = luma_at(rgb112, idx + 3);
            let lap = f64::from(4.0 * c - n - s - west - e);
            sum += lap;
            sum_sq += lap * lap;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    let mean = sum / f64::from(count);
    ((sum_sq / f64::from(count)) - mean * mean).max(0.0) as f32
}

/// Unsharp the crop with a fixed Laplacian kernel; borders pass through.
fn laplacian_sharpen(src: &[u8], alpha: f32) -> Vec<u8> {
    const W: usize = ALIGNED_SIZE;
    const H: usize = ALIGNED_SIZE;
    let mut dst = src.to_vec();
    if src.len() < W * H * 3 {
        return dst;
    }
    for y in 1..H - 1 {
        for x in 1..W - 1 {
            let idx = (y * W + x) * 3;
            let c = luma_at(src, idx);
            let n = luma_at(src, idx - W * 3);
            let s = luma_at(src, idx + W * 3);
            let west = luma_at(src, idx - 3);
            let e = luma_at(src, idx + 3);
            let lap = 4.0 * c - n - s - west - e;
            for ch in 0..3 {
                let v = f32::from(src[idx + ch]) + alpha * lap;
                dst[idx + ch] = v.clamp(0.0, 255.0) as u8;
            }
        }
    }
    dst
}

/// Lightweight quality score in [0,1] combining face size, brightness and
/// gradient energy. Size dominates; the rest stabilizes dim scenes.
fn quality_112(rgb112: &[u8], box_w: f32, box_h: f32, img_w: u32, img_h: u32) -> f32 {
    const W: usize = ALIGNED_SIZE;
    const H: usize = ALIGNED_SIZE;
    if rgb112.len() < W * H * 3 {
        return 0.0;
    }

    let min_dim = img_w.min(img_h).max(1) as f32;
    let diag_norm = (box_w * box_h).max(1.0).sqrt() / min_dim;
    let size_score = ((diag_norm - 0.03) / (0.15 - 0.03)).clamp(0.0, 1.0);

    let mut mean_l = 0.0f64;
    let mut mean_grad = 0.0f64;
    for y in 0..H {
        for x in 0..W {
            let idx = (y * W + x) * 3;
            let l = luma_at(rgb112, idx);
            mean_l += f64::from(l);

            if x + 1 < W {
                mean_grad += f64::from((luma_at(rgb112, idx + 3) - l).abs());
            }
            if y + 1 < H {
                mean_grad += f64::from((luma_at(rgb112, idx + W * 3) - l).abs());
            }
        }
    }
    mean_l /= (W * H) as f64;
    mean_grad /= ((W - 1) * H + (H - 1) * W) as f64;

    let brightness_score = ((mean_l as f32 - 40.0) / (180.0 - 40.0)).clamp(0.0, 1.0);
    let sharpness_score = ((mean_grad as f32 - 2.0) / 10.0).clamp(0.0, 1.0);

    (0.50 * size_score + 0.25 * brightness_score + 0.25 * sharpness_score).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use octrack::detection::REID_DIM;

    struct ConstEmbedder;

    impl FaceEmbedder for ConstEmbedder {
        fn embed(&mut self, _rgb112: &[u8]) -> Result<Embedding> {
            let mut e = [0.0f32; REID_DIM];
            e[0] = 2.0; // deliberately unnormalized
            Ok(e)
        }

        fn name(&self) -> &str {
            "const"
        }
    }

    fn textured_image(width: u32, height: u32) -> ImageData {
        let mut data = vec![0u8; (width * height * 3) as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let v = ((x * 31 + y * 17) % 256) as u8;
                let idx = (y * width as usize + x) * 3;
                data[idx] = v;
                data[idx + 1] = v;
                data[idx + 2] = v;
            }
        }
        ImageData::new(data, width, height)
    }

    fn flat_image(width: u32, height: u32, value: u8) -> ImageData {
        ImageData::new(vec![value; (width * height * 3) as usize], width, height)
    }

    #[test]
    fn test_similarity_recovers_translation() {
        let src = ARCFACE_TEMPLATE;
        let mut dst = ARCFACE_TEMPLATE;
        for p in &mut dst {
            p[0] += 10.0;
            p[1] -= 5.0;
        }
        let sim = estimate_similarity(&src, &dst).unwrap();
        assert_abs_diff_eq!(sim.a, 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(sim.b, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(sim.tx, 10.0, epsilon = 1e-3);
        assert_abs_diff_eq!(sim.ty, -5.0, epsilon = 1e-3);

        let (x, y) = sim.apply(src[0][0], src[0][1]);
        assert_abs_diff_eq!(x, dst[0][0], epsilon = 1e-3);
        assert_abs_diff_eq!(y, dst[0][1], epsilon = 1e-3);
    }

    #[test]
    fn test_similarity_inverse_roundtrip() {
        let mut dst = ARCFACE_TEMPLATE;
        for p in &mut dst {
            let (x, y) = (p[0], p[1]);
            p[0] = 1.2 * x - 0.3 * y + 4.0;
            p[1] = 0.3 * x + 1.2 * y - 7.0;
        }
        let sim = estimate_similarity(&ARCFACE_TEMPLATE, &dst).unwrap();
        let inv = sim.inverse();
        let (fx, fy) = sim.apply(30.0, 60.0);
        let (bx, by) = inv.apply(fx, fy);
        assert_abs_diff_eq!(bx, 30.0, epsilon = 1e-2);
        assert_abs_diff_eq!(by, 60.0, epsilon = 1e-2);
    }

    #[test]
    fn test_degenerate_landmarks_rejected() {
        let collapsed = [[50.0f32, 50.0]; 5];
        assert!(estimate_similarity(&collapsed, &ARCFACE_TEMPLATE).is_none());
        assert!(!landmarks_sane(&collapsed, 640, 480));

        let mut off_image = ARCFACE_TEMPLATE;
        off_image[0][0] = -5.0;
        assert!(!landmarks_sane(&off_image, 640, 480));
    }

    #[test]
    fn test_laplacian_variance_separates_flat_from_texture() {
        let flat = vec![128u8; ALIGNED_SIZE * ALIGNED_SIZE * 3];
        assert_abs_diff_eq!(laplacian_variance(&flat), 0.0, epsilon = 1e-3);

        let textured = textured_image(112, 112);
        assert!(laplacian_variance(&textured.data) > 50.0);
    }

    #[test]
    fn test_extract_drops_blurred_crop() {
        let image = flat_image(256, 256, 128);
        let mut extractor =
            EmbeddingExtractor::new(Box::new(ConstEmbedder), EmbeddingConfig::default());
        let sample = extractor.extract(&image, &[64.0, 64.0, 192.0, 192.0], None);
        assert!(sample.is_none());
    }

    #[test]
    fn test_extract_produces_normalized_sample() {
        let image = textured_image(256, 256);
        let mut extractor =
            EmbeddingExtractor::new(Box::new(ConstEmbedder), EmbeddingConfig::default());
        let sample = extractor
            .extract(&image, &[64.0, 64.0, 192.0, 192.0], None)
            .expect("textured crop passes the blur gate");

        let norm: f32 = sample.feature.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-5);
        assert!(sample.quality > 0.0);
        assert!(sample.quality <= 1.0);
    }
}
