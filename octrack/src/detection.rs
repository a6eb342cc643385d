//! Detection input type and appearance embedding helpers

use crate::bbox::Bbox;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// Dimensionality of appearance embeddings (MobileFaceNet/ArcFace output).
pub const REID_DIM: usize = 128;

/// An L2-normalized appearance embedding.
pub type Embedding = [f32; REID_DIM];

/// Appearance sample attached to a detection.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReidSample {
    /// L2-normalized embedding.
    #[serde_as(as = "[_; REID_DIM]")]
    pub feature: Embedding,
    /// Extraction quality in [0,1]. Low-quality samples may still be used
    /// for association; bank updates are gated inside the tracker.
    pub quality: f32,
}

/// One observation for a frame: geometry, confidence and optional appearance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: Bbox,
    pub score: f32,
    pub reid: Option<ReidSample>,
}

impl Detection {
    pub fn new(bbox: Bbox, score: f32) -> Self {
        Self {
            bbox,
            score,
            reid: None,
        }
    }

    pub fn with_reid(bbox: Bbox, score: f32, feature: Embedding, quality: f32) -> Self {
        Self {
            bbox,
            score,
            reid: Some(ReidSample { feature, quality }),
        }
    }
}

/// Normalize an embedding to unit L2 norm in place.
pub fn l2_normalize(v: &mut Embedding) {
    let ss: f64 = v.iter().map(|&x| f64::from(x) * f64::from(x)).sum();
    let inv = 1.0 / (ss.sqrt() + 1e-12);
    for x in v.iter_mut() {
        *x = (f64::from(*x) * inv) as f32;
    }
}

/// Cosine similarity between two embeddings, clamped to [-1, 1].
///
/// Both vectors are expected L2-normalized; the clamp covers numerical
/// residue only.
pub fn cosine_sim(a: &Embedding, b: &Embedding) -> f32 {
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| f64::from(x) * f64::from(y))
        .sum();
    (dot as f32).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn unit_x() -> Embedding {
        let mut e = [0.0f32; REID_DIM];
        e[0] = 1.0;
        e
    }

    #[test]
    fn test_l2_normalize() {
        let mut e = [0.0f32; REID_DIM];
        e[0] = 3.0;
        e[1] = 4.0;
        l2_normalize(&mut e);
        let norm: f32 = e.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(e[0], 0.6, epsilon = 1e-5);
        assert_abs_diff_eq!(e[1], 0.8, epsilon = 1e-5);
    }

    #[test]
    fn test_cosine_sim_clamped() {
        let e = unit_x();
        assert_abs_diff_eq!(cosine_sim(&e, &e), 1.0, epsilon = 1e-6);

        let mut neg = unit_x();
        neg[0] = -1.0;
        assert_abs_diff_eq!(cosine_sim(&e, &neg), -1.0, epsilon = 1e-6);
    }
}
