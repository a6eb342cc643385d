//! Individual bounding box tracker: Kalman filter with observation-centric
//! re-update, appearance bank and camera-motion transport

use crate::bbox::{
    measurement_to_xywh, speed_direction, xywh_to_measurement, Bbox, Measurement,
};
use crate::detection::{cosine_sim, l2_normalize, Detection, Embedding, REID_DIM};
use crate::kalman::{KalmanFilter, KalmanFilterParams};
use crate::linalg::warp_bbox_norm;
use nalgebra::{DMatrix, DVector, Matrix3};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::collections::BTreeMap;

/// Appearance samples below this quality never enter the bank.
const MIN_REID_UPDATE_QUALITY: f32 = 0.40;
/// Bank capacity: only the best few samples are kept to avoid drift from
/// bad crops.
const APPEARANCE_BANK_K: usize = 5;

/// Bounded multiset of best-quality appearance samples, summarized into a
/// single L2-normalized prototype.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppearanceBank {
    #[serde_as(as = "Vec<([_; REID_DIM], _)>")]
    samples: Vec<(Embedding, f32)>,
    #[serde_as(as = "Option<[_; REID_DIM]>")]
    prototype: Option<Embedding>,
}

impl AppearanceBank {
    /// Insert a sample: fill an empty slot, or replace the worst-quality
    /// slot when the new quality exceeds it. Recomputes the prototype as
    /// the quality-weighted mean of the bank.
    pub fn insert(&mut self, feature: &Embedding, quality: f32) {
        let q = quality.max(0.0);
        let mut sample = *feature;
        l2_normalize(&mut sample);

        if self.samples.len() < APPEARANCE_BANK_K {
            self.samples.push((sample, q));
        } else {
            let (worst, worst_q) = self
                .samples
                .iter()
                .enumerate()
                .map(|(i, (_, sq))| (i, *sq))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .unwrap();
            if q > worst_q {
                self.samples[worst] = (sample, q);
            } else {
                return;
            }
        }

        self.recompute_prototype();
    }

    fn recompute_prototype(&mut self) {
        if self.samples.is_empty() {
            self.prototype = None;
            return;
        }

        let mut proto = [0.0f32; crate::detection::REID_DIM];
        let mut weight_sum = 0.0f64;
        for (feature, q) in &self.samples {
            let w = f64::from(q.max(0.0));
            weight_sum += w;
            for (p, f) in proto.iter_mut().zip(feature.iter()) {
                *p += (w * f64::from(*f)) as f32;
            }
        }
        if weight_sum <= 1e-9 {
            proto = self.samples[0].0;
        }
        l2_normalize(&mut proto);
        self.prototype = Some(proto);
    }

    pub fn prototype(&self) -> Option<&Embedding> {
        self.prototype.as_ref()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Cosine similarity between the prototype and a detection embedding.
    pub fn similarity(&self, feature: &Embedding) -> Option<f32> {
        self.prototype.as_ref().map(|p| cosine_sim(p, feature))
    }
}

/// Rollback point for the observation-centric re-update.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedState {
    x: DVector<f32>,
    p: DMatrix<f32>,
    age: u32,
}

/// Kalman filter-based single object tracker with OC-SORT observation
/// state.
///
/// 7-state constant velocity model:
///   state: [x, y, s, r, vx, vy, vs]
///   where (x, y) = bbox center, s = area (scale), r = aspect ratio
/// Measurement: [x, y, s, r]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanBoxTracker {
    /// track id
    pub id: u32,
    /// number of steps predicted without receiving an observation
    pub time_since_update: u32,
    /// number of steps with a matching detection
    pub hits: u32,
    /// number of consecutive steps with a matching detection
    pub hit_streak: u32,
    /// number of steps the tracker has been run for (each predict() is one)
    pub age: u32,
    delta_t: u32,

    kf: KalmanFilter,

    // OC-SORT observation state
    last_observation: Detection,
    observations_by_age: BTreeMap<u32, Detection>,
    velocity_dir: Option<[f32; 2]>,

    bank: AppearanceBank,

    // ORU: per-frame measurement history since creation, gap flag and the
    // rollback snapshot taken at the last observed frame.
    oru_history: Vec<Option<Measurement>>,
    observed_at_last_step: bool,
    saved_state: SavedState,
}

impl KalmanBoxTracker {
    /// Create a new tracker from its birth detection.
    pub fn new(det: Detection, id: u32, delta_t: u32) -> Self {
        let z = det.bbox.to_z();

        // State transition matrix F (constant velocity model):
        // x' = x + vx, y' = y + vy, s' = s + vs, r' = r
        let mut f = DMatrix::<f32>::identity(7, 7);
        f[(0, 4)] = 1.0;
        f[(1, 5)] = 1.0;
        f[(2, 6)] = 1.0;

        // Measurement matrix H (observe x, y, s, r)
        let mut h = DMatrix::<f32>::zeros(4, 7);
        for i in 0..4 {
            h[(i, i)] = 1.0;
        }

        let kf = KalmanFilter::new(KalmanFilterParams {
            dim_x: 7,
            dim_z: 4,
            x: DVector::from_vec(vec![z[0], z[1], z[2], z[3], 0.0, 0.0, 0.0]),
            // SORT / OC-SORT noise defaults. Q[6,6] matches the official
            // implementation where the last diagonal entry is scaled by
            // 0.01 twice.
            p: DMatrix::from_diagonal(&DVector::from_vec(vec![
                10.0, 10.0, 10.0, 10.0, 10000.0, 10000.0, 10000.0,
            ])),
            f,
            h,
            r: DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 1.0, 10.0, 10.0])),
            q: DMatrix::from_diagonal(&DVector::from_vec(vec![
                1.0, 1.0, 1.0, 1.0, 0.01, 0.01, 0.0001,
            ])),
        });

        let saved_state = SavedState {
            x: kf.x.clone(),
            p: kf.p.clone(),
            age: 0,
        };

        let mut bank = AppearanceBank::default();
        if let Some(reid) = &det.reid {
            if reid.quality >= MIN_REID_UPDATE_QUALITY {
                bank.insert(&reid.feature, reid.quality);
            }
        }

        let mut observations_by_age = BTreeMap::new();
        observations_by_age.insert(0, det.clone());

        Self {
            id,
            time_since_update: 0,
            hits: 1,
            hit_streak: 1,
            age: 0,
            delta_t,
            kf,
            last_observation: det,
            observations_by_age,
            velocity_dir: None,
            bank,
            oru_history: vec![Some(z)],
            observed_at_last_step: true,
            saved_state,
        }
    }

    /// Advance the state one frame and return the predicted bbox.
    pub fn predict(&mut self) -> Bbox {
        self.predict_kf();
        self.age += 1;
        if self.time_since_update > 0 {
            self.hit_streak = 0;
        }
        self.time_since_update += 1;
        self.state_bbox()
    }

    /// Update with a detection, or record a missed frame with `None`.
    ///
    /// Called once per frame after `predict()`, even when there is no
    /// matched detection: the miss record is what lets ORU reconstruct the
    /// occlusion gap on re-acquisition.
    pub fn update(&mut self, det: Option<&Detection>) {
        let Some(d) = det else {
            self.oru_history.push(None);
            self.observed_at_last_step = false;
            return;
        };

        let z = d.bbox.to_z();
        if !z.iter().all(|v| v.is_finite()) {
            log::warn!("track {}: dropping non-finite measurement", self.id);
            self.oru_history.push(None);
            self.observed_at_last_step = false;
            return;
        }

        self.oru_history.push(Some(z));

        if !self.observed_at_last_step {
            // Track was unobserved; re-activation triggers ORU.
            self.run_oru(&z);
        }

        // Inertia direction (dy, dx) using observations delta_t steps apart,
        // falling back to more recent ones when the exact age is missing.
        let dir = {
            let mut prev = &self.last_observation;
            for i in 0..self.delta_t {
                let dt = self.delta_t - i;
                if let Some(a) = self.age.checked_sub(dt) {
                    if let Some(obs) = self.observations_by_age.get(&a) {
                        prev = obs;
                        break;
                    }
                }
            }
            speed_direction(&prev.bbox, &d.bbox)
        };
        self.velocity_dir = Some(dir);

        self.time_since_update = 0;
        self.hits += 1;
        self.hit_streak += 1;

        self.last_observation = d.clone();
        self.observations_by_age.insert(self.age, d.clone());

        if let Some(reid) = &d.reid {
            if reid.quality >= MIN_REID_UPDATE_QUALITY {
                self.bank.insert(&reid.feature, reid.quality);
            }
        }

        self.kf.update(&DVector::from_column_slice(&z));

        self.saved_state = SavedState {
            x: self.kf.x.clone(),
            p: self.kf.p.clone(),
            age: self.age,
        };
        self.observed_at_last_step = true;
    }

    /// Current state as a bounding box.
    pub fn state_bbox(&self) -> Bbox {
        Bbox::from_z(&[self.kf.x[0], self.kf.x[1], self.kf.x[2], self.kf.x[3]])
    }

    /// Apply a global warp (prev -> curr, absolute pixels) to the track.
    ///
    /// Rewrites the state bbox, approximately transports the velocities
    /// through the affine part, and moves every stored observation and the
    /// ORU snapshot into the compensated coordinate system. The inertia
    /// direction becomes invalid under a warp and is cleared.
    pub fn apply_warp(&mut self, warp: &Matrix3<f32>, frame_w: u32, frame_h: u32) {
        if frame_w == 0 || frame_h == 0 {
            return;
        }

        let cur = self.state_bbox();
        let warped = warp_bbox_norm(&cur, warp, frame_w, frame_h);
        let z = warped.to_z();
        self.kf.x[0] = z[0];
        self.kf.x[1] = z[1];
        self.kf.x[2] = z[2];
        self.kf.x[3] = z[3];

        // Velocity transport uses only the affine 2x2 part.
        let fw = frame_w as f32;
        let fh = frame_h as f32;
        let vx_px = self.kf.x[4] * fw;
        let vy_px = self.kf.x[5] * fh;
        let nvx_px = warp[(0, 0)] * vx_px + warp[(0, 1)] * vy_px;
        let nvy_px = warp[(1, 0)] * vx_px + warp[(1, 1)] * vy_px;
        self.kf.x[4] = nvx_px / fw;
        self.kf.x[5] = nvy_px / fh;

        // Scale vs by the local area change of the affine part.
        let det_a = warp[(0, 0)] * warp[(1, 1)] - warp[(0, 1)] * warp[(1, 0)];
        if det_a.is_finite() && det_a > 0.0 {
            self.kf.x[6] *= det_a;
        }

        self.last_observation.bbox =
            warp_bbox_norm(&self.last_observation.bbox, warp, frame_w, frame_h);
        for obs in self.observations_by_age.values_mut() {
            obs.bbox = warp_bbox_norm(&obs.bbox, warp, frame_w, frame_h);
        }
        for m in self.oru_history.iter_mut().flatten() {
            let b = warp_bbox_norm(&Bbox::from_z(m), warp, frame_w, frame_h);
            *m = b.to_z();
        }

        // Keep the ORU rollback state in the compensated coordinate system.
        let saved = [
            self.saved_state.x[0],
            self.saved_state.x[1],
            self.saved_state.x[2],
            self.saved_state.x[3],
        ];
        let sb = warp_bbox_norm(&Bbox::from_z(&saved), warp, frame_w, frame_h);
        let zs = sb.to_z();
        self.saved_state.x[0] = zs[0];
        self.saved_state.x[1] = zs[1];
        self.saved_state.x[2] = zs[2];
        self.saved_state.x[3] = zs[3];

        self.velocity_dir = None;
    }

    /// Inertia direction as a (dy, dx) unit vector; (0, 0) if unavailable.
    pub fn velocity_dir(&self) -> [f32; 2] {
        self.velocity_dir.unwrap_or([0.0, 0.0])
    }

    /// Observation from `k` frames ago, falling back to the nearest more
    /// recent one and finally to the latest observation.
    pub fn k_previous_observation(&self, k: u32) -> Option<&Detection> {
        if self.observations_by_age.is_empty() {
            return None;
        }
        for i in 0..k {
            let dt = k - i;
            if let Some(a) = self.age.checked_sub(dt) {
                if let Some(obs) = self.observations_by_age.get(&a) {
                    return Some(obs);
                }
            }
        }
        self.observations_by_age.values().next_back()
    }

    pub fn last_observation(&self) -> &Detection {
        &self.last_observation
    }

    pub fn has_appearance(&self) -> bool {
        self.bank.prototype().is_some()
    }

    pub fn appearance(&self) -> Option<&Embedding> {
        self.bank.prototype()
    }

    /// Number of frames recorded since creation (one history entry per
    /// frame, observed or not).
    pub fn history_len(&self) -> usize {
        self.oru_history.len()
    }

    // Internal one-step prediction; does not touch counters.
    fn predict_kf(&mut self) {
        // A negative predicted scale would make the state bbox collapse;
        // zero the scale velocity first.
        if self.kf.x[6] + self.kf.x[2] <= 0.0 {
            self.kf.x[6] = 0.0;
        }
        self.kf.predict();
    }

    /// Observation-centric re-update.
    ///
    /// On re-acquisition after a gap, roll the filter back to the last
    /// observed state and replay a linearly interpolated virtual trajectory
    /// through the gap, one predict+update per missing frame. Observations
    /// are treated as ground truth; the replay removes the drift
    /// accumulated by unconstrained predictions.
    fn run_oru(&mut self, current: &Measurement) {
        let mut idx2 = None;
        let mut idx1 = None;
        for i in (0..self.oru_history.len()).rev() {
            if self.oru_history[i].is_some() {
                if idx2.is_none() {
                    idx2 = Some(i);
                } else {
                    idx1 = Some(i);
                    break;
                }
            }
        }
        let (Some(idx1), Some(idx2)) = (idx1, idx2) else {
            return;
        };

        let gap = idx2 - idx1;
        if gap < 2 {
            // No missing steps between observations.
            return;
        }

        let prev = self.oru_history[idx1].expect("idx1 holds an observation");

        self.kf.x = self.saved_state.x.clone();
        self.kf.p = self.saved_state.p.clone();

        let (x1, y1, w1, h1) = measurement_to_xywh(&prev);
        let (x2, y2, w2, h2) = measurement_to_xywh(current);

        for i in 1..gap {
            let alpha = i as f32 / gap as f32;
            let xi = x1 + alpha * (x2 - x1);
            let yi = y1 + alpha * (y2 - y1);
            let wi = w1 + alpha * (w2 - w1);
            let hi = h1 + alpha * (h2 - h1);

            self.predict_kf();
            let z = xywh_to_measurement(xi, yi, wi, hi);
            self.kf.update(&DVector::from_column_slice(&z));
        }

        // Carry the replayed state to the current frame; the caller applies
        // the real update next.
        self.predict_kf();
    }
}
