//! Face detection and tracking pipeline
//!
//! Combines sparse face detection with OC-SORT tracking:
//! - detection at a configurable rate, always including the last frame
//! - per-frame camera-motion compensation between consecutive frames
//! - Kalman prediction interpolating between detection frames
//! - offline tracklet linking over appearance prototypes
//!
//! Output tracks use normalized bounding boxes.

use crate::detector::FaceDetector;
use crate::embedding::EmbeddingExtractor;
use crate::error::Result;
use crate::linking::{link_tracklets, merge_and_prune, summarize_tracklets, LinkingConfig, UnionFind};
use crate::types::{ImageData, PipelineConfig, TrackFrame, TrackingReport};
use octrack::bbox::{calculate_iou, Bbox};
use octrack::{
    Detection, GmcConfig, MotionEstimator, OcSortConfig, OcSortTracker, TranslationGmc,
};
use std::collections::BTreeMap;
use std::path::Path;

/// IoU threshold for the per-frame duplicate-detection NMS pass. The
/// detector can produce multiple highly-overlapping boxes on the same face
/// near profile views; suppressing them here avoids duplicate track births.
const DEDUP_NMS_IOU: f32 = 0.30;

/// Tracks can coast for this many frames before aging out (3s at 30fps).
const TRACKER_MAX_AGE: u32 = 90;

/// Predictions below this confidence are not recorded; they would linger
/// as ghost boxes on long gaps.
const MIN_OUTPUT_CONFIDENCE: f32 = 0.05;

pub struct FacePipeline {
    detector: Box<dyn FaceDetector>,
    extractor: Option<EmbeddingExtractor>,
    gmc: Box<dyn MotionEstimator>,
    cfg: PipelineConfig,
}

impl FacePipeline {
    pub fn new(detector: Box<dyn FaceDetector>, cfg: PipelineConfig) -> Self {
        Self {
            detector,
            extractor: None,
            gmc: Box::new(TranslationGmc::new(GmcConfig::default())),
            cfg,
        }
    }

    /// Enable appearance extraction and appearance-aware association.
    pub fn with_embedder(mut self, extractor: EmbeddingExtractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Replace the motion-compensation backend.
    pub fn with_motion_estimator(mut self, gmc: Box<dyn MotionEstimator>) -> Self {
        self.gmc = gmc;
        self
    }

    pub fn use_reid(&self) -> bool {
        self.extractor.is_some()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Detect faces in a single frame as normalized tracker detections,
    /// with optional appearance embeddings and duplicate suppression.
    pub fn detect_single(&mut self, image: &ImageData) -> Result<Vec<Detection>> {
        image.ensure_valid()?;
        let faces = self.detector.detect(image)?;

        let fw = image.width as f32;
        let fh = image.height as f32;
        let mut detections = Vec::with_capacity(faces.len());
        for face in &faces {
            let bbox = Bbox::new(
                face.bbox[0] / fw,
                face.bbox[1] / fh,
                face.bbox[2] / fw,
                face.bbox[3] / fh,
            );
            let mut det = Detection::new(bbox, face.score);
            if let Some(extractor) = &mut self.extractor {
                // Appearance may still be used for association when quality
                // is low; bank updates are gated inside the tracker.
                det.reid = extractor.extract(image, &face.bbox, face.landmarks.as_ref());
            }
            detections.push(det);
        }

        Ok(nms_detections(detections, DEDUP_NMS_IOU))
    }

    /// Process frames already decoded in memory.
    pub fn process_frames(&mut self, frames: &[ImageData], video_fps: f32) -> Result<TrackingReport> {
        let mut load = |i: usize| frames.get(i).cloned();
        self.process_with(frames.len(), &mut load, video_fps)
    }

    /// Process a list of frame image files.
    pub fn process_paths<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
        video_fps: f32,
    ) -> Result<TrackingReport> {
        let mut load = |i: usize| match ImageData::from_file(paths[i].as_ref()) {
            Ok(img) => Some(img),
            Err(e) => {
                log::warn!("failed to load frame {}: {e}", paths[i].as_ref().display());
                None
            }
        };
        self.process_with(paths.len(), &mut load, video_fps)
    }

    fn process_with(
        &mut self,
        frame_count: usize,
        load: &mut dyn FnMut(usize) -> Option<ImageData>,
        video_fps: f32,
    ) -> Result<TrackingReport> {
        if frame_count == 0 {
            return Ok(TrackingReport {
                tracks: Vec::new(),
                frame_count: 0,
            });
        }

        let stride = ((video_fps / self.cfg.detection_fps).round() as usize).max(1);
        log::info!(
            "processing {frame_count} frames, detection stride {stride} ({}fps video, {}fps detection)",
            video_fps,
            self.cfg.detection_fps
        );

        // Phase 1: sparse detection on sampled frames, plus the last frame.
        let mut detections: BTreeMap<usize, Vec<Detection>> = BTreeMap::new();
        let mut reid_attempted = 0usize;
        let mut reid_kept = 0usize;
        for i in (0..frame_count).step_by(stride).chain([frame_count - 1]) {
            if detections.contains_key(&i) {
                continue;
            }
            let Some(image) = load(i) else { continue };
            let faces = match self.detect_single(&image) {
                Ok(faces) => faces,
                Err(e) => {
                    log::warn!("detection failed on frame {i}: {e}");
                    continue;
                }
            };
            if self.use_reid() {
                reid_attempted += faces.len();
                reid_kept += faces.iter().filter(|d| d.reid.is_some()).count();
            }
            if !faces.is_empty() {
                detections.insert(i, faces);
            }
        }
        if self.use_reid() && reid_attempted > 0 {
            log::debug!(
                "reid: {}/{} detections kept an embedding",
                reid_kept,
                reid_attempted
            );
        }

        // Phase 2: track across all frames with camera-motion compensation.
        let mut tracker = OcSortTracker::new(OcSortConfig {
            iou_thresh: self.cfg.iou_thresh,
            max_age: TRACKER_MAX_AGE,
            // Single detections may start tracks; pruning happens offline.
            min_hits: 1,
            use_reid: self.use_reid(),
            reid_weight: self.cfg.reid_weight,
            reid_cos_thresh: self.cfg.reid_cos_thresh,
            ..OcSortConfig::default()
        });

        let mut track_data: BTreeMap<u32, Vec<TrackFrame>> = BTreeMap::new();
        let mut prev_frame: Option<ImageData> = None;
        let mut gmc_attempts = 0usize;
        let mut gmc_ok = 0usize;
        let empty: Vec<Detection> = Vec::new();

        for i in 0..frame_count {
            let cur_frame = load(i);

            let mut warp = None;
            if i > 0 {
                if let (Some(prev), Some(cur)) = (&prev_frame, &cur_frame) {
                    gmc_attempts += 1;
                    warp = self.gmc.estimate(&cur.view(), &prev.view());
                    if warp.is_some() {
                        gmc_ok += 1;
                    }
                }
            }

            // Only detection frames carry boxes; elsewhere the tracker
            // predicts through.
            let frame_dets = detections.get(&i).unwrap_or(&empty);
            let (frame_w, frame_h) = cur_frame
                .as_ref()
                .map(|c| (c.width, c.height))
                .unwrap_or((0, 0));

            let active = tracker.update(frame_dets, true, warp.as_ref(), frame_w, frame_h);
            prev_frame = cur_frame;

            for (track_id, out) in active {
                let bbox = Bbox::new(
                    out.bbox.xmin.clamp(0.0, 1.0),
                    out.bbox.ymin.clamp(0.0, 1.0),
                    out.bbox.xmax.clamp(0.0, 1.0),
                    out.bbox.ymax.clamp(0.0, 1.0),
                );
                if bbox.width() < 0.01 || bbox.height() < 0.01 {
                    continue;
                }
                if out.confidence < MIN_OUTPUT_CONFIDENCE {
                    continue;
                }
                track_data.entry(track_id).or_default().push(TrackFrame {
                    frame_index: i,
                    bbox: bbox.to_bounds(),
                    confidence: out.confidence,
                });
            }
        }

        log::debug!("gmc: {gmc_ok}/{gmc_attempts} warps estimated");

        // Phase 3: offline tracklet linking and final pruning.
        let mut uf = if self.use_reid() {
            let mut appearances = tracker.take_finished_appearances();
            appearances.extend(tracker.active_appearances());
            let summaries = summarize_tracklets(&track_data, self.cfg.conf_thresh);
            link_tracklets(
                &summaries,
                &appearances,
                &LinkingConfig {
                    video_fps,
                    conf_thresh: self.cfg.conf_thresh,
                    reid_cos_thresh: self.cfg.reid_cos_thresh,
                },
            )
        } else {
            UnionFind::default()
        };

        let tracks = merge_and_prune(track_data, &mut uf, self.cfg.conf_thresh);

        Ok(TrackingReport {
            tracks,
            frame_count,
        })
    }
}

/// Greedy score-descending NMS over normalized detections.
fn nms_detections(mut dets: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    if dets.len() <= 1 {
        return dets;
    }
    dets.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Detection> = Vec::with_capacity(dets.len());
    for det in dets {
        let suppressed = kept
            .iter()
            .any(|k| calculate_iou(&det.bbox, &k.bbox) > iou_thresh);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}
