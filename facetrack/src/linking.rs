//! Offline tracklet linking
//!
//! Stitches broken trajectories after the per-frame pass: tracklets are
//! summarized to trimmed spans, candidate pairs are gated on time, space,
//! scale and appearance, and only mutual nearest neighbors are merged
//! through a union-find.

use crate::types::{FaceTrack, TrackFrame};
use octrack::bbox::Bbox;
use octrack::detection::{cosine_sim, Embedding};
use std::collections::BTreeMap;

/// Maximum center distance between span endpoints, normalized by the
/// larger box diagonal.
const MAX_CENTER_DIST: f32 = 2.0;
/// Maximum area ratio (max/min) between span endpoints.
const MAX_AREA_RATIO: f32 = 4.0;
/// Absolute similarity floor for long-gap links.
const LONG_GAP_SIM_FLOOR: f32 = 0.50;
/// Long-gap links require this many confident frames on both sides.
const LONG_GAP_MIN_HIGH_CONF: usize = 6;

/// Final pruning: minimum frames per merged track.
const MIN_TRACK_FRAMES: usize = 10;
/// Final pruning: minimum high-confidence frames per merged track.
const MIN_HIGH_CONF_FRAMES: usize = 3;
/// Final pruning: minimum fraction of high-confidence frames.
const MIN_HIGH_CONF_FRACTION: f32 = 0.15;

#[derive(Debug, Clone)]
pub struct LinkingConfig {
    pub video_fps: f32,
    pub conf_thresh: f32,
    pub reid_cos_thresh: f32,
}

/// Summary of one tracklet's trimmed span.
#[derive(Debug, Clone)]
pub struct TrackletSummary {
    pub id: u32,
    pub start_frame: usize,
    pub end_frame: usize,
    pub start_bbox: Bbox,
    pub end_bbox: Bbox,
    pub frame_count: usize,
    /// Frames with confidence >= conf_thresh.
    pub high_conf_frames: usize,
}

/// Union-find over track ids; the smaller id becomes the representative
/// for stable output.
#[derive(Debug, Default)]
pub struct UnionFind {
    parent: BTreeMap<u32, u32>,
}

impl UnionFind {
    pub fn find(&mut self, x: u32) -> u32 {
        let p = *self.parent.entry(x).or_insert(x);
        if p == x {
            return x;
        }
        let root = self.find(p);
        self.parent.insert(x, root);
        root
    }

    pub fn unite(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        if ra < rb {
            self.parent.insert(rb, ra);
        } else {
            self.parent.insert(ra, rb);
        }
    }
}

fn bbox_of(frame: &TrackFrame) -> Bbox {
    Bbox::new(frame.bbox[0], frame.bbox[1], frame.bbox[2], frame.bbox[3])
}

fn center_dist_norm_max_diag(a: &Bbox, b: &Bbox) -> f32 {
    let dx = a.center_x() - b.center_x();
    let dy = a.center_y() - b.center_y();
    // Normalize by the larger diagonal to avoid over-penalizing when one
    // box temporarily shrinks under partial occlusion or detector jitter.
    let diag = a.diagonal().max(b.diagonal()) + 1e-6;
    (dx * dx + dy * dy).sqrt() / diag
}

/// Summarize tracklets, trimming low-confidence prediction tails so spans
/// reflect when the face was actually present.
pub fn summarize_tracklets(
    track_data: &BTreeMap<u32, Vec<TrackFrame>>,
    conf_thresh: f32,
) -> Vec<TrackletSummary> {
    let span_conf = (conf_thresh * 0.60).max(0.20);
    let mut summaries = Vec::with_capacity(track_data.len());

    for (&id, frames) in track_data {
        if frames.is_empty() {
            continue;
        }

        let mut first = frames.iter().position(|f| f.confidence >= span_conf);
        let mut last = frames.iter().rposition(|f| f.confidence >= span_conf);
        if first.is_none() || last.is_none() || last < first {
            // Every frame is below the floor: fall back to raw endpoints.
            first = Some(0);
            last = Some(frames.len() - 1);
        }
        let first = first.unwrap();
        let last = last.unwrap();

        summaries.push(TrackletSummary {
            id,
            start_frame: frames[first].frame_index,
            end_frame: frames[last].frame_index,
            start_bbox: bbox_of(&frames[first]),
            end_bbox: bbox_of(&frames[last]),
            frame_count: frames.len(),
            high_conf_frames: frames.iter().filter(|f| f.confidence >= conf_thresh).count(),
        });
    }

    summaries
}

/// Link tracklets across gaps via mutual-nearest-neighbor appearance
/// matching. Returns the union-find describing the merged groups.
pub fn link_tracklets(
    tracklets: &[TrackletSummary],
    appearances: &BTreeMap<u32, Embedding>,
    cfg: &LinkingConfig,
) -> UnionFind {
    let mut uf = UnionFind::default();
    for s in tracklets {
        uf.find(s.id);
    }

    if appearances.is_empty() || tracklets.len() < 2 {
        return uf;
    }

    let max_gap_short = ((cfg.video_fps * 2.0).round() as i64).max(1);
    let max_gap_long = ((cfg.video_fps * 10.0).round() as i64).max(max_gap_short);

    let n = tracklets.len();
    let mut best_to: Vec<Option<usize>> = vec![None; n];
    let mut best_to_sim = vec![-1.0f32; n];
    let mut best_to_dist = vec![f32::MAX; n];
    let mut best_from: Vec<Option<usize>> = vec![None; n];
    let mut best_from_sim = vec![-1.0f32; n];
    let mut best_from_dist = vec![f32::MAX; n];

    for i in 0..n {
        let a = &tracklets[i];
        let Some(app_a) = appearances.get(&a.id) else {
            continue;
        };

        for j in 0..n {
            if i == j {
                continue;
            }
            let b = &tracklets[j];
            if b.start_frame <= a.end_frame {
                continue;
            }

            let gap = b.start_frame as i64 - a.end_frame as i64;
            if gap <= 0 || gap > max_gap_long {
                continue;
            }

            let Some(app_b) = appearances.get(&b.id) else {
                continue;
            };

            let dist = center_dist_norm_max_diag(&a.end_bbox, &b.start_bbox);
            if dist > MAX_CENTER_DIST {
                continue;
            }

            let area_a = a.end_bbox.area().max(1e-6);
            let area_b = b.start_bbox.area().max(1e-6);
            let mut ratio = area_b / area_a;
            if ratio < 1.0 {
                ratio = 1.0 / ratio.max(1e-6);
            }
            if ratio > MAX_AREA_RATIO {
                continue;
            }

            let sim = cosine_sim(app_a, app_b);
            let long_gap = gap > max_gap_short;
            let sim_thresh = if long_gap {
                // Long gaps are much riskier: require enough confident
                // frames on both sides and a moderate absolute floor.
                if a.high_conf_frames < LONG_GAP_MIN_HIGH_CONF
                    || b.high_conf_frames < LONG_GAP_MIN_HIGH_CONF
                {
                    continue;
                }
                cfg.reid_cos_thresh.max(LONG_GAP_SIM_FLOOR)
            } else {
                cfg.reid_cos_thresh
            };
            if sim < sim_thresh {
                continue;
            }

            // Best successor for A: maximize sim, break ties by distance.
            if sim > best_to_sim[i] || (sim == best_to_sim[i] && dist < best_to_dist[i]) {
                best_to[i] = Some(j);
                best_to_sim[i] = sim;
                best_to_dist[i] = dist;
            }
            // Best predecessor for B.
            if sim > best_from_sim[j] || (sim == best_from_sim[j] && dist < best_from_dist[j]) {
                best_from[j] = Some(i);
                best_from_sim[j] = sim;
                best_from_dist[j] = dist;
            }
        }
    }

    let mut links_made = 0u32;
    let mut sim_min = f32::MAX;
    let mut sim_max = f32::MIN;
    for i in 0..n {
        let Some(j) = best_to[i] else { continue };
        if best_from[j] != Some(i) {
            continue; // mutual nearest neighbor only
        }
        let id_a = tracklets[i].id;
        let id_b = tracklets[j].id;
        if uf.find(id_a) == uf.find(id_b) {
            continue;
        }
        uf.unite(id_a, id_b);
        links_made += 1;
        sim_min = sim_min.min(best_to_sim[i]);
        sim_max = sim_max.max(best_to_sim[i]);
    }

    if links_made > 0 {
        log::info!(
            "tracklet linking: {links_made} link(s), sim range [{sim_min:.3}, {sim_max:.3}]"
        );
    } else {
        log::debug!("tracklet linking: no links made");
    }

    uf
}

/// Collapse merged groups into single tracks, deduplicate per frame and
/// drop tracks that are too short or mostly low-confidence.
pub fn merge_and_prune(
    track_data: BTreeMap<u32, Vec<TrackFrame>>,
    uf: &mut UnionFind,
    conf_thresh: f32,
) -> Vec<FaceTrack> {
    let mut merged: BTreeMap<u32, Vec<TrackFrame>> = BTreeMap::new();
    for (id, frames) in track_data {
        let root = uf.find(id);
        merged.entry(root).or_default().extend(frames);
    }

    let mut tracks = Vec::with_capacity(merged.len());
    for (id, mut frames) in merged {
        frames.sort_by_key(|f| f.frame_index);

        // Per-frame dedup within merged tracks: keep the higher-confidence
        // record on frame-index ties.
        let mut dedup: Vec<TrackFrame> = Vec::with_capacity(frames.len());
        for f in frames {
            match dedup.last_mut() {
                Some(last) if last.frame_index == f.frame_index => {
                    if f.confidence > last.confidence {
                        *last = f;
                    }
                }
                _ => dedup.push(f),
            }
        }

        if dedup.len() < MIN_TRACK_FRAMES {
            continue;
        }
        let high_conf = dedup.iter().filter(|f| f.confidence >= conf_thresh).count();
        let frac = high_conf as f32 / dedup.len() as f32;
        if high_conf < MIN_HIGH_CONF_FRAMES || frac < MIN_HIGH_CONF_FRACTION {
            continue;
        }

        tracks.push(FaceTrack { id, frames: dedup });
    }

    // BTreeMap iteration already yields ascending ids.
    tracks
}

#[cfg(test)]
mod tests {
    use super::*;
    use octrack::detection::REID_DIM;

    fn frame(frame_index: usize, cx: f32, confidence: f32) -> TrackFrame {
        TrackFrame {
            frame_index,
            bbox: [cx - 0.15, 0.35, cx + 0.15, 0.65],
            confidence,
        }
    }

    fn embedding(seed: usize) -> Embedding {
        let mut e = [0.0f32; REID_DIM];
        e[seed % REID_DIM] = 1.0;
        e
    }

    fn cfg() -> LinkingConfig {
        LinkingConfig {
            video_fps: 30.0,
            conf_thresh: 0.5,
            reid_cos_thresh: 0.35,
        }
    }

    #[test]
    fn test_union_find_smaller_id_wins() {
        let mut uf = UnionFind::default();
        uf.unite(5, 2);
        uf.unite(2, 9);
        assert_eq!(uf.find(5), 2);
        assert_eq!(uf.find(9), 2);
        assert_eq!(uf.find(7), 7);
    }

    #[test]
    fn test_summary_trims_low_confidence_tails() {
        let mut data = BTreeMap::new();
        data.insert(
            0,
            vec![
                frame(0, 0.5, 0.1),
                frame(1, 0.5, 0.9),
                frame(2, 0.5, 0.9),
                frame(3, 0.5, 0.1),
            ],
        );
        let summaries = summarize_tracklets(&data, 0.5);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].start_frame, 1);
        assert_eq!(summaries[0].end_frame, 2);
        assert_eq!(summaries[0].frame_count, 4);
        assert_eq!(summaries[0].high_conf_frames, 2);
    }

    #[test]
    fn test_summary_falls_back_to_raw_endpoints() {
        let mut data = BTreeMap::new();
        data.insert(0, vec![frame(4, 0.5, 0.05), frame(5, 0.5, 0.05)]);
        let summaries = summarize_tracklets(&data, 0.5);
        assert_eq!(summaries[0].start_frame, 4);
        assert_eq!(summaries[0].end_frame, 5);
    }

    #[test]
    fn test_mutual_nn_links_matching_appearance() {
        let mut data = BTreeMap::new();
        data.insert(0, (0..10).map(|i| frame(i, 0.4, 0.9)).collect::<Vec<_>>());
        data.insert(1, (14..24).map(|i| frame(i, 0.5, 0.9)).collect::<Vec<_>>());
        // Distant in appearance, nearby in time: must not link.
        data.insert(2, (30..40).map(|i| frame(i, 0.5, 0.9)).collect::<Vec<_>>());

        let mut appearances = BTreeMap::new();
        appearances.insert(0, embedding(0));
        appearances.insert(1, embedding(0));
        appearances.insert(2, embedding(7));

        let summaries = summarize_tracklets(&data, 0.5);
        let mut uf = link_tracklets(&summaries, &appearances, &cfg());

        assert_eq!(uf.find(1), 0);
        assert_eq!(uf.find(2), 2);
    }

    #[test]
    fn test_long_gap_requires_confident_tracklets() {
        // Gap of 90 frames at 30fps: beyond the short window (60), inside
        // the long one (300).
        let mut data = BTreeMap::new();
        data.insert(0, (0..4).map(|i| frame(i, 0.5, 0.9)).collect::<Vec<_>>());
        data.insert(1, (94..98).map(|i| frame(i, 0.5, 0.9)).collect::<Vec<_>>());

        let mut appearances = BTreeMap::new();
        appearances.insert(0, embedding(0));
        appearances.insert(1, embedding(0));

        let summaries = summarize_tracklets(&data, 0.5);
        let mut uf = link_tracklets(&summaries, &appearances, &cfg());
        // Only 4 confident frames on each side: below the long-gap floor.
        assert_eq!(uf.find(1), 1);

        // With enough confident frames the same pair links.
        let mut data = BTreeMap::new();
        data.insert(0, (0..8).map(|i| frame(i, 0.5, 0.9)).collect::<Vec<_>>());
        data.insert(1, (98..106).map(|i| frame(i, 0.5, 0.9)).collect::<Vec<_>>());
        let summaries = summarize_tracklets(&data, 0.5);
        let mut uf = link_tracklets(&summaries, &appearances, &cfg());
        assert_eq!(uf.find(1), 0);
    }

    #[test]
    fn test_spatial_gate_blocks_teleport() {
        let mut data = BTreeMap::new();
        // Tiny boxes far apart: center distance over 2 diagonals.
        data.insert(
            0,
            (0..10)
                .map(|i| TrackFrame {
                    frame_index: i,
                    bbox: [0.10, 0.10, 0.14, 0.14],
                    confidence: 0.9,
                })
                .collect::<Vec<_>>(),
        );
        data.insert(
            1,
            (14..24)
                .map(|i| TrackFrame {
                    frame_index: i,
                    bbox: [0.80, 0.80, 0.84, 0.84],
                    confidence: 0.9,
                })
                .collect::<Vec<_>>(),
        );

        let mut appearances = BTreeMap::new();
        appearances.insert(0, embedding(0));
        appearances.insert(1, embedding(0));

        let summaries = summarize_tracklets(&data, 0.5);
        let mut uf = link_tracklets(&summaries, &appearances, &cfg());
        assert_eq!(uf.find(1), 1);
    }

    #[test]
    fn test_merge_dedups_and_prunes() {
        let mut uf = UnionFind::default();
        uf.unite(0, 1);

        let mut data = BTreeMap::new();
        data.insert(0, (0..10).map(|i| frame(i, 0.4, 0.9)).collect::<Vec<_>>());
        let mut overlapping: Vec<TrackFrame> = (9..16).map(|i| frame(i, 0.5, 0.3)).collect();
        overlapping[0].confidence = 0.95; // wins the tie at frame 9
        data.insert(1, overlapping);
        // Too short and low-confidence: pruned.
        data.insert(2, (0..5).map(|i| frame(i, 0.8, 0.2)).collect::<Vec<_>>());

        let tracks = merge_and_prune(data, &mut uf, 0.5);
        assert_eq!(tracks.len(), 1);
        let track = &tracks[0];
        assert_eq!(track.id, 0);
        assert_eq!(track.frames.len(), 16);
        let f9 = track.frames.iter().find(|f| f.frame_index == 9).unwrap();
        assert!((f9.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_prune_requires_high_conf_count_and_fraction() {
        let mut uf = UnionFind::default();
        let mut data = BTreeMap::new();
        // 20 frames, only 2 confident: dropped (< 3 high-conf frames).
        let mut frames: Vec<TrackFrame> = (0..20).map(|i| frame(i, 0.5, 0.1)).collect();
        frames[0].confidence = 0.9;
        frames[1].confidence = 0.9;
        data.insert(0, frames);

        let tracks = merge_and_prune(data, &mut uf, 0.5);
        assert!(tracks.is_empty());
    }
}
