//! Observation-centric multi-object tracking
//!
//! This crate implements the tracking core of a face tracking pipeline:
//! a per-track Kalman filter with observation-centric re-update (ORU),
//! two-pass association (IoU + momentum + optional appearance), global
//! motion compensation, and the supporting geometry and assignment
//! primitives.
//!
//! ```rust,ignore
//! use octrack::{Detection, OcSortConfig, OcSortTracker};
//!
//! let mut tracker = OcSortTracker::new(OcSortConfig::default());
//! for frame_detections in detection_stream {
//!     let tracks = tracker.update(&frame_detections, false, None, 0, 0);
//!     // tracks[track_id] = TrackOutput { bbox, confidence }
//! }
//! ```

pub mod bbox;
pub mod box_tracker;
pub mod detection;
pub mod gmc;
pub mod hungarian; // Hungarian algorithm for optimal assignment
pub mod kalman;
pub mod linalg;
pub mod ocsort;
pub mod selftest;

pub use bbox::{Bbox, Measurement};
pub use box_tracker::KalmanBoxTracker;
pub use detection::{Detection, Embedding, ReidSample, REID_DIM};
pub use gmc::{FrameView, GmcConfig, MotionEstimator, MotionModel, TranslationGmc};
pub use hungarian::{AssignmentResult, HungarianSolver};
pub use ocsort::{OcSortConfig, OcSortTracker, TrackOutput};
