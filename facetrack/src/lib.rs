//! Face detection and tracking pipeline
//!
//! Turns a stream of sparse face detections into stable per-identity
//! trajectories across a video:
//!
//! - sparse detection at a configurable rate (default 5fps sampling)
//! - OC-SORT tracking with camera-motion compensation between frames
//! - appearance embeddings with quality gating
//! - offline tracklet linking over appearance prototypes
//!
//! The detector and embedder networks are external collaborators behind
//! the [`detector::FaceDetector`] and [`embedding::FaceEmbedder`] traits;
//! everything else is self-contained.

pub mod detector;
pub mod embedding;
pub mod error;
pub mod linking;
pub mod pipeline;
pub mod types;

pub use detector::{FaceDetector, ScrfdDetector};
pub use embedding::{EmbeddingConfig, EmbeddingExtractor, FaceEmbedder, MobileFaceNetEmbedder};
pub use error::{PipelineError, Result};
pub use pipeline::FacePipeline;
pub use types::{
    FaceDetection, FaceRecord, FaceTrack, ImageData, ImageReport, PipelineConfig, TrackFrame,
    TrackingReport,
};

/// Get library version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
