//! Type definitions for the face tracking pipeline

use crate::error::{PipelineError, Result};
use octrack::FrameView;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Input frame data: interleaved RGB pixels.
#[derive(Debug, Clone)]
pub struct ImageData {
    /// Raw RGB pixel data
    pub data: Vec<u8>,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
}

impl ImageData {
    /// Create new image data
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    /// Load image from file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let img = image::open(path.as_ref())?;
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Self {
            data: rgb.into_raw(),
            width,
            height,
        })
    }

    /// Load image from encoded bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let img = image::load_from_memory(bytes)?;
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Self {
            data: rgb.into_raw(),
            width,
            height,
        })
    }

    /// Validate image data consistency
    pub fn validate(&self) -> bool {
        self.data.len() == (self.width as usize) * (self.height as usize) * 3
    }

    /// Borrowed view for the motion estimator.
    pub fn view(&self) -> FrameView<'_> {
        FrameView::new(&self.data, self.width, self.height)
    }

    pub(crate) fn ensure_valid(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || !self.validate() {
            return Err(PipelineError::invalid_input(format!(
                "inconsistent image buffer: {}x{} with {} bytes",
                self.width,
                self.height,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// Raw detector output for one face, in absolute pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetection {
    /// [x1, y1, x2, y2] in absolute pixels
    pub bbox: [f32; 4],
    /// Confidence score in [0,1]
    pub score: f32,
    /// Optional 5-point landmarks (eyes, nose, mouth corners), absolute px
    pub landmarks: Option<[[f32; 2]; 5]>,
}

/// One face in the single-image JSON report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRecord {
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub landmarks: Vec<[f32; 2]>,
}

/// Single-image detection report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReport {
    pub image: String,
    pub width: u32,
    pub height: u32,
    pub faces: Vec<FaceRecord>,
}

/// Single frame data for a track. Bbox is normalized to [0,1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackFrame {
    #[serde(rename = "frameIndex")]
    pub frame_index: usize,
    pub bbox: [f32; 4],
    pub confidence: f32,
}

/// Complete face track across multiple frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceTrack {
    pub id: u32,
    pub frames: Vec<TrackFrame>,
}

/// Tracking-mode pipeline output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingReport {
    pub tracks: Vec<FaceTrack>,
    #[serde(rename = "frameCount")]
    pub frame_count: usize,
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Face detection confidence threshold
    pub conf_thresh: f32,
    /// Detector NMS IoU threshold
    pub nms_thresh: f32,
    /// Tracking IoU gate
    pub iou_thresh: f32,
    /// Sparse detection sampling rate (detections per second)
    pub detection_fps: f32,
    /// Appearance weight in association costs
    pub reid_weight: f32,
    /// Appearance cosine similarity gate
    pub reid_cos_thresh: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            conf_thresh: 0.5,
            nms_thresh: 0.4,
            iou_thresh: 0.15,
            detection_fps: 5.0,
            reid_weight: 0.35,
            reid_cos_thresh: 0.35,
        }
    }
}
