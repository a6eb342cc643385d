//! Face detector interface
//!
//! The pipeline works with any detector architecture as long as it
//! implements this interface; the SCRFD model files are validated here but
//! inference itself is an external collaborator.

use crate::error::{PipelineError, Result};
use crate::types::{FaceDetection, ImageData};
use std::path::{Path, PathBuf};

/// Common interface for face detectors
pub trait FaceDetector: Send {
    /// Detect faces in a single image. Returns absolute-pixel boxes with
    /// scores and, when the model provides them, 5-point landmarks.
    fn detect(&mut self, image: &ImageData) -> Result<Vec<FaceDetection>>;

    /// Detector name (for logging/debugging)
    fn name(&self) -> &str;
}

/// SCRFD face detector model handle.
///
/// Construction validates that the model directory contains the expected
/// `scrfd.param`/`scrfd.bin` pair. The inference backend itself is not
/// linked into this crate; `detect` reports no faces and logs a warning,
/// which downstream stages treat as an empty frame.
#[derive(Debug)]
pub struct ScrfdDetector {
    param_path: PathBuf,
    bin_path: PathBuf,
    conf_thresh: f32,
    nms_thresh: f32,
}

impl ScrfdDetector {
    pub fn new<P: AsRef<Path>>(model_dir: P, conf_thresh: f32, nms_thresh: f32) -> Result<Self> {
        let dir = model_dir.as_ref();
        let param_path = dir.join("scrfd.param");
        let bin_path = dir.join("scrfd.bin");

        if !param_path.is_file() || !bin_path.is_file() {
            return Err(PipelineError::model_load(format!(
                "missing scrfd.param/scrfd.bin under {}",
                dir.display()
            )));
        }

        log::info!(
            "SCRFD model found: {} (conf={:.2}, nms={:.2})",
            dir.display(),
            conf_thresh,
            nms_thresh
        );

        Ok(Self {
            param_path,
            bin_path,
            conf_thresh,
            nms_thresh,
        })
    }

    pub fn conf_thresh(&self) -> f32 {
        self.conf_thresh
    }

    pub fn nms_thresh(&self) -> f32 {
        self.nms_thresh
    }

    pub fn model_paths(&self) -> (&Path, &Path) {
        (&self.param_path, &self.bin_path)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &ImageData) -> Result<Vec<FaceDetection>> {
        image.ensure_valid()?;
        log::warn!(
            "SCRFD inference backend not linked in this build; {}x{} frame treated as empty",
            image.width,
            image.height
        );
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "SCRFD"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_dir_is_rejected() {
        let err = ScrfdDetector::new("/nonexistent/model/dir", 0.5, 0.4).unwrap_err();
        assert!(matches!(err, PipelineError::ModelLoad(_)));
    }
}
