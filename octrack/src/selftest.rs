//! Deterministic self-test for the observation-centric re-update

use crate::bbox::Bbox;
use crate::box_tracker::KalmanBoxTracker;
use crate::detection::Detection;
use anyhow::{ensure, Result};

fn make_det(cx: f32, cy: f32, w: f32, h: f32, score: f32) -> Detection {
    Detection::new(
        Bbox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0),
        score,
    )
}

/// Deterministic ORU scenario on a single track, bypassing association.
///
/// Scenario:
/// - observe an object moving right (frames 0-2)
/// - occlusion gap (frames 3-7), `update(None)` each frame
/// - re-observe at frame 8 far to the right, which triggers ORU
/// - the frame-9 prediction must continue moving right
pub fn run_oru_self_test() -> Result<()> {
    let mut trk = KalmanBoxTracker::new(make_det(0.20, 0.50, 0.10, 0.10, 1.0), 0, 3);

    // Frames 1-2: observe motion
    for f in 1..=2 {
        let _ = trk.predict();
        let cx = 0.20 + 0.05 * f as f32;
        trk.update(Some(&make_det(cx, 0.50, 0.10, 0.10, 1.0)));
    }

    // Frames 3-7: occlusion
    for _ in 3..=7 {
        let _ = trk.predict();
        trk.update(None);
    }

    // Frame 8: re-activation
    let _ = trk.predict();
    trk.update(Some(&make_det(0.80, 0.50, 0.10, 0.10, 1.0)));
    let cx8 = trk.state_bbox().center_x();

    // Frame 9: prediction must move right (recovered vx > 0)
    let cx9 = trk.predict().center_x();

    ensure!(
        cx9 > cx8 + 0.02,
        "expected positive velocity after ORU (cx8={cx8:.4}, cx9={cx9:.4})"
    );
    log::info!("OC-SORT self-test passed (cx8={cx8:.4}, cx9={cx9:.4})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_test_passes() {
        run_oru_self_test().unwrap();
    }
}
