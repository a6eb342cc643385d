//! Kalman filter implementation for tracking

use crate::linalg::regularized_inverse;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct KalmanFilterParams {
    pub dim_x: usize,    // State dimension
    pub dim_z: usize,    // Observation dimension
    pub x: DVector<f32>, // Initial state
    pub p: DMatrix<f32>, // Initial state covariance
    pub f: DMatrix<f32>, // State transition matrix
    pub h: DMatrix<f32>, // Observation matrix
    pub r: DMatrix<f32>, // Observation noise covariance
    pub q: DMatrix<f32>, // Process noise covariance
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanFilter {
    pub dim_x: usize,
    pub dim_z: usize,
    pub x: DVector<f32>, // State vector
    pub p: DMatrix<f32>, // State covariance matrix
    pub f: DMatrix<f32>, // State transition matrix
    pub h: DMatrix<f32>, // Observation matrix
    pub r: DMatrix<f32>, // Observation noise covariance
    pub q: DMatrix<f32>, // Process noise covariance
}

impl KalmanFilter {
    pub fn new(params: KalmanFilterParams) -> Self {
        Self {
            dim_x: params.dim_x,
            dim_z: params.dim_z,
            x: params.x,
            p: params.p,
            f: params.f,
            h: params.h,
            r: params.r,
            q: params.q,
        }
    }

    /// Predict the next state
    pub fn predict(&mut self) {
        // x = F * x
        self.x = &self.f * &self.x;

        // P = F * P * F^T + Q
        self.p = &self.f * &self.p * self.f.transpose() + &self.q;
    }

    /// Update with observation.
    ///
    /// The innovation covariance inverse is regularized, never fails; a
    /// near-singular S degrades the gain instead of aborting the track.
    pub fn update(&mut self, z: &DVector<f32>) {
        // Residual: y = z - H * x
        let y = z - &self.h * &self.x;

        // Innovation covariance: S = H * P * H^T + R
        let s = &self.h * &self.p * self.h.transpose() + &self.r;

        // Kalman gain: K = P * H^T * S^-1
        let k = &self.p * self.h.transpose() * regularized_inverse(&s);

        // Update state: x = x + K * y
        self.x = &self.x + &k * y;

        // Update covariance: P = (I - K * H) * P
        let i = DMatrix::identity(self.dim_x, self.dim_x);
        self.p = (i - &k * &self.h) * &self.p;
    }
}
