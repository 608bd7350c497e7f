//! Scalar recursive estimator used for optional display smoothing.

use crate::config::SmoothingParams;

#[derive(Debug, Clone, PartialEq)]
pub struct KalmanFilter {
    q: f64,
    r: f64,
    p: f64,
    x: f64,
}

impl KalmanFilter {
    /// Start a filter whose estimate is `initial`.
    pub fn new(params: &SmoothingParams, initial: f64) -> Self {
        Self {
            q: params.process_noise,
            r: params.measurement_noise,
            p: params.initial_covariance,
            x: initial,
        }
    }

    /// Fold in one measurement and return the new estimate.
    pub fn update(&mut self, measurement: f64) -> f64 {
        self.p += self.q;
        let k = self.p / (self.p + self.r);
        self.x += k * (measurement - self.x);
        self.p *= 1.0 - k;
        self.x
    }

    pub fn estimate(&self) -> f64 {
        self.x
    }

    /// Adopt new noise parameters without losing the current estimate.
    pub fn retune(&mut self, params: &SmoothingParams) {
        self.q = params.process_noise;
        self.r = params.measurement_noise;
    }
}
