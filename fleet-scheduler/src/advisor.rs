// SPDX-License-Identifier: MIT

use fleet_model::Worker;

/// Optional load advisor. A prediction reshapes the assignment
/// objective but can never relax a hard constraint; candidates are
/// filtered before any advisor sees them.
pub trait LoadPredictor: Send + Sync {
    /// Expected load in [0, 1]; higher means less preferred.
    fn predicted_load(&self, worker: &Worker) -> f64;
}

/// Default advisor: no opinion.
pub struct NoLoadPrediction;

impl LoadPredictor for NoLoadPrediction {
    fn predicted_load(&self, _worker: &Worker) -> f64 {
        0.0
    }
}
