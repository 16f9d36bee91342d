use super::ForwardModel;
use crate::dist::DistParams;
use nalgebra::{DMatrix, DVector};

/// Constant model f(t) = mean; the smallest useful reference model.
pub struct TrivialModel;

impl TrivialModel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TrivialModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardModel for TrivialModel {
    fn name(&self) -> &'static str {
        "trivial"
    }

    fn param_names(&self) -> Vec<String> {
        vec!["mean".to_string()]
    }

    fn evaluate(&self, params: &DVector<f64>, n_timepoints: usize) -> DVector<f64> {
        DVector::from_element(n_timepoints, params[0])
    }

    fn jacobian(&self, _params: &DVector<f64>, n_timepoints: usize) -> DMatrix<f64> {
        DMatrix::from_element(n_timepoints, 1, 1.0)
    }

    fn initial_dists(&self) -> Vec<DistParams> {
        vec![DistParams::new(0.0, 1e6)]
    }
}
