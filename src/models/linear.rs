use super::ForwardModel;
use crate::dist::DistParams;
use nalgebra::{DMatrix, DVector};

/// f(t) = offset + slope * t
pub struct LinearModel;

impl LinearModel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinearModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardModel for LinearModel {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn param_names(&self) -> Vec<String> {
        vec!["offset".to_string(), "slope".to_string()]
    }

    fn evaluate(&self, params: &DVector<f64>, n_timepoints: usize) -> DVector<f64> {
        DVector::from_iterator(
            n_timepoints,
            (1..=n_timepoints).map(|t| params[0] + params[1] * t as f64),
        )
    }

    fn jacobian(&self, _params: &DVector<f64>, n_timepoints: usize) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(n_timepoints, 2);
        for t in 0..n_timepoints {
            jac[(t, 0)] = 1.0;
            jac[(t, 1)] = (t + 1) as f64;
        }
        jac
    }

    fn initial_dists(&self) -> Vec<DistParams> {
        vec![DistParams::new(0.0, 1e6); 2]
    }
}
