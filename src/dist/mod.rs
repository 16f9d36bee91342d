pub mod mvn;

pub use mvn::{Mvn, MvnError};

use serde::{Deserialize, Serialize};

/// Mean and variance of a univariate Gaussian, used for per-parameter
/// initial priors and posteriors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistParams {
    pub mean: f64,
    pub var: f64,
}

impl DistParams {
    pub fn new(mean: f64, var: f64) -> Self {
        Self { mean, var }
    }

    pub fn precision(&self) -> f64 {
        1.0 / self.var
    }
}
