use super::{ForwardModel, POLY_OPTIONS};
use crate::dist::DistParams;
use crate::options::OptionSpec;
use nalgebra::{DMatrix, DVector};

/// f(t) = c0 + c1*t + ... + c<degree>*t^degree
pub struct PolynomialModel {
    degree: usize,
}

impl PolynomialModel {
    pub fn new(degree: usize) -> Self {
        Self { degree }
    }

    pub fn degree(&self) -> usize {
        self.degree
    }
}

impl ForwardModel for PolynomialModel {
    fn name(&self) -> &'static str {
        "poly"
    }

    fn param_names(&self) -> Vec<String> {
        (0..=self.degree).map(|k| format!("c{}", k)).collect()
    }

    fn evaluate(&self, params: &DVector<f64>, n_timepoints: usize) -> DVector<f64> {
        DVector::from_iterator(
            n_timepoints,
            (1..=n_timepoints).map(|t| {
                let t = t as f64;
                (0..=self.degree).map(|k| params[k] * t.powi(k as i32)).sum()
            }),
        )
    }

    fn jacobian(&self, _params: &DVector<f64>, n_timepoints: usize) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(n_timepoints, self.degree + 1);
        for t in 0..n_timepoints {
            let tv = (t + 1) as f64;
            for k in 0..=self.degree {
                jac[(t, k)] = tv.powi(k as i32);
            }
        }
        jac
    }

    fn initial_dists(&self) -> Vec<DistParams> {
        vec![DistParams::new(0.0, 1e6); self.degree + 1]
    }

    fn option_specs(&self) -> &'static [OptionSpec] {
        POLY_OPTIONS
    }
}
