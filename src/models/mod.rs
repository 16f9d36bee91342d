pub mod linear;
pub mod polynomial;
pub mod trivial;

pub use linear::LinearModel;
pub use polynomial::PolynomialModel;
pub use trivial::TrivialModel;

use crate::dist::DistParams;
use crate::options::{OptionKind, OptionSpec, OptionsError, RunOptions};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Invalid parameter value: {parameter} = {value}")]
    InvalidParameter { parameter: String, value: f64 },

    #[error(transparent)]
    Options(#[from] OptionsError),
}

/// A parametric forward model f(theta, t) evaluated on the implicit time grid
/// t = 1..=T. Parameters arrive in model space; the inference core owns the
/// fabber-space representation and the transforms between the two.
pub trait ForwardModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn param_names(&self) -> Vec<String>;

    fn n_params(&self) -> usize {
        self.param_names().len()
    }

    /// Prediction vector of length `n_timepoints`.
    fn evaluate(&self, params: &DVector<f64>, n_timepoints: usize) -> DVector<f64>;

    /// T x P Jacobian at `params`. The default is central finite differences
    /// over `evaluate`; models with cheap analytic derivatives override it.
    fn jacobian(&self, params: &DVector<f64>, n_timepoints: usize) -> DMatrix<f64> {
        let p = params.len();
        let mut jac = DMatrix::zeros(n_timepoints, p);
        for j in 0..p {
            let h = 1e-5 * params[j].abs().max(1.0);
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus[j] += h;
            minus[j] -= h;
            let f_plus = self.evaluate(&plus, n_timepoints);
            let f_minus = self.evaluate(&minus, n_timepoints);
            for t in 0..n_timepoints {
                jac[(t, j)] = (f_plus[t] - f_minus[t]) / (2.0 * h);
            }
        }
        jac
    }

    /// Hard-coded initial prior/posterior per parameter, in model space.
    fn initial_dists(&self) -> Vec<DistParams>;

    /// Default transform code per parameter ("I", "L" or "S").
    fn transform_codes(&self) -> Vec<&'static str> {
        vec!["I"; self.n_params()]
    }

    /// Options this model understands, for `--help --model=<name>`.
    fn option_specs(&self) -> &'static [OptionSpec] {
        &[]
    }
}

pub const MODEL_NAMES: &[&str] = &["linear", "poly", "trivial"];

const POLY_OPTIONS: &[OptionSpec] = &[OptionSpec {
    name: "degree",
    kind: OptionKind::Int,
    default: Some("2"),
    description: "Polynomial degree (parameters c0..c<degree>)",
}];

/// Construction factory keyed by model name; the registry is the closed,
/// process-wide table of built-in models.
pub fn create_model(name: &str, options: &RunOptions) -> Result<Box<dyn ForwardModel>, ModelError> {
    match name {
        "linear" => Ok(Box::new(LinearModel::new())),
        "poly" => {
            let degree = options.get_usize_or("degree", 2)?;
            Ok(Box::new(PolynomialModel::new(degree)))
        }
        "trivial" => Ok(Box::new(TrivialModel::new())),
        _ => Err(ModelError::UnknownModel(name.to_string())),
    }
}

/// Option table for a model name without constructing it.
pub fn model_option_specs(name: &str) -> Result<&'static [OptionSpec], ModelError> {
    match name {
        "linear" | "trivial" => Ok(&[]),
        "poly" => Ok(POLY_OPTIONS),
        _ => Err(ModelError::UnknownModel(name.to_string())),
    }
}
