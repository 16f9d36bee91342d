pub mod ar1;
pub mod white;

pub use ar1::{Ar1Noise, Ar1Posterior};
pub use white::{WhiteNoise, WhitePosterior};

use crate::options::{OptionKind, OptionSpec, OptionsError, RunOptions};
use nalgebra::DVector;
use thiserror::Error;

pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_3;

#[derive(Error, Debug)]
pub enum NoiseError {
    #[error("Unknown noise model: {0}")]
    UnknownNoise(String),

    #[error("Noise posterior kind does not match the noise model")]
    PosteriorMismatch,

    #[error(transparent)]
    Options(#[from] OptionsError),
}

pub const NOISE_NAMES: &[&str] = &["white", "ar1"];

pub const NOISE_OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "noise-prior-shape",
        kind: OptionKind::Float,
        default: Some("1e-6"),
        description: "Shape c0 of the Gamma prior on noise precision",
    },
    OptionSpec {
        name: "noise-prior-scale",
        kind: OptionKind::Float,
        default: Some("1e6"),
        description: "Scale s0 of the Gamma prior on noise precision",
    },
    OptionSpec {
        name: "ar1-alpha-prior-var",
        kind: OptionKind::Float,
        default: Some("1.0"),
        description: "Prior variance of the AR(1) coefficient",
    },
];

/// Observation-noise model: the closed set of variants sharing one update
/// and free-energy contract, dispatched as a tagged sum.
#[derive(Debug, Clone)]
pub enum NoiseModel {
    White(WhiteNoise),
    Ar1(Ar1Noise),
}

/// Per-voxel noise posterior state matching the model variant.
#[derive(Debug, Clone)]
pub enum NoisePosterior {
    White(WhitePosterior),
    Ar1(Ar1Posterior),
}

impl NoiseModel {
    pub fn from_name(name: &str, options: &RunOptions) -> Result<Self, NoiseError> {
        let shape = options.get_f64_or("noise-prior-shape", 1e-6)?;
        let scale = options.get_f64_or("noise-prior-scale", 1e6)?;
        match name {
            "white" => Ok(NoiseModel::White(WhiteNoise::new(shape, scale))),
            "ar1" => {
                let alpha_var = options.get_f64_or("ar1-alpha-prior-var", 1.0)?;
                Ok(NoiseModel::Ar1(Ar1Noise::new(shape, scale, alpha_var)))
            }
            _ => Err(NoiseError::UnknownNoise(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NoiseModel::White(_) => "white",
            NoiseModel::Ar1(_) => "ar1",
        }
    }

    pub fn init_posterior(&self) -> NoisePosterior {
        match self {
            NoiseModel::White(m) => NoisePosterior::White(m.init_posterior()),
            NoiseModel::Ar1(m) => NoisePosterior::Ar1(m.init_posterior()),
        }
    }

    pub fn expected_precision(&self, posterior: &NoisePosterior) -> Result<f64, NoiseError> {
        match (self, posterior) {
            (NoiseModel::White(_), NoisePosterior::White(p)) => Ok(p.c * p.s),
            (NoiseModel::Ar1(_), NoisePosterior::Ar1(p)) => Ok(p.c * p.s),
            _ => Err(NoiseError::PosteriorMismatch),
        }
    }

    /// One coordinate-ascent step of q(phi) given the current residual and
    /// the linearisation trace tr(J Sigma J').
    pub fn update(
        &self,
        posterior: &mut NoisePosterior,
        residual: &DVector<f64>,
        model_trace: f64,
    ) -> Result<(), NoiseError> {
        match (self, posterior) {
            (NoiseModel::White(m), NoisePosterior::White(p)) => {
                m.update(p, residual, model_trace);
                Ok(())
            }
            (NoiseModel::Ar1(m), NoisePosterior::Ar1(p)) => {
                m.update(p, residual, model_trace);
                Ok(())
            }
            _ => Err(NoiseError::PosteriorMismatch),
        }
    }

    /// Noise contribution to the free energy: the expected data log-likelihood
    /// plus the prior and entropy terms of q(phi) (and q(alpha) for AR(1)).
    pub fn free_energy(
        &self,
        posterior: &NoisePosterior,
        residual: &DVector<f64>,
        model_trace: f64,
    ) -> Result<f64, NoiseError> {
        match (self, posterior) {
            (NoiseModel::White(m), NoisePosterior::White(p)) => {
                Ok(m.free_energy(p, residual, model_trace))
            }
            (NoiseModel::Ar1(m), NoisePosterior::Ar1(p)) => {
                Ok(m.free_energy(p, residual, model_trace))
            }
            _ => Err(NoiseError::PosteriorMismatch),
        }
    }

    /// Posterior mean and standard deviation of the noise precision.
    pub fn posterior_moments(&self, posterior: &NoisePosterior) -> Result<(f64, f64), NoiseError> {
        match (self, posterior) {
            (NoiseModel::White(_), NoisePosterior::White(p)) => {
                Ok((p.c * p.s, p.c.sqrt() * p.s))
            }
            (NoiseModel::Ar1(_), NoisePosterior::Ar1(p)) => Ok((p.c * p.s, p.c.sqrt() * p.s)),
            _ => Err(NoiseError::PosteriorMismatch),
        }
    }
}

/// Expected log-likelihood, Gamma-prior and Gamma-entropy terms shared by the
/// noise variants. `n_effective` is the number of whitened timepoints.
pub(crate) fn gamma_free_energy_terms(
    c: f64,
    s: f64,
    c0: f64,
    s0: f64,
    n_effective: f64,
    expected_ssq: f64,
) -> f64 {
    use statrs::function::gamma::{digamma, ln_gamma};

    let e_phi = c * s;
    let e_log_phi = digamma(c) + s.ln();

    let likelihood = 0.5 * n_effective * (e_log_phi - LN_2PI) - 0.5 * e_phi * expected_ssq;
    let prior = (c0 - 1.0) * e_log_phi - e_phi / s0 - c0 * s0.ln() - ln_gamma(c0);
    let entropy = c + s.ln() + ln_gamma(c) + (1.0 - c) * digamma(c);

    likelihood + prior + entropy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory() {
        let opts = RunOptions::new();
        assert_eq!(NoiseModel::from_name("white", &opts).unwrap().name(), "white");
        assert_eq!(NoiseModel::from_name("ar1", &opts).unwrap().name(), "ar1");
        assert!(matches!(
            NoiseModel::from_name("pink", &opts),
            Err(NoiseError::UnknownNoise(_))
        ));
    }

    #[test]
    fn test_posterior_mismatch_detected() {
        let opts = RunOptions::new();
        let white = NoiseModel::from_name("white", &opts).unwrap();
        let ar1 = NoiseModel::from_name("ar1", &opts).unwrap();
        let mut post = ar1.init_posterior();
        let r = DVector::from_vec(vec![0.1, 0.2]);
        assert!(matches!(
            white.update(&mut post, &r, 0.0),
            Err(NoiseError::PosteriorMismatch)
        ));
    }
}
