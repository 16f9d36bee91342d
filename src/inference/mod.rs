pub mod cache;
pub mod convergence;
pub mod spatial;
pub mod vb;

pub use cache::{CovarianceCache, DistanceMatrix, DistanceMeasure, SpatialStats};
pub use convergence::{ConvergenceDetector, ConvergencePolicy, ConvergenceStatus};
pub use spatial::SpatialVbEstimator;
pub use vb::{VbEstimator, VoxelState};

use crate::data::{DataError, VoxelDataset};
use crate::dist::{Mvn, MvnError};
use crate::models::ForwardModel;
use crate::noise::{NoiseError, NoiseModel};
use crate::options::{OptionKind, OptionSpec, OptionsError, RunOptions};
use crate::priors::PriorError;
use crate::transforms::ParamTransform;
use ndarray::Array2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Numerical failure: {0}")]
    Numerical(String),

    #[error(transparent)]
    Mvn(#[from] MvnError),

    #[error(transparent)]
    Noise(#[from] NoiseError),

    #[error(transparent)]
    Prior(#[from] PriorError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error("Free energy diverged; last stable value {0}")]
    Diverged(f64),

    #[error("Run cancelled")]
    Cancelled,
}

pub const METHOD_NAMES: &[&str] = &["vb", "spatialvb"];

/// Cooperative cancellation flag, checked at voxel boundaries and at the
/// start of each outer iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub const VB_OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "maxits",
        kind: OptionKind::Int,
        default: Some("25"),
        description: "Maximum VB iterations per voxel",
    },
    OptionSpec {
        name: "fchange",
        kind: OptionKind::Float,
        default: Some("1e-4"),
        description: "Convergence tolerance on the per-voxel free-energy change",
    },
    OptionSpec {
        name: "convergence",
        kind: OptionKind::Str,
        default: Some("fchange"),
        description: "Convergence policy: maxits, fchange, trialmode or lm",
    },
    OptionSpec {
        name: "max-trials",
        kind: OptionKind::Int,
        default: Some("10"),
        description: "Reverted-step retries before a voxel gives up (trialmode/lm)",
    },
];

pub const SPATIALVB_OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "spatial-dims",
        kind: OptionKind::Int,
        default: Some("3"),
        description: "Spatial coupling axes: 0 none, 1 x only, 2 in-slice, 3 volume",
    },
    OptionSpec {
        name: "param-spatial-priors",
        kind: OptionKind::Str,
        default: Some("N+"),
        description: "Per-parameter prior type string (N,I,A,M,m,P,p; trailing + repeats)",
    },
    OptionSpec {
        name: "fixed-delta",
        kind: OptionKind::Float,
        default: Some("-1"),
        description: "Fix the spatial length scale delta (negative = optimise)",
    },
    OptionSpec {
        name: "fixed-rho",
        kind: OptionKind::Float,
        default: Some("-1"),
        description: "Fix the spatial precision rho (negative = optimise)",
    },
    OptionSpec {
        name: "spatial-speed",
        kind: OptionKind::Float,
        default: Some("-1"),
        description: "Per-step cap on the rho change ratio (>= 1, or -1 unlimited)",
    },
    OptionSpec {
        name: "update-first-iter",
        kind: OptionKind::Bool,
        default: Some("false"),
        description: "Update spatial hyper-parameters on the first outer iteration",
    },
    OptionSpec {
        name: "use-sim-evidence",
        kind: OptionKind::Bool,
        default: Some("false"),
        description: "Joint evidence update of all kernel spatial priors",
    },
    OptionSpec {
        name: "new-delta-evaluations",
        kind: OptionKind::Int,
        default: Some("10"),
        description: "Evaluation cap for the delta evidence search",
    },
    OptionSpec {
        name: "brute-force-delta-search",
        kind: OptionKind::Bool,
        default: Some("false"),
        description: "Replace the secant delta search with a log-grid scan",
    },
    OptionSpec {
        name: "distance-measure",
        kind: OptionKind::Str,
        default: Some("sqeuclidean"),
        description: "Voxel distance metric: euclidean, sqeuclidean or manhattan",
    },
    OptionSpec {
        name: "max-iterations",
        kind: OptionKind::Int,
        default: Some("10"),
        description: "Maximum outer iterations of the spatial loop",
    },
    OptionSpec {
        name: "outer-fchange",
        kind: OptionKind::Float,
        default: Some("0.01"),
        description: "Convergence tolerance on the aggregate free-energy change",
    },
];

#[derive(Debug, Clone)]
pub struct VbConfig {
    pub max_iterations: usize,
    pub f_change_tolerance: f64,
    pub policy: ConvergencePolicy,
    pub max_trials: usize,
    /// Print percentage progress to stdout during sweeps.
    pub progress: bool,
}

impl Default for VbConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            f_change_tolerance: 1e-4,
            policy: ConvergencePolicy::FChange,
            max_trials: 10,
            progress: false,
        }
    }
}

impl VbConfig {
    pub fn from_options(options: &RunOptions) -> Result<Self, OptionsError> {
        let policy = ConvergencePolicy::from_name(&options.get_str_or("convergence", "fchange"))?;
        Ok(Self {
            max_iterations: options.get_usize_or("maxits", 25)?,
            f_change_tolerance: options.get_f64_or("fchange", 1e-4)?,
            policy,
            max_trials: options.get_usize_or("max-trials", 10)?,
            progress: false,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SpatialConfig {
    pub vb: VbConfig,
    pub spatial_dims: usize,
    pub prior_types: String,
    pub fixed_delta: f64,
    pub fixed_rho: f64,
    pub spatial_speed: f64,
    pub update_first_iter: bool,
    pub use_sim_evidence: bool,
    pub new_delta_evaluations: usize,
    pub brute_force_delta_search: bool,
    pub distance_measure: DistanceMeasure,
    pub max_outer_iterations: usize,
    pub outer_tolerance: f64,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            vb: VbConfig::default(),
            spatial_dims: 3,
            prior_types: "N+".to_string(),
            fixed_delta: -1.0,
            fixed_rho: -1.0,
            spatial_speed: -1.0,
            update_first_iter: false,
            use_sim_evidence: false,
            new_delta_evaluations: 10,
            brute_force_delta_search: false,
            distance_measure: DistanceMeasure::SquaredEuclidean,
            max_outer_iterations: 10,
            outer_tolerance: 0.01,
        }
    }
}

impl SpatialConfig {
    pub fn from_options(options: &RunOptions) -> Result<Self, OptionsError> {
        let spatial_speed = options.get_f64_or("spatial-speed", -1.0)?;
        if spatial_speed >= 0.0 && spatial_speed < 1.0 {
            return Err(OptionsError::InvalidValue {
                key: "spatial-speed".to_string(),
                value: spatial_speed.to_string(),
                expected: "a value >= 1, or -1 for unlimited",
            });
        }
        Ok(Self {
            vb: VbConfig::from_options(options)?,
            spatial_dims: options.get_usize_or("spatial-dims", 3)?,
            prior_types: options.get_str_or("param-spatial-priors", "N+"),
            fixed_delta: options.get_f64_or("fixed-delta", -1.0)?,
            fixed_rho: options.get_f64_or("fixed-rho", -1.0)?,
            spatial_speed,
            update_first_iter: options.get_bool("update-first-iter")?,
            use_sim_evidence: options.get_bool("use-sim-evidence")?,
            new_delta_evaluations: options.get_usize_or("new-delta-evaluations", 10)?,
            brute_force_delta_search: options.get_bool("brute-force-delta-search")?,
            distance_measure: DistanceMeasure::from_name(
                &options.get_str_or("distance-measure", "sqeuclidean"),
            )?,
            max_outer_iterations: options.get_usize_or("max-iterations", 10)?,
            outer_tolerance: options.get_f64_or("outer-fchange", 0.01)?,
        })
    }
}

/// Per-voxel outputs of a completed run, in dataset voxel order.
#[derive(Debug, Clone)]
pub struct FitResults {
    pub param_names: Vec<String>,
    /// P x V model-space posterior means.
    pub means: Array2<f64>,
    /// P x V model-space posterior standard deviations.
    pub stds: Array2<f64>,
    pub noise_means: Vec<f64>,
    pub noise_stds: Vec<f64>,
    pub free_energy: Vec<f64>,
    /// T x V model prediction at the posterior mean.
    pub modelfit: Array2<f64>,
    /// T x V data minus modelfit.
    pub residuals: Array2<f64>,
    /// Final fabber-space posterior per voxel.
    pub posteriors: Vec<Mvn>,
    pub converged: Vec<bool>,
    pub failed: Vec<Option<String>>,
    pub outer_iterations: usize,
}

impl FitResults {
    pub fn n_voxels(&self) -> usize {
        self.free_energy.len()
    }

    pub fn n_failed(&self) -> usize {
        self.failed.iter().filter(|f| f.is_some()).count()
    }

    pub fn n_converged(&self) -> usize {
        self.converged.iter().filter(|c| **c).count()
    }

    /// Mean free energy over voxels that completed.
    pub fn aggregate_free_energy(&self) -> f64 {
        let mut sum = 0.0;
        let mut n = 0;
        for (f, failed) in self.free_energy.iter().zip(&self.failed) {
            if failed.is_none() {
                sum += f;
                n += 1;
            }
        }
        if n > 0 {
            sum / n as f64
        } else {
            f64::NEG_INFINITY
        }
    }
}

/// Assemble user-facing results from the final voxel states. Model-space
/// moments come from the fabber-space posterior by the delta method.
pub fn collect_results(
    model: &dyn ForwardModel,
    noise: &NoiseModel,
    transforms: &[&'static dyn ParamTransform],
    dataset: &VoxelDataset,
    states: &mut [VoxelState],
    outer_iterations: usize,
) -> Result<FitResults, InferenceError> {
    let n_voxels = dataset.n_voxels();
    let n_timepoints = dataset.n_timepoints();
    let n_params = model.n_params();

    let mut means = Array2::zeros((n_params, n_voxels));
    let mut stds = Array2::zeros((n_params, n_voxels));
    let mut modelfit = Array2::zeros((n_timepoints, n_voxels));
    let mut residuals = Array2::zeros((n_timepoints, n_voxels));
    let mut noise_means = Vec::with_capacity(n_voxels);
    let mut noise_stds = Vec::with_capacity(n_voxels);
    let mut free_energy = Vec::with_capacity(n_voxels);
    let mut posteriors = Vec::with_capacity(n_voxels);
    let mut converged = Vec::with_capacity(n_voxels);
    let mut failed = Vec::with_capacity(n_voxels);

    for (v, state) in states.iter_mut().enumerate() {
        let fab_mean = state.posterior.mean().clone();
        let cov_diag = state.posterior.covariance()?.diagonal();

        let mut theta = nalgebra::DVector::zeros(n_params);
        for i in 0..n_params {
            let t = transforms[i];
            theta[i] = t.to_model(fab_mean[i]);
            means[(i, v)] = theta[i];
            stds[(i, v)] = t.deriv(fab_mean[i]).abs() * cov_diag[i].sqrt();
        }

        let pred = model.evaluate(&theta, n_timepoints);
        let y = dataset.timeseries(v);
        for t in 0..n_timepoints {
            modelfit[(t, v)] = pred[t];
            residuals[(t, v)] = y[t] - pred[t];
        }

        let (nm, ns) = noise.posterior_moments(&state.noise)?;
        noise_means.push(nm);
        noise_stds.push(ns);
        free_energy.push(state.free_energy);
        posteriors.push(state.posterior.clone());
        converged.push(state.converged);
        failed.push(state.failed.clone());
    }

    Ok(FitResults {
        param_names: model.param_names(),
        means,
        stds,
        noise_means,
        noise_stds,
        free_energy,
        modelfit,
        residuals,
        posteriors,
        converged,
        failed,
        outer_iterations,
    })
}

/// Initial per-voxel states seeded from fabber-space distributions, one per
/// parameter (typically the effective priors).
pub fn initial_states(
    noise: &NoiseModel,
    fabber_dists: &[crate::dist::DistParams],
    n_voxels: usize,
) -> Vec<VoxelState> {
    let n = fabber_dists.len();
    let mut mean = nalgebra::DVector::zeros(n);
    let mut cov = nalgebra::DMatrix::zeros(n, n);
    for (i, d) in fabber_dists.iter().enumerate() {
        mean[i] = d.mean;
        cov[(i, i)] = d.var;
    }
    let posterior = Mvn::from_mean_covariance(mean, cov);

    (0..n_voxels)
        .map(|_| VoxelState::new(posterior.clone(), noise.init_posterior()))
        .collect()
}

/// Fabber-space base priors for each parameter, from the model's hard-coded
/// model-space distributions.
pub fn initial_fabber_priors(
    model: &dyn ForwardModel,
    transforms: &[&'static dyn ParamTransform],
) -> Vec<crate::dist::DistParams> {
    model
        .initial_dists()
        .iter()
        .zip(transforms)
        .map(|(d, t)| t.dist_to_fabber(*d))
        .collect()
}
