use super::convergence::{ConvergenceDetector, ConvergenceStatus};
use super::{CancelToken, InferenceError, VbConfig};
use crate::data::VoxelDataset;
use crate::dist::Mvn;
use crate::models::ForwardModel;
use crate::noise::{NoiseModel, NoisePosterior};
use crate::priors::{assemble_voxel_prior, ParamPrior};
use crate::transforms::ParamTransform;
use log::{debug, warn};
use nalgebra::{Cholesky, DVector};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-voxel inference state. The posterior lives in fabber space; the
/// forward model only ever sees transformed parameters.
#[derive(Debug, Clone)]
pub struct VoxelState {
    pub posterior: Mvn,
    pub noise: NoisePosterior,
    pub free_energy: f64,
    pub iterations: usize,
    pub converged: bool,
    pub failed: Option<String>,
}

impl VoxelState {
    pub fn new(posterior: Mvn, noise: NoisePosterior) -> Self {
        Self {
            posterior,
            noise,
            free_energy: f64::NEG_INFINITY,
            iterations: 0,
            converged: false,
            failed: None,
        }
    }
}

/// Per-voxel VB coordinate ascent under a linearised forward model.
pub struct VbEstimator<'a> {
    model: &'a dyn ForwardModel,
    noise: &'a NoiseModel,
    transforms: &'a [&'static dyn ParamTransform],
    config: &'a VbConfig,
}

impl<'a> VbEstimator<'a> {
    pub fn new(
        model: &'a dyn ForwardModel,
        noise: &'a NoiseModel,
        transforms: &'a [&'static dyn ParamTransform],
        config: &'a VbConfig,
    ) -> Self {
        Self {
            model,
            noise,
            transforms,
            config,
        }
    }

    fn to_model_space(&self, fabber_mean: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            fabber_mean.len(),
            fabber_mean
                .iter()
                .zip(self.transforms)
                .map(|(&x, t)| t.to_model(x)),
        )
    }

    /// E[log p(theta)] + H[q(theta)] for a diagonal effective prior.
    fn theta_free_energy(
        posterior: &mut Mvn,
        mu0: &DVector<f64>,
        lambda0: &DVector<f64>,
    ) -> Result<f64, InferenceError> {
        let p = mu0.len();
        let mean = posterior.mean().clone();
        let cov_diag = posterior.covariance()?.diagonal();
        let log_det = posterior.log_det_covariance()?;

        let mut quad = 0.0;
        let mut trace = 0.0;
        let mut log_prior_prec = 0.0;
        for i in 0..p {
            let d = mean[i] - mu0[i];
            quad += lambda0[i] * d * d;
            trace += lambda0[i] * cov_diag[i];
            log_prior_prec += lambda0[i].ln();
        }
        Ok(0.5 * log_prior_prec - 0.5 * (quad + trace) + 0.5 * log_det + 0.5 * p as f64)
    }

    /// Run one voxel to convergence. On a numerical error the caller is
    /// responsible for restoring the last good state.
    pub fn fit_voxel(
        &self,
        y: &DVector<f64>,
        priors: &[ParamPrior],
        voxel: usize,
        state: &mut VoxelState,
    ) -> Result<(), InferenceError> {
        let n_timepoints = y.len();
        let n_params = self.model.n_params();
        let mut monitor = ConvergenceDetector::from_config(self.config);

        state.converged = false;
        state.iterations = 0;

        // Reference point for step damping and the best state seen so far.
        let mut accepted_mean = state.posterior.mean().clone();
        let mut best: Option<(Mvn, NoisePosterior, f64)> = None;

        loop {
            // Linearise around the current fabber-space mean and chain the
            // Jacobian through the transforms.
            let fab_mean = state.posterior.mean().clone();
            let theta = self.to_model_space(&fab_mean);
            let pred = self.model.evaluate(&theta, n_timepoints);
            let jac_model = self.model.jacobian(&theta, n_timepoints);
            let mut jac = jac_model;
            for i in 0..n_params {
                let d = self.transforms[i].deriv(fab_mean[i]);
                for t in 0..n_timepoints {
                    jac[(t, i)] *= d;
                }
            }

            let (mu0, lambda0) = assemble_voxel_prior(priors, voxel, &mut state.posterior)?;

            // Posterior precision and mean update.
            let e_phi = self.noise.expected_precision(&state.noise)?;
            let jtj = jac.transpose() * &jac;
            let mut precision = &jtj * e_phi;
            let damping = monitor.lambda();
            for i in 0..n_params {
                precision[(i, i)] += lambda0[i] + damping;
            }

            let linear_data = y - &pred + &jac * &fab_mean;
            let mut rhs = jac.transpose() * &linear_data * e_phi;
            for i in 0..n_params {
                rhs[i] += lambda0[i] * mu0[i];
            }

            let sym = (&precision + precision.transpose()) * 0.5;
            let chol = Cholesky::new(sym).ok_or_else(|| {
                InferenceError::Numerical("posterior precision not positive definite".to_string())
            })?;
            let new_mean = chol.solve(&rhs);
            state.posterior.set_precision(precision);
            state.posterior.set_mean(new_mean.clone());

            // Noise update on the linearised residual at the new mean.
            let residual = &linear_data - &jac * &new_mean;
            let model_trace = (&jtj * state.posterior.covariance()?).trace();
            self.noise.update(&mut state.noise, &residual, model_trace)?;

            let f = self.noise.free_energy(&state.noise, &residual, model_trace)?
                + Self::theta_free_energy(&mut state.posterior, &mu0, &lambda0)?;

            state.iterations = monitor.iterations() + 1;
            if best.as_ref().map_or(true, |(_, _, bf)| f > *bf) {
                best = Some((state.posterior.clone(), state.noise.clone(), f));
            }

            match monitor.check(f) {
                ConvergenceStatus::Continue => {
                    accepted_mean = new_mean;
                }
                ConvergenceStatus::Converged => {
                    state.free_energy = f;
                    state.converged = true;
                    break;
                }
                ConvergenceStatus::Reverted => {
                    // Halve the step back toward the last accepted mean and
                    // let the next iteration re-linearise there.
                    let damped = (&accepted_mean + &new_mean) * 0.5;
                    state.posterior.set_mean(damped);
                }
                ConvergenceStatus::Diverged => {
                    if let Some((posterior, noise, f)) = best.take() {
                        state.posterior = posterior;
                        state.noise = noise;
                        state.free_energy = f;
                    }
                    state.converged = false;
                    debug!("voxel {} gave up after {} trials", voxel, self.config.max_trials);
                    break;
                }
            }
        }

        Ok(())
    }

    /// One sweep over all voxels. Priors are read-only (snapshotted by the
    /// caller), every voxel writes only its own slot, so the sweep fans out
    /// across the rayon pool. Failed voxels keep their last good state and
    /// are skipped in later sweeps.
    pub fn fit_all(
        &self,
        dataset: &VoxelDataset,
        priors: &[ParamPrior],
        states: &mut [VoxelState],
        cancel: &CancelToken,
    ) -> Result<(), InferenceError> {
        let n_voxels = dataset.n_voxels();
        let done = AtomicUsize::new(0);
        let step = (n_voxels / 20).max(1);

        states
            .par_iter_mut()
            .enumerate()
            .for_each(|(v, state)| {
                if cancel.is_cancelled() || state.failed.is_some() {
                    return;
                }
                let y = dataset.timeseries(v);
                let backup_posterior = state.posterior.clone();
                let backup_noise = state.noise.clone();
                if let Err(e) = self.fit_voxel(&y, priors, v, state) {
                    let c = dataset.coord(v);
                    warn!("voxel ({},{},{}) failed: {}", c[0], c[1], c[2], e);
                    state.posterior = backup_posterior;
                    state.noise = backup_noise;
                    state.failed = Some(e.to_string());
                }
                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                if self.config.progress && finished % step == 0 {
                    println!("{}%", 100 * finished / n_voxels);
                }
            });

        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::DistParams;
    use crate::inference::{initial_states, ConvergencePolicy};
    use crate::models::{LinearModel, TrivialModel};
    use crate::noise::NoiseModel;
    use crate::options::RunOptions;
    use crate::priors::{ParamPrior, PriorKind};
    use crate::transforms::get_transform;
    use approx::assert_relative_eq;

    fn white_noise() -> NoiseModel {
        NoiseModel::from_name("white", &RunOptions::new()).unwrap()
    }

    fn identity_transforms(n: usize) -> Vec<&'static dyn crate::transforms::ParamTransform> {
        (0..n).map(|_| get_transform("I").unwrap()).collect()
    }

    #[test]
    fn test_trivial_model_recovers_constant() {
        let model = TrivialModel::new();
        let noise = white_noise();
        let transforms = identity_transforms(1);
        let config = VbConfig {
            max_iterations: 50,
            ..VbConfig::default()
        };
        let estimator = VbEstimator::new(&model, &noise, &transforms, &config);

        let priors = vec![ParamPrior::new(PriorKind::Normal, DistParams::new(0.0, 1e6))];
        let mut state = initial_states(&noise, &[DistParams::new(0.0, 1e6)], 1).remove(0);

        let y = DVector::from_element(10, 1.0);
        estimator.fit_voxel(&y, &priors, 0, &mut state).unwrap();

        assert!(state.converged);
        assert_relative_eq!(state.posterior.mean()[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_free_energy_monotone_for_linear_model() {
        // With an exact linear forward model the linearisation is exact and
        // every coordinate update must not lower F.
        let model = LinearModel::new();
        let noise = white_noise();
        let transforms = identity_transforms(2);
        let config = VbConfig {
            max_iterations: 1,
            policy: ConvergencePolicy::MaxIts,
            ..VbConfig::default()
        };

        let priors = vec![
            ParamPrior::new(PriorKind::Normal, DistParams::new(0.0, 1e6)),
            ParamPrior::new(PriorKind::Normal, DistParams::new(0.0, 1e6)),
        ];
        let mut state =
            initial_states(&noise, &[DistParams::new(0.0, 1e6); 2], 1).remove(0);
        let y = DVector::from_iterator(12, (1..=12).map(|t| 2.0 + 0.5 * t as f64));

        let mut previous = f64::NEG_INFINITY;
        for _ in 0..20 {
            let estimator = VbEstimator::new(&model, &noise, &transforms, &config);
            estimator.fit_voxel(&y, &priors, 0, &mut state).unwrap();
            assert!(
                state.free_energy >= previous - 1e-9,
                "free energy decreased: {} -> {}",
                previous,
                state.free_energy
            );
            previous = state.free_energy;
        }
    }

    #[test]
    fn test_failed_voxel_keeps_last_state_and_skips() {
        let model = TrivialModel::new();
        let noise = white_noise();
        let transforms = identity_transforms(1);
        let config = VbConfig::default();
        let estimator = VbEstimator::new(&model, &noise, &transforms, &config);

        let dataset = crate::data::VoxelDataset::new(
            vec![[0, 0, 0]],
            ndarray::Array2::from_shape_vec((3, 1), vec![1.0, 1.0, 1.0]).unwrap(),
        )
        .unwrap();
        let priors = vec![ParamPrior::new(PriorKind::Normal, DistParams::new(0.0, 1e6))];
        let mut states = initial_states(&noise, &[DistParams::new(0.0, 1e6)], 1);
        states[0].failed = Some("earlier failure".to_string());
        let before = states[0].posterior.mean().clone();

        estimator
            .fit_all(&dataset, &priors, &mut states, &CancelToken::new())
            .unwrap();
        assert_eq!(states[0].posterior.mean(), &before);
        assert!(states[0].failed.is_some());
    }

    #[test]
    fn test_cancel_token_aborts_sweep() {
        let model = TrivialModel::new();
        let noise = white_noise();
        let transforms = identity_transforms(1);
        let config = VbConfig::default();
        let estimator = VbEstimator::new(&model, &noise, &transforms, &config);

        let dataset = crate::data::VoxelDataset::new(
            vec![[0, 0, 0]],
            ndarray::Array2::from_shape_vec((2, 1), vec![1.0, 2.0]).unwrap(),
        )
        .unwrap();
        let priors = vec![ParamPrior::new(PriorKind::Normal, DistParams::new(0.0, 1e6))];
        let mut states = initial_states(&noise, &[DistParams::new(0.0, 1e6)], 1);

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = estimator.fit_all(&dataset, &priors, &mut states, &cancel);
        assert!(matches!(result, Err(InferenceError::Cancelled)));
    }
}
