use super::cache::{CovarianceCache, DistanceMatrix, SpatialStats, DELTA_MAX, DELTA_MIN};
use super::vb::{VbEstimator, VoxelState};
use super::{CancelToken, InferenceError, SpatialConfig};
use crate::data::{NeighbourGraph, VoxelDataset};
use crate::models::ForwardModel;
use crate::noise::NoiseModel;
use crate::priors::{ParamPrior, PriorKind};
use crate::transforms::ParamTransform;
use log::{debug, info};
use nalgebra::DVector;

/// Outer control loop of Spatial VB: sweep all voxels, re-estimate each
/// spatial prior's (rho, delta) from cross-voxel statistics, rewrite the
/// per-voxel spatial priors and repeat until the aggregate free energy
/// settles.
pub struct SpatialVbEstimator<'a> {
    model: &'a dyn ForwardModel,
    noise: &'a NoiseModel,
    transforms: &'a [&'static dyn ParamTransform],
    config: &'a SpatialConfig,
}

/// Per-parameter cross-voxel statistics feeding the hyper-parameter update.
struct ParamFieldStats {
    /// Posterior means across voxels.
    means: DVector<f64>,
    /// Posterior marginal variances across voxels.
    vars: DVector<f64>,
}

impl<'a> SpatialVbEstimator<'a> {
    pub fn new(
        model: &'a dyn ForwardModel,
        noise: &'a NoiseModel,
        transforms: &'a [&'static dyn ParamTransform],
        config: &'a SpatialConfig,
    ) -> Self {
        Self {
            model,
            noise,
            transforms,
            config,
        }
    }

    /// Run the outer loop to convergence; returns the number of outer
    /// iterations performed.
    pub fn fit(
        &self,
        dataset: &VoxelDataset,
        priors: &mut [ParamPrior],
        states: &mut [VoxelState],
        cancel: &CancelToken,
    ) -> Result<usize, InferenceError> {
        let graph = NeighbourGraph::build(dataset.coords(), self.config.spatial_dims)?;
        let any_spatial = priors.iter().any(|p| p.kind.is_spatial());
        let mut cache = if any_spatial && self.config.spatial_dims > 0 && dataset.n_voxels() > 1 {
            let dist = DistanceMatrix::build(dataset.coords(), self.config.distance_measure);
            Some(CovarianceCache::new(dist, &graph))
        } else {
            None
        };

        self.seed_hyperparameters(priors);

        let inner = VbEstimator::new(self.model, self.noise, self.transforms, &self.config.vb);

        let mut previous_f: Option<f64> = None;
        let mut last_stable = f64::NEG_INFINITY;
        let mut decreasing_steps = 0;

        for outer in 0..self.config.max_outer_iterations {
            if cancel.is_cancelled() {
                return Err(InferenceError::Cancelled);
            }

            // Snapshot the spatial prior state from the current posteriors,
            // then sweep; voxels are independent inside the sweep.
            let fields = Self::field_stats(self.model.n_params(), states)?;
            self.refresh_spatial_priors(priors, &fields, &graph, cache.as_mut())?;
            inner.fit_all(dataset, priors, states, cancel)?;

            if outer > 0 || self.config.update_first_iter {
                let fields = Self::field_stats(self.model.n_params(), states)?;
                self.update_hyperparameters(priors, &fields, cache.as_mut())?;
            }

            let f = aggregate_free_energy(states);
            info!(
                "spatial iteration {}: aggregate free energy {:.4}",
                outer + 1,
                f
            );

            if let Some(prev) = previous_f {
                if (f - prev).abs() < self.config.outer_tolerance {
                    info!("spatial loop converged after {} iterations", outer + 1);
                    return Ok(outer + 1);
                }
                if f < prev {
                    decreasing_steps += 1;
                    if decreasing_steps > self.config.vb.max_trials {
                        return Err(InferenceError::Diverged(last_stable));
                    }
                } else {
                    decreasing_steps = 0;
                    last_stable = f;
                }
            } else {
                last_stable = f;
            }
            previous_f = Some(f);
        }

        Ok(self.config.max_outer_iterations)
    }

    fn seed_hyperparameters(&self, priors: &mut [ParamPrior]) {
        for prior in priors.iter_mut().filter(|p| p.kind.is_spatial()) {
            prior.delta = if self.config.fixed_delta > 0.0 {
                self.config.fixed_delta
            } else {
                1.0
            };
            prior.rho = if self.config.fixed_rho > 0.0 {
                self.config.fixed_rho
            } else {
                1.0
            };
        }
    }

    /// Posterior mean and marginal variance of every parameter across the
    /// volume, in one pass over the states.
    fn field_stats(
        n_params: usize,
        states: &mut [VoxelState],
    ) -> Result<Vec<ParamFieldStats>, InferenceError> {
        let n_voxels = states.len();
        let mut fields: Vec<ParamFieldStats> = (0..n_params)
            .map(|_| ParamFieldStats {
                means: DVector::zeros(n_voxels),
                vars: DVector::zeros(n_voxels),
            })
            .collect();
        for (v, state) in states.iter_mut().enumerate() {
            let mean = state.posterior.mean().clone();
            let cov_diag = state.posterior.covariance()?.diagonal();
            for i in 0..n_params {
                fields[i].means[v] = mean[i];
                fields[i].vars[v] = cov_diag[i];
            }
        }
        Ok(fields)
    }

    /// Rewrite each spatial prior's derived per-voxel state (the priors the
    /// next sweep will consume) from the posterior fields.
    fn refresh_spatial_priors(
        &self,
        priors: &mut [ParamPrior],
        fields: &[ParamFieldStats],
        graph: &NeighbourGraph,
        mut cache: Option<&mut CovarianceCache>,
    ) -> Result<(), InferenceError> {
        for (i, prior) in priors.iter_mut().enumerate() {
            if !prior.kind.is_spatial() {
                continue;
            }
            if prior.kind.uses_kernel() {
                let restricted = prior.kind == PriorKind::SpatialPFirstOrder;
                if let Some(cache) = cache.as_mut() {
                    let kinv = cache.cinv(prior.delta, restricted)?.clone();
                    prior.update_spatial_kernel(&fields[i].means, &kinv);
                } else {
                    // No kernel available (single voxel or spatial-dims=0):
                    // degrade to the neighbourhood form, which is empty there.
                    prior.update_spatial_mrf(&fields[i].means, graph);
                }
            } else {
                prior.update_spatial_mrf(&fields[i].means, graph);
            }
        }
        Ok(())
    }

    /// Statistics for the evidence surface of parameter `i`. Kernel priors
    /// strip their own prior contribution from the posterior marginal first
    /// ("posterior without its prior"); neighbourhood priors use the
    /// posterior moments directly.
    fn evidence_stats(prior: &ParamPrior, field: &ParamFieldStats, voxel_count: usize) -> ParamFieldStats {
        if !prior.kind.uses_kernel() {
            return ParamFieldStats {
                means: field.means.clone(),
                vars: field.vars.clone(),
            };
        }
        let mut means = DVector::zeros(voxel_count);
        let mut vars = DVector::zeros(voxel_count);
        for v in 0..voxel_count {
            let post_prec = 1.0 / field.vars[v].max(1e-300);
            let (prior_mean, prior_prec) = prior.effective(v, field.means[v], field.vars[v]);
            let data_prec = (post_prec - prior_prec).max(1e-10);
            means[v] = (post_prec * field.means[v] - prior_prec * prior_mean) / data_prec;
            vars[v] = 1.0 / data_prec;
        }
        ParamFieldStats { means, vars }
    }

    fn update_hyperparameters(
        &self,
        priors: &mut [ParamPrior],
        fields: &[ParamFieldStats],
        mut cache: Option<&mut CovarianceCache>,
    ) -> Result<(), InferenceError> {
        let cache = match cache.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };
        let n_voxels = fields.first().map(|f| f.means.len()).unwrap_or(0);

        if self.config.use_sim_evidence {
            self.update_kernel_priors_jointly(priors, fields, cache, n_voxels)?;
        }

        for (i, prior) in priors.iter_mut().enumerate() {
            if !prior.kind.is_spatial() {
                continue;
            }
            if self.config.use_sim_evidence && prior.kind.uses_kernel() {
                continue; // already handled jointly
            }
            let stats_field = Self::evidence_stats(prior, &fields[i], n_voxels);
            let stats = SpatialStats {
                means: &stats_field.means,
                c_diag: &stats_field.vars,
            };
            let restricted = prior.kind == PriorKind::SpatialPFirstOrder;

            let (new_delta, new_rho) = if self.config.fixed_delta > 0.0 {
                let (_, rho) = cache.log_evidence(self.config.fixed_delta, &stats, restricted)?;
                (self.config.fixed_delta, rho)
            } else if prior.kind.uses_kernel() {
                cache.optimize_evidence(
                    &stats,
                    prior.delta,
                    self.config.new_delta_evaluations,
                    self.config.brute_force_delta_search,
                    restricted,
                )?
            } else {
                cache.optimize_smoothing_scale(&stats, restricted)?
            };

            prior.delta = new_delta.clamp(DELTA_MIN, DELTA_MAX);
            prior.rho = self.apply_rho_update(prior.rho, new_rho);
            debug!(
                "spatial prior {} ({}): delta={:.4} rho={:.4}",
                i,
                prior.kind.code(),
                prior.delta,
                prior.rho
            );
        }
        Ok(())
    }

    /// Joint update for all kernel (P/p) priors: one shared delta maximising
    /// the summed log evidence, each parameter keeping its own analytic rho.
    fn update_kernel_priors_jointly(
        &self,
        priors: &mut [ParamPrior],
        fields: &[ParamFieldStats],
        cache: &mut CovarianceCache,
        n_voxels: usize,
    ) -> Result<(), InferenceError> {
        let kernel_params: Vec<usize> = priors
            .iter()
            .enumerate()
            .filter(|(_, p)| p.kind.uses_kernel())
            .map(|(i, _)| i)
            .collect();
        if kernel_params.is_empty() {
            return Ok(());
        }

        let stats_fields: Vec<(usize, ParamFieldStats, bool)> = kernel_params
            .iter()
            .map(|&i| {
                let restricted = priors[i].kind == PriorKind::SpatialPFirstOrder;
                (i, Self::evidence_stats(&priors[i], &fields[i], n_voxels), restricted)
            })
            .collect();

        let delta = if self.config.fixed_delta > 0.0 {
            self.config.fixed_delta
        } else {
            // Grid scan on the joint objective; per-parameter secant steps
            // would fight over the shared delta.
            let n_points = 20;
            let lo = DELTA_MIN.ln();
            let hi = DELTA_MAX.ln();
            let mut best = (f64::NEG_INFINITY, 1.0);
            for step in 0..n_points {
                let candidate = (lo + (hi - lo) * step as f64 / (n_points - 1) as f64).exp();
                let mut total = 0.0;
                for (_, field, restricted) in &stats_fields {
                    let stats = SpatialStats {
                        means: &field.means,
                        c_diag: &field.vars,
                    };
                    let (log_e, _) = cache.log_evidence(candidate, &stats, *restricted)?;
                    total += log_e;
                }
                if total > best.0 {
                    best = (total, candidate);
                }
            }
            best.1
        };

        for (i, field, restricted) in &stats_fields {
            let stats = SpatialStats {
                means: &field.means,
                c_diag: &field.vars,
            };
            let (_, rho) = cache.log_evidence(delta, &stats, *restricted)?;
            let prior = &mut priors[*i];
            prior.delta = delta;
            prior.rho = self.apply_rho_update(prior.rho, rho);
        }
        Ok(())
    }

    /// Enforce fixed-rho and the spatial-speed cap on the per-step change.
    fn apply_rho_update(&self, old_rho: f64, new_rho: f64) -> f64 {
        if self.config.fixed_rho > 0.0 {
            return self.config.fixed_rho;
        }
        let speed = self.config.spatial_speed;
        if speed >= 1.0 && old_rho > 0.0 {
            new_rho.clamp(old_rho / speed, old_rho * speed)
        } else {
            new_rho
        }
    }
}

fn aggregate_free_energy(states: &[VoxelState]) -> f64 {
    states
        .iter()
        .filter(|s| s.failed.is_none())
        .map(|s| s.free_energy)
        .sum()
}
