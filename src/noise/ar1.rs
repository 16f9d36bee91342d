use super::gamma_free_energy_terms;
use log::warn;
use nalgebra::DVector;

const ALPHA_CLAMP: f64 = 0.999;

/// AR(1) observation noise: the residual carries a first-order
/// autoregression e_t = alpha * e_{t-1} + eta_t with white innovations, so
/// q(phi) is updated on the residual whitened by (1 - alpha L).
#[derive(Debug, Clone)]
pub struct Ar1Noise {
    prior_shape: f64,
    prior_scale: f64,
    alpha_prior_var: f64,
}

#[derive(Debug, Clone)]
pub struct Ar1Posterior {
    pub c: f64,
    pub s: f64,
    pub alpha_mean: f64,
    pub alpha_var: f64,
}

impl Ar1Noise {
    pub fn new(prior_shape: f64, prior_scale: f64, alpha_prior_var: f64) -> Self {
        Self {
            prior_shape,
            prior_scale,
            alpha_prior_var,
        }
    }

    pub fn init_posterior(&self) -> Ar1Posterior {
        Ar1Posterior {
            c: self.prior_shape.max(1e-3),
            s: self.prior_scale,
            alpha_mean: 0.0,
            alpha_var: self.alpha_prior_var,
        }
    }

    /// Lag statistics of the residual: (sum r_{t-1}^2, sum r_t r_{t-1}).
    fn lag_stats(residual: &DVector<f64>) -> (f64, f64) {
        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for t in 1..residual.len() {
            sxx += residual[t - 1] * residual[t - 1];
            sxy += residual[t] * residual[t - 1];
        }
        (sxx, sxy)
    }

    pub fn update(&self, post: &mut Ar1Posterior, residual: &DVector<f64>, model_trace: f64) {
        let n = residual.len();
        if n < 2 {
            return;
        }
        let (sxx, sxy) = Self::lag_stats(residual);

        // Conditional Gaussian update of alpha at the current E[phi].
        let e_phi = post.c * post.s;
        let alpha_prec = e_phi * sxx + 1.0 / self.alpha_prior_var;
        let mut alpha = e_phi * sxy / alpha_prec;
        if alpha.abs() >= ALPHA_CLAMP {
            warn!(
                "AR(1) coefficient update diverged (alpha = {:.4}), clamping to ±{}",
                alpha, ALPHA_CLAMP
            );
            alpha = alpha.clamp(-ALPHA_CLAMP, ALPHA_CLAMP);
        }
        post.alpha_mean = alpha;
        post.alpha_var = 1.0 / alpha_prec;

        // Gamma update on the whitened residual.
        let wssq = Self::whitened_ssq(post, residual);
        post.s = 1.0 / (0.5 * (wssq + model_trace) + 1.0 / self.prior_scale);
        post.c = self.prior_shape + 0.5 * (n - 1) as f64;
    }

    /// E[|| (1 - alpha L) r ||^2] under q(alpha).
    fn whitened_ssq(post: &Ar1Posterior, residual: &DVector<f64>) -> f64 {
        let (sxx, _) = Self::lag_stats(residual);
        let mut ssq = 0.0;
        for t in 1..residual.len() {
            let w = residual[t] - post.alpha_mean * residual[t - 1];
            ssq += w * w;
        }
        ssq + post.alpha_var * sxx
    }

    pub fn free_energy(&self, post: &Ar1Posterior, residual: &DVector<f64>, model_trace: f64) -> f64 {
        let n_effective = (residual.len().saturating_sub(1)) as f64;
        let expected_ssq = Self::whitened_ssq(post, residual) + model_trace;
        let gamma_terms = gamma_free_energy_terms(
            post.c,
            post.s,
            self.prior_shape,
            self.prior_scale,
            n_effective,
            expected_ssq,
        );
        // E[log p(alpha)] - E[log q(alpha)] = -KL(q(alpha) || p(alpha))
        let va0 = self.alpha_prior_var;
        let alpha_terms = 0.5
            * (1.0 + (post.alpha_var / va0).ln()
                - (post.alpha_var + post.alpha_mean * post.alpha_mean) / va0);
        gamma_terms + alpha_terms
    }
}
