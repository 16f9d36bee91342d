use super::gamma_free_energy_terms;
use nalgebra::DVector;

/// White observation noise: q(phi) = Gamma(c, s) over the precision.
#[derive(Debug, Clone)]
pub struct WhiteNoise {
    prior_shape: f64,
    prior_scale: f64,
}

#[derive(Debug, Clone)]
pub struct WhitePosterior {
    pub c: f64,
    pub s: f64,
}

impl WhiteNoise {
    pub fn new(prior_shape: f64, prior_scale: f64) -> Self {
        Self {
            prior_shape,
            prior_scale,
        }
    }

    pub fn init_posterior(&self) -> WhitePosterior {
        // Posterior starts at the prior; the first update overwrites both.
        WhitePosterior {
            c: self.prior_shape.max(1e-3),
            s: self.prior_scale,
        }
    }

    pub fn update(&self, post: &mut WhitePosterior, residual: &DVector<f64>, model_trace: f64) {
        let n = residual.len() as f64;
        post.s = 1.0 / (0.5 * residual.norm_squared() + 0.5 * model_trace + 1.0 / self.prior_scale);
        post.c = self.prior_shape + 0.5 * n;
    }

    pub fn free_energy(&self, post: &WhitePosterior, residual: &DVector<f64>, model_trace: f64) -> f64 {
        let expected_ssq = residual.norm_squared() + model_trace;
        gamma_free_energy_terms(
            post.c,
            post.s,
            self.prior_shape,
            self.prior_scale,
            residual.len() as f64,
            expected_ssq,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_update_recovers_precision() {
        // Residuals with sample variance ~0.25 should give E[phi] ~ 4.
        let noise = WhiteNoise::new(1e-6, 1e6);
        let mut post = noise.init_posterior();
        let n = 1000;
        let residual = DVector::from_iterator(
            n,
            (0..n).map(|t| if t % 2 == 0 { 0.5 } else { -0.5 }),
        );
        noise.update(&mut post, &residual, 0.0);
        assert_relative_eq!(post.c * post.s, 4.0, epsilon = 0.1);
    }

    #[test]
    fn test_shape_scales_with_timepoints() {
        let noise = WhiteNoise::new(1e-6, 1e6);
        let mut post = noise.init_posterior();
        noise.update(&mut post, &DVector::from_element(10, 0.1), 0.0);
        assert_relative_eq!(post.c, 1e-6 + 5.0);
    }

    #[test]
    fn test_free_energy_finite() {
        let noise = WhiteNoise::new(1e-6, 1e6);
        let mut post = noise.init_posterior();
        let residual = DVector::from_element(10, 0.3);
        noise.update(&mut post, &residual, 0.01);
        assert!(noise.free_energy(&post, &residual, 0.01).is_finite());
    }
}
