use crate::dist::DistParams;

/// Monotone bijection between the internally-Gaussian "fabber space" and the
/// parameter domain used by a forward model ("model space").
///
/// `DistParams` are mapped with the delta-method approximation: a Gaussian
/// with fabber-space mean m and variance v maps to model-space mean T(m) and
/// variance (T'(m))^2 * v.
pub trait ParamTransform: Send + Sync {
    fn code(&self) -> &'static str;

    /// Model-space value of the fabber-space point x.
    fn to_model(&self, x: f64) -> f64;

    /// Fabber-space value of the model-space point y.
    fn to_fabber(&self, y: f64) -> f64;

    /// dT/dx at the fabber-space point x.
    fn deriv(&self, x: f64) -> f64;

    fn dist_to_model(&self, p: DistParams) -> DistParams {
        let d = self.deriv(p.mean);
        DistParams::new(self.to_model(p.mean), d * d * p.var)
    }

    fn dist_to_fabber(&self, p: DistParams) -> DistParams {
        let mean = self.to_fabber(p.mean);
        let d = self.deriv(mean);
        DistParams::new(mean, p.var / (d * d))
    }
}

pub struct IdentityTransform;

impl ParamTransform for IdentityTransform {
    fn code(&self) -> &'static str {
        "I"
    }

    fn to_model(&self, x: f64) -> f64 {
        x
    }

    fn to_fabber(&self, y: f64) -> f64 {
        y
    }

    fn deriv(&self, _x: f64) -> f64 {
        1.0
    }
}

/// T(x) = exp(x); model-space parameter is strictly positive.
pub struct LogTransform;

impl ParamTransform for LogTransform {
    fn code(&self) -> &'static str {
        "L"
    }

    fn to_model(&self, x: f64) -> f64 {
        x.exp()
    }

    fn to_fabber(&self, y: f64) -> f64 {
        y.ln()
    }

    fn deriv(&self, x: f64) -> f64 {
        x.exp()
    }
}

/// T(x) = ln(1 + exp(x)), inverse ln(exp(y) - 1). Asymptotic branches keep
/// both directions finite for |x| beyond ~30 where exp overflows or the
/// subtraction cancels.
pub struct SoftplusTransform;

const SOFTPLUS_ASYMPTOTE: f64 = 30.0;

impl ParamTransform for SoftplusTransform {
    fn code(&self) -> &'static str {
        "S"
    }

    fn to_model(&self, x: f64) -> f64 {
        if x > SOFTPLUS_ASYMPTOTE {
            x
        } else if x < -SOFTPLUS_ASYMPTOTE {
            x.exp()
        } else {
            x.exp().ln_1p()
        }
    }

    fn to_fabber(&self, y: f64) -> f64 {
        if y > SOFTPLUS_ASYMPTOTE {
            y
        } else {
            y.exp_m1().ln()
        }
    }

    fn deriv(&self, x: f64) -> f64 {
        if x > SOFTPLUS_ASYMPTOTE {
            1.0
        } else if x < -SOFTPLUS_ASYMPTOTE {
            x.exp()
        } else {
            1.0 / (1.0 + (-x).exp())
        }
    }
}

static IDENTITY: IdentityTransform = IdentityTransform;
static LOG: LogTransform = LogTransform;
static SOFTPLUS: SoftplusTransform = SoftplusTransform;

/// Process-wide read-only transform table keyed by code string.
pub fn get_transform(code: &str) -> Option<&'static dyn ParamTransform> {
    match code {
        "I" => Some(&IDENTITY),
        "L" => Some(&LOG),
        "S" => Some(&SOFTPLUS),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_round_trip() {
        let t = get_transform("I").unwrap();
        for &x in &[-5.0, 0.0, 1.0e6] {
            assert_eq!(t.to_fabber(t.to_model(x)), x);
        }
    }

    #[test]
    fn test_log_round_trip() {
        let t = get_transform("L").unwrap();
        for &x in &[-10.0, -0.5, 0.0, 3.0, 10.0] {
            assert_relative_eq!(t.to_fabber(t.to_model(x)), x, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_softplus_round_trip() {
        let t = get_transform("S").unwrap();
        for &x in &[-20.0, -1.0, 0.0, 1.0, 20.0] {
            assert_relative_eq!(t.to_fabber(t.to_model(x)), x, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_softplus_asymptotes_finite() {
        let t = get_transform("S").unwrap();
        assert!(t.to_model(500.0).is_finite());
        assert!(t.to_model(-500.0).is_finite());
        assert_relative_eq!(t.to_model(100.0), 100.0);
        assert_relative_eq!(t.to_fabber(100.0), 100.0);
    }

    #[test]
    fn test_log_dist_delta_method() {
        let t = get_transform("L").unwrap();
        let fab = DistParams::new(0.0, 0.04);
        let model = t.dist_to_model(fab);
        assert_relative_eq!(model.mean, 1.0);
        assert_relative_eq!(model.var, 0.04);

        let back = t.dist_to_fabber(model);
        assert_relative_eq!(back.mean, fab.mean, epsilon = 1e-12);
        assert_relative_eq!(back.var, fab.var, epsilon = 1e-12);
    }

    #[test]
    fn test_unknown_code() {
        assert!(get_transform("X").is_none());
    }
}
