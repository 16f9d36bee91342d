use super::VbConfig;
use crate::options::OptionsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergencePolicy {
    /// Run to the iteration cap.
    MaxIts,
    /// Stop when |dF| drops below tolerance.
    FChange,
    /// FChange with bounded revert-and-retry on free-energy decreases.
    TrialMode,
    /// TrialMode with Levenberg-style damping fed back into the update.
    Lm,
}

impl ConvergencePolicy {
    pub fn from_name(name: &str) -> Result<Self, OptionsError> {
        match name {
            "maxits" => Ok(ConvergencePolicy::MaxIts),
            "fchange" => Ok(ConvergencePolicy::FChange),
            "trialmode" => Ok(ConvergencePolicy::TrialMode),
            "lm" => Ok(ConvergencePolicy::Lm),
            _ => Err(OptionsError::InvalidValue {
                key: "convergence".to_string(),
                value: name.to_string(),
                expected: "maxits, fchange, trialmode or lm",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Continue,
    Converged,
    /// The step lowered F; the caller should damp toward the previous mean
    /// and retry.
    Reverted,
    /// Retries exhausted; the caller should fall back to the best state seen.
    Diverged,
}

const LM_LAMBDA_INIT: f64 = 1e-4;
const LM_LAMBDA_MAX: f64 = 1e10;
const LM_LAMBDA_FLOOR: f64 = 1e-8;

/// Stateful per-voxel termination monitor. `check` is called once per inner
/// iteration with the freshly computed free energy.
#[derive(Debug, Clone)]
pub struct ConvergenceDetector {
    policy: ConvergencePolicy,
    max_iterations: usize,
    tolerance: f64,
    max_trials: usize,
    iterations: usize,
    trials: usize,
    last_accepted: Option<f64>,
    lm_lambda: f64,
}

impl ConvergenceDetector {
    pub fn new(
        policy: ConvergencePolicy,
        max_iterations: usize,
        tolerance: f64,
        max_trials: usize,
    ) -> Self {
        Self {
            policy,
            max_iterations,
            tolerance,
            max_trials,
            iterations: 0,
            trials: 0,
            last_accepted: None,
            lm_lambda: 0.0,
        }
    }

    pub fn from_config(config: &VbConfig) -> Self {
        Self::new(
            config.policy,
            config.max_iterations,
            config.f_change_tolerance,
            config.max_trials,
        )
    }

    pub fn reset(&mut self) {
        self.iterations = 0;
        self.trials = 0;
        self.last_accepted = None;
        self.lm_lambda = 0.0;
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Current Levenberg damping, added to the precision-update diagonal.
    /// Zero unless the lm policy has reverted recently.
    pub fn lambda(&self) -> f64 {
        self.lm_lambda
    }

    pub fn check(&mut self, f: f64) -> ConvergenceStatus {
        self.iterations += 1;

        if !f.is_finite() {
            return ConvergenceStatus::Diverged;
        }

        let status = match self.policy {
            ConvergencePolicy::MaxIts => ConvergenceStatus::Continue,
            ConvergencePolicy::FChange => match self.last_accepted {
                Some(prev) if (f - prev).abs() < self.tolerance => ConvergenceStatus::Converged,
                _ => {
                    self.last_accepted = Some(f);
                    ConvergenceStatus::Continue
                }
            },
            ConvergencePolicy::TrialMode | ConvergencePolicy::Lm => {
                match self.last_accepted {
                    Some(prev) if f < prev - self.tolerance => {
                        self.trials += 1;
                        if self.trials > self.max_trials {
                            return ConvergenceStatus::Diverged;
                        }
                        if self.policy == ConvergencePolicy::Lm {
                            self.lm_lambda =
                                (self.lm_lambda * 10.0).max(LM_LAMBDA_INIT).min(LM_LAMBDA_MAX);
                        }
                        // last_accepted is kept: the retry is judged against
                        // the same reference point.
                        ConvergenceStatus::Reverted
                    }
                    Some(prev) if (f - prev).abs() < self.tolerance => {
                        ConvergenceStatus::Converged
                    }
                    _ => {
                        self.trials = 0;
                        if self.policy == ConvergencePolicy::Lm {
                            self.lm_lambda /= 10.0;
                            if self.lm_lambda < LM_LAMBDA_FLOOR {
                                self.lm_lambda = 0.0;
                            }
                        }
                        self.last_accepted = Some(f);
                        ConvergenceStatus::Continue
                    }
                }
            }
        };

        if status == ConvergenceStatus::Continue && self.iterations >= self.max_iterations {
            return ConvergenceStatus::Converged;
        }
        status
    }
}
