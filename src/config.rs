//! Run configuration.

use crate::control::StepControl;
use crate::error::ConfigError;
use crate::registry::StepType;

/// Options of one integration run.
///
/// Fields are public; start from `SolveConfig::default()` and override what
/// you need.
#[derive(Clone, Debug, PartialEq)]
pub struct SolveConfig {
    /// Initial time.
    pub t0: f64,
    /// Final reporting time. May be smaller than `t0`.
    pub t1: f64,
    /// Number of reporting intervals between `t0` and `t1`.
    pub num_steps: usize,
    /// Name of the integration algorithm, see [`StepType`].
    pub step_type: String,
    /// Size of the first trial step.
    pub initial_step: f64,
    pub abs_tol: f64,
    pub rel_tol: f64,
    /// Largest allowed internal step.
    pub max_step: f64,
    /// Smallest allowed internal step.
    pub min_step: f64,
    /// Limit on internal steps per reporting interval.
    pub max_sub_steps: Option<usize>,
    /// Whether host callback results are checked on every call, or only until
    /// the first successful Jacobian evaluation.
    pub validate_every_call: bool,
}

impl Default for SolveConfig {
    fn default() -> SolveConfig {
        SolveConfig {
            t0: 0.,
            t1: 1.,
            num_steps: 1,
            step_type: "rkf45".to_owned(),
            initial_step: 1e-6,
            abs_tol: 1e-6,
            rel_tol: 0.,
            max_step: f64::INFINITY,
            min_step: 0.,
            max_sub_steps: None,
            validate_every_call: true,
        }
    }
}

/// A checked configuration, ready for the driver.
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    pub step_type: StepType,
    pub control: StepControl,
    /// Distance between reporting times, signed.
    pub t_step: f64,
}

impl SolveConfig {
    /// Checks the configuration against a state of `num_y` elements and
    /// returns what a run needs from it.
    ///
    /// The step type is resolved first, so an unknown name is reported even
    /// if other fields are invalid too.
    pub fn validate(&self, num_y: usize, initial_state: &[f64]) -> Result<Plan, ConfigError> {
        let step_type = StepType::resolve(&self.step_type)?;

        if num_y == 0 {
            return Err(ConfigError::EmptyState);
        }
        if initial_state.len() != num_y {
            return Err(ConfigError::StateLength {
                expected: num_y,
                actual: initial_state.len(),
            });
        }
        if initial_state.iter().any(|y| !y.is_finite()) {
            return Err(ConfigError::NotFinite("initial_state"));
        }
        if self.num_steps == 0 {
            return Err(ConfigError::NoSteps);
        }
        for &(name, value) in &[
            ("t0", self.t0),
            ("t1", self.t1),
            ("initial_step", self.initial_step),
            ("abs_tol", self.abs_tol),
            ("rel_tol", self.rel_tol),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NotFinite(name));
            }
        }
        if self.t1 == self.t0 {
            return Err(ConfigError::EmptyInterval);
        }
        if self.initial_step <= 0. {
            return Err(ConfigError::InitialStepNotPositive);
        }
        if !(self.max_step > 0.) {
            return Err(ConfigError::MaxStepNotPositive);
        }
        if !(self.min_step >= 0. && self.min_step <= self.max_step) {
            return Err(ConfigError::InvalidMinStep);
        }
        if self.abs_tol < 0. || self.rel_tol < 0. {
            return Err(ConfigError::NegativeTolerance);
        }
        if self.abs_tol == 0. && self.rel_tol == 0. {
            return Err(ConfigError::ZeroTolerance);
        }
        if self.max_sub_steps == Some(0) {
            return Err(ConfigError::ZeroSubStepLimit);
        }

        Ok(Plan {
            step_type,
            control: StepControl {
                initial_step: self.initial_step,
                max_step: self.max_step,
                min_step: self.min_step,
                abs_tol: self.abs_tol,
                rel_tol: self.rel_tol,
            },
            t_step: (self.t1 - self.t0) / self.num_steps as f64,
        })
    }
}
