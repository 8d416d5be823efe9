//! Step-size control shared by every stepper.

use ndarray::prelude::*;
use ndarray::{FoldWhile, Zip};

use crate::error::StepError;
use crate::system::OdeSystem;

/// Multiply steps computed from asymptotic behaviour of errors by this.
pub(crate) const SAFETY: f64 = 0.9;
/// Minimum allowed decrease in a step size.
pub(crate) const MIN_FACTOR: f64 = 0.2;
/// Maximum allowed increase in a step size.
pub(crate) const MAX_FACTOR: f64 = 10.;

/// Tolerances and step-size limits for an adaptive stepper.
///
/// The steppers keep the local error estimates less than
/// `abs_tol + rel_tol * abs(y)`. Here `rel_tol` controls a relative accuracy
/// (number of correct digits). But if a component of `y` is approximately
/// below `abs_tol` then the error only needs to fall within the same
/// `abs_tol` threshold, and the number of correct digits is not guaranteed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepControl {
    /// Size of the first attempted step.
    pub initial_step: f64,
    /// Maximum allowed step size. May be INFINITY.
    pub max_step: f64,
    /// Smallest step the stepper may take before giving up.
    pub min_step: f64,
    /// Absolute tolerance.
    pub abs_tol: f64,
    /// Relative tolerance.
    pub rel_tol: f64,
}

impl Default for StepControl {
    fn default() -> StepControl {
        StepControl {
            initial_step: 1e-6,
            max_step: f64::INFINITY,
            min_step: 0.,
            abs_tol: 1e-6,
            rel_tol: 0.,
        }
    }
}

impl StepControl {
    /// Error weights `abs_tol + rel_tol * max(|y|, |y_new|)`.
    pub(crate) fn scale(&self, y: ArrayView1<'_, f64>, y_new: ArrayView1<'_, f64>) -> Array1<f64> {
        let mut scale = Array1::zeros(y.len());
        azip!((scale in &mut scale, &y in &y, &y_new in &y_new) {
            *scale = self.abs_tol + y.abs().max(y_new.abs()) * self.rel_tol;
        });
        scale
    }

    /// Smallest step allowed at time `t`.
    pub(crate) fn min_step_at(&self, t: f64, direction: f64) -> f64 {
        let ulp = (next_after(t, direction * f64::INFINITY) - t).abs();
        self.min_step.max(10. * ulp)
    }

    /// Convergence tolerance for Newton iterations on scaled increments.
    pub(crate) fn newton_tol(&self) -> f64 {
        let rtol = self.rel_tol.max(100. * f64::EPSILON);
        (10. * f64::EPSILON / rtol).max(0.03_f64.min(rtol.sqrt()))
    }

    /// First step size to attempt, limited by `max_step`.
    pub(crate) fn first_step(&self) -> f64 {
        self.initial_step.min(self.max_step)
    }
}

/// Growth factor after an accepted step with error norm `err`.
pub(crate) fn grow_factor(err: f64, order: usize) -> f64 {
    if err == 0. {
        MAX_FACTOR
    } else {
        MAX_FACTOR.min((SAFETY * err.powf(-1. / (order as f64 + 1.))).max(1.))
    }
}

/// Reduction factor after a rejected step with error norm `err`.
pub(crate) fn shrink_factor(err: f64, order: usize) -> f64 {
    if err.is_finite() {
        MIN_FACTOR.max(SAFETY * err.powf(-1. / (order as f64 + 1.)))
    } else {
        MIN_FACTOR
    }
}

/// Computes RMS norm of scaled values.
pub(crate) fn norm(x: ArrayView1<'_, f64>, scale: ArrayView1<'_, f64>) -> f64 {
    debug_assert_eq!(x.len(), scale.len());
    (Zip::from(x)
        .and(scale)
        .fold_while(0., |acc, &x, &scale| {
            let scaled = x / scale;
            FoldWhile::Continue(acc + scaled * scaled)
        })
        .into_inner()
        / x.len() as f64)
        .sqrt()
}

/// Computes the next representable floating-point value following `x` in the
/// direction of `y`.
///
/// Special cases:
///
/// * If `x` equals `y`, then `y` is returned.
/// * If `x` or `y` is NAN, a NAN is returned.
///
/// There is no special handling for overflow of finite values to ±∞ or
/// subnormals.
pub(crate) fn next_after(x: f64, y: f64) -> f64 {
    if x.is_nan() || y.is_nan() {
        f64::NAN
    } else if x == y {
        y
    } else if x == 0. {
        if y < 0. {
            -f64::from_bits(1)
        } else {
            f64::from_bits(1)
        }
    } else if (y > x) == (x > 0.) {
        f64::from_bits(x.to_bits().wrapping_add(1))
    } else {
        f64::from_bits(x.to_bits().wrapping_sub(1))
    }
}

/// Time reached by a step of `h_abs` from `t` toward `t_bound`, landing on
/// the bound exactly when the step would reach or pass it.
pub(crate) fn step_target(t: f64, h_abs: f64, t_bound: f64, direction: f64) -> f64 {
    if h_abs >= (t_bound - t).abs() {
        t_bound
    } else {
        t + h_abs * direction
    }
}

/// Counters describing the work done by a stepper.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub derivative_evals: usize,
    pub jacobian_evals: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
}

/// A system together with the stepper's evaluation counters.
pub(crate) struct Rhs<S> {
    system: S,
    pub(crate) stats: Stats,
}

impl<S: OdeSystem> Rhs<S> {
    pub(crate) fn new(system: S) -> Self {
        Rhs {
            system,
            stats: Stats::default(),
        }
    }

    pub(crate) fn dimension(&self) -> usize {
        self.system.dimension()
    }

    /// Evaluates `f(t, y)` into `out`.
    pub(crate) fn derivative(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        out: ArrayViewMut1<'_, f64>,
    ) -> Result<(), StepError> {
        self.stats.derivative_evals += 1;
        self.system.derivative(t, y, out).map_err(|e| e.at(t))
    }

    /// Evaluates `f(t, y)` into a new array.
    pub(crate) fn derivative_owned(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
    ) -> Result<Array1<f64>, StepError> {
        let mut out = Array1::zeros(y.len());
        self.derivative(t, y, out.view_mut())?;
        Ok(out)
    }

    /// Evaluates the Jacobian `(dfdy, dfdt)` at `(t, y)`.
    pub(crate) fn jacobian(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
    ) -> Result<(Array2<f64>, Array1<f64>), StepError> {
        let n = y.len();
        let mut dfdy = Array2::zeros((n, n));
        let mut dfdt = Array1::zeros(n);
        self.stats.jacobian_evals += 1;
        self.system
            .jacobian(t, y, dfdy.view_mut(), dfdt.view_mut())
            .map_err(|e| e.at(t))?;
        Ok((dfdy, dfdt))
    }
}
