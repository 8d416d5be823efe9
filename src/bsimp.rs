//! Semi-implicit extrapolation stepper (Bader–Deuflhard).
//!
//! Each step integrates the interval with the semi-implicit midpoint rule for
//! a sequence of substep counts and extrapolates the results to zero substep
//! size. The number of extrapolation rows is adapted from step to step by
//! comparing the work per unit step of neighbouring orders.
//!
//! The implementation follows:
//! * G. Bader, P. Deuflhard, "A semi-implicit mid-point rule for stiff systems
//!   of ordinary differential equations", Numer. Math. 41, pp. 373-398, 1983.
//! * Press, William H. Numerical Recipes 3rd Edition: The Art of Scientific
//!   Computing. Cambridge University Press, 2007. Ch. 17.5.2.

use ndarray::prelude::*;

use crate::control::{grow_factor, norm, shrink_factor, step_target, Rhs, Stats, StepControl};
use crate::error::StepError;
use crate::newton::NewtonMatrix;
use crate::system::OdeSystem;
use crate::OdeIntegrate;

/// Substep counts for consecutive extrapolation rows.
const SEQUENCE: [usize; 6] = [2, 6, 10, 14, 22, 34];

/// Largest target row index; one more row is always computed.
const MAX_TARGET: usize = SEQUENCE.len() - 2;

/// Derivative evaluations needed to build rows `0..=k`.
fn work(k: usize) -> f64 {
    SEQUENCE[..=k].iter().sum::<usize>() as f64
}

/// Semi-implicit Bulirsch–Stoer stepper.
pub struct Bsimp<S: OdeSystem> {
    rhs: Rhs<S>,
    t: f64,
    y: Array1<f64>,
    f: Array1<f64>,
    t_bound: f64,
    direction: f64,
    h_abs: f64,
    control: StepControl,
    /// Row whose error estimate decides acceptance.
    target: usize,
    /// `(dfdy, dfdt)` at `(t, y)`, kept across rejected attempts.
    jac: Option<(Array2<f64>, Array1<f64>)>,
}

impl<S: OdeSystem> Bsimp<S> {
    pub fn new(
        system: S,
        t0: f64,
        y0: Array1<f64>,
        t_bound: f64,
        control: StepControl,
    ) -> Result<Bsimp<S>, StepError> {
        let mut rhs = Rhs::new(system);
        debug_assert_eq!(rhs.dimension(), y0.len());
        let f = rhs.derivative_owned(t0, y0.view())?;
        Ok(Bsimp {
            rhs,
            t: t0,
            y: y0,
            f,
            t_bound,
            direction: if t_bound < t0 { -1. } else { 1. },
            h_abs: control.first_step(),
            control,
            target: 2,
            jac: None,
        })
    }

    /// Current target row of the extrapolation tableau.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Builds the extrapolation tableau for a step of size `h` and returns
    /// the extrapolated state together with the scaled error of every row
    /// after the first.
    ///
    /// Returns `None` if one of the linear systems is singular.
    fn extrapolate(
        &mut self,
        h: f64,
        dfdy: ArrayView2<'_, f64>,
        dfdt: ArrayView1<'_, f64>,
    ) -> Result<Option<(Array1<f64>, Vec<f64>)>, StepError> {
        let mut tableau: Vec<Vec<Array1<f64>>> = Vec::with_capacity(self.target + 2);
        let mut errors = Vec::with_capacity(self.target + 1);
        for k in 0..=self.target + 1 {
            let nk = SEQUENCE[k];
            let y_k = match semi_implicit_midpoint(
                &mut self.rhs,
                self.t,
                self.y.view(),
                self.f.view(),
                dfdy,
                dfdt,
                h,
                nk,
            )? {
                Some(y_k) => y_k,
                None => return Ok(None),
            };

            let mut row = Vec::with_capacity(k + 1);
            row.push(y_k);
            for j in 0..k {
                let ratio = (nk as f64 / SEQUENCE[k - j - 1] as f64).powi(2) - 1.;
                let next = &row[j] + &((&row[j] - &tableau[k - 1][j]) / ratio);
                row.push(next);
            }
            if k > 0 {
                let (best, alt) = (&row[k], &row[k - 1]);
                let scale = self.control.scale(alt.view(), best.view());
                errors.push(norm((best - alt).view(), scale.view()));
            }
            tableau.push(row);
        }

        let y_new = tableau
            .pop()
            .and_then(|mut row| row.pop())
            .unwrap_or_else(|| self.y.clone());
        Ok(Some((y_new, errors)))
    }

    /// Picks the next step size and target row after an accepted step,
    /// preferring the order with the least work per unit step.
    fn adapt(&mut self, h_abs: f64, errors: &[f64]) -> f64 {
        let target = self.target;
        let factor = grow_factor(errors[target], 2 * target);
        if target == 0 {
            return h_abs * factor;
        }
        let factor_lower = grow_factor(errors[target - 1], 2 * (target - 1));
        let work_per_step = work(target + 1) / factor;
        let work_per_step_lower = work(target) / factor_lower;
        if work_per_step_lower < 0.8 * work_per_step && target > 1 {
            self.target -= 1;
            h_abs * factor_lower
        } else if work_per_step < 0.9 * work_per_step_lower && target < MAX_TARGET {
            self.target += 1;
            h_abs * factor * work(target + 2) / work(target + 1)
        } else {
            h_abs * factor
        }
    }
}

/// Integrates from `(t, y)` over `h_total` with `n` substeps of the
/// semi-implicit midpoint rule, linearized with `dfdy` and `dfdt` at the start.
///
/// Returns `None` if `I - h dfdy` is singular.
#[allow(clippy::too_many_arguments)]
fn semi_implicit_midpoint<S: OdeSystem>(
    rhs: &mut Rhs<S>,
    t: f64,
    y: ArrayView1<'_, f64>,
    f0: ArrayView1<'_, f64>,
    dfdy: ArrayView2<'_, f64>,
    dfdt: ArrayView1<'_, f64>,
    h_total: f64,
    n: usize,
) -> Result<Option<Array1<f64>>, StepError> {
    let h = h_total / n as f64;
    let mut a = Array2::eye(y.len());
    a.scaled_add(-h, &dfdy);
    let lu = match NewtonMatrix::factor(a.view()) {
        Some(lu) => lu,
        None => return Ok(None),
    };

    let mut del = match lu.solve((h * (&f0 + &(h * &dfdt))).view()) {
        Some(del) => del,
        None => return Ok(None),
    };
    let mut y_temp = &y + &del;
    let mut f = rhs.derivative_owned(t + h, y_temp.view())?;
    for i in 1..n {
        let step = match lu.solve((h * &f - &del).view()) {
            Some(step) => step,
            None => return Ok(None),
        };
        del.scaled_add(2., &step);
        y_temp += &del;
        rhs.derivative(t + (i + 1) as f64 * h, y_temp.view(), f.view_mut())?;
    }
    Ok(lu.solve((h * &f - &del).view()).map(|last| y_temp + &last))
}

impl<S: OdeSystem> OdeIntegrate for Bsimp<S> {
    fn len(&self) -> usize {
        self.y.len()
    }

    fn step(&mut self) -> Result<(), StepError> {
        let min_step = self.control.min_step_at(self.t, self.direction);
        let mut h_abs = self.h_abs.min(self.control.max_step).max(min_step);

        loop {
            if h_abs < min_step {
                return Err(StepError::TooSmallStep {
                    required: h_abs,
                    allowable: min_step,
                });
            }
            let h_unclamped = h_abs;
            let t_new = step_target(self.t, h_abs, self.t_bound, self.direction);
            let clamped = t_new == self.t_bound;
            let h = t_new - self.t;
            h_abs = h.abs();

            let (dfdy, dfdt) = match self.jac.take() {
                Some(jac) => jac,
                None => self.rhs.jacobian(self.t, self.y.view())?,
            };
            let attempt = self.extrapolate(h, dfdy.view(), dfdt.view());
            self.jac = Some((dfdy, dfdt));

            match attempt? {
                Some((y_new, errors)) if errors[self.target] < 1. => {
                    self.f = self.rhs.derivative_owned(t_new, y_new.view())?;
                    self.t = t_new;
                    self.y = y_new;
                    self.jac = None;
                    self.h_abs = self.adapt(h_abs, &errors);
                    if clamped {
                        self.h_abs = self.h_abs.max(h_unclamped);
                    }
                    self.rhs.stats.accepted_steps += 1;
                    return Ok(());
                }
                Some((_, errors)) => {
                    h_abs *= shrink_factor(errors[self.target], 2 * self.target);
                }
                None => h_abs *= 0.5,
            }
            self.rhs.stats.rejected_steps += 1;
        }
    }

    fn time(&self) -> f64 {
        self.t
    }

    fn time_bound(&self) -> f64 {
        self.t_bound
    }

    fn set_time_bound(&mut self, t_bound: f64) {
        debug_assert!((t_bound - self.t) * self.direction >= 0.);
        self.t_bound = t_bound;
    }

    fn state(&self) -> ArrayView1<'_, f64> {
        self.y.view()
    }

    fn stats(&self) -> Stats {
        self.rhs.stats
    }
}
