//! Variable-order multistep steppers.
//!
//! Both steppers keep a table `D` of backward differences of an
//! interpolating polynomial at equally spaced points `t_n - j h`. A change
//! of step size re-interpolates the table for the new spacing, so the
//! formulas can always be used in their constant-step form.

use lazy_static::lazy_static;
use ndarray::prelude::*;

use crate::control::{
    norm, shrink_factor, Rhs, Stats, StepControl, MAX_FACTOR, MIN_FACTOR, SAFETY,
};
use crate::error::StepError;
use crate::newton::NewtonMatrix;
use crate::system::OdeSystem;
use crate::OdeIntegrate;

/// Highest order of either stepper.
pub const MAX_ORDER: usize = 5;

/// Maximum number of Newton iterations of the BDF corrector.
const NEWTON_MAXITER: usize = 4;

lazy_static! {
    /// NDF modification of the BDF coefficients.
    static ref KAPPA: [f64; MAX_ORDER + 1] = [0., -0.1850, -1. / 9., -0.0823, -0.0415, 0.];
    static ref GAMMA: [f64; MAX_ORDER + 1] = {
        let mut gamma = [0.; MAX_ORDER + 1];
        for k in 1..=MAX_ORDER {
            gamma[k] = gamma[k - 1] + 1. / k as f64;
        }
        gamma
    };
    static ref ALPHA: [f64; MAX_ORDER + 1] = {
        let mut alpha = [0.; MAX_ORDER + 1];
        for k in 0..=MAX_ORDER {
            alpha[k] = (1. - KAPPA[k]) * GAMMA[k];
        }
        alpha
    };
    static ref ERROR_CONST: [f64; MAX_ORDER + 1] = {
        let mut error_const = [0.; MAX_ORDER + 1];
        for k in 0..=MAX_ORDER {
            error_const[k] = KAPPA[k] * GAMMA[k] + 1. / (k + 1) as f64;
        }
        error_const
    };
}

/// Coefficients of the Adams–Bashforth formulas in backward-difference form.
static ADAMS_GAMMA: [f64; MAX_ORDER + 2] = [
    1.,
    1. / 2.,
    5. / 12.,
    3. / 8.,
    251. / 720.,
    95. / 288.,
    19087. / 60480.,
];

/// Matrix re-interpolating backward differences of order `order` for a step
/// size multiplied by `factor`.
fn compute_r(order: usize, factor: f64) -> Array2<f64> {
    let mut m = Array2::zeros((order + 1, order + 1));
    m.row_mut(0).fill(1.);
    for i in 1..=order {
        for j in 1..=order {
            m[[i, j]] = (i as f64 - 1. - factor * j as f64) / i as f64;
        }
    }
    for i in 1..=order {
        for j in 0..=order {
            m[[i, j]] *= m[[i - 1, j]];
        }
    }
    m
}

/// Rescales the first `order + 1` rows of the difference table for a step
/// size multiplied by `factor`.
fn change_d(d: &mut Array2<f64>, order: usize, factor: f64) {
    let r = compute_r(order, factor);
    let u = compute_r(order, 1.);
    let ru = r.dot(&u);
    let rescaled = ru.t().dot(&d.slice(s![..=order, ..]));
    d.slice_mut(s![..=order, ..]).assign(&rescaled);
}

/// Largest factor and its index among `err_q^(-1/(q+1))` for the candidate
/// orders `order - 1`, `order` and `order + 1`.
fn best_order(order: usize, error_norms: [f64; 3]) -> (usize, f64) {
    let mut best = (order, 0.);
    for (i, &err) in error_norms.iter().enumerate() {
        let q = order + i - 1;
        let factor = if err == 0. {
            f64::INFINITY
        } else {
            err.powf(-1. / (q as f64 + 1.))
        };
        if factor > best.1 {
            best = (q, factor);
        }
    }
    best
}

/// Solves the BDF corrector equation by simplified Newton iteration.
///
/// Returns whether the iteration converged, the number of iterations, the
/// new state and its correction from the prediction.
#[allow(clippy::too_many_arguments)]
fn solve_bdf_system<S: OdeSystem>(
    rhs: &mut Rhs<S>,
    t_new: f64,
    y_predict: ArrayView1<'_, f64>,
    c: f64,
    psi: ArrayView1<'_, f64>,
    lu: &NewtonMatrix,
    scale: ArrayView1<'_, f64>,
    tol: f64,
) -> Result<(bool, usize, Array1<f64>, Array1<f64>), StepError> {
    let mut d = Array1::zeros(y_predict.len());
    let mut y = y_predict.to_owned();
    let mut f = Array1::zeros(y_predict.len());
    let mut dy_norm_old: Option<f64> = None;
    let mut iterations = 0;
    for k in 0..NEWTON_MAXITER {
        iterations = k + 1;
        rhs.derivative(t_new, y.view(), f.view_mut())?;
        if f.iter().any(|x| !x.is_finite()) {
            break;
        }
        let dy = match lu.solve((c * &f - &psi - &d).view()) {
            Some(dy) => dy,
            None => break,
        };
        let dy_norm = norm(dy.view(), scale);
        let rate = dy_norm_old.map(|old| dy_norm / old);
        if let Some(rate) = rate {
            if rate >= 1. || rate.powi((NEWTON_MAXITER - k) as i32) / (1. - rate) * dy_norm > tol {
                break;
            }
        }
        y += &dy;
        d += &dy;
        if dy_norm == 0. || rate.map_or(false, |rate| rate / (1. - rate) * dy_norm < tol) {
            return Ok((true, iterations, y, d));
        }
        dy_norm_old = Some(dy_norm);
    }
    Ok((false, iterations, y, d))
}

/// Variable-order BDF stepper with NDF corrections (orders 1 to 5).
///
/// # References
///
/// 1. L. F. Shampine, M. W. Reichelt, "The MATLAB ODE Suite", SIAM J. Sci.
///    Comput., Vol. 18, No. 1, pp. 1-22, 1997.
pub struct Bdf<S: OdeSystem> {
    rhs: Rhs<S>,
    t: f64,
    y: Array1<f64>,
    t_bound: f64,
    direction: f64,
    h_abs: f64,
    control: StepControl,
    newton_tol: f64,
    order: usize,
    n_equal_steps: usize,
    /// Backward differences of `y`, shape `MAX_ORDER + 3, n`.
    d: Array2<f64>,
    jac: Array2<f64>,
    lu: Option<NewtonMatrix>,
}

impl<S: OdeSystem> Bdf<S> {
    /// Creates a stepper at `(t0, y0)`. Evaluates both the derivative and
    /// the Jacobian at the initial point.
    pub fn new(
        system: S,
        t0: f64,
        y0: Array1<f64>,
        t_bound: f64,
        control: StepControl,
    ) -> Result<Bdf<S>, StepError> {
        let mut rhs = Rhs::new(system);
        debug_assert_eq!(rhs.dimension(), y0.len());
        let direction = if t_bound < t0 { -1. } else { 1. };
        let h_abs = control.first_step();
        let f = rhs.derivative_owned(t0, y0.view())?;
        let (jac, _) = rhs.jacobian(t0, y0.view())?;

        let mut d = Array2::zeros((MAX_ORDER + 3, y0.len()));
        d.row_mut(0).assign(&y0);
        d.row_mut(1).assign(&(f * (h_abs * direction)));

        Ok(Bdf {
            rhs,
            t: t0,
            y: y0,
            t_bound,
            direction,
            h_abs,
            newton_tol: control.newton_tol(),
            control,
            order: 1,
            n_equal_steps: 0,
            d,
            jac,
            lu: None,
        })
    }

    /// Order of the formula used for the next step.
    pub fn order(&self) -> usize {
        self.order
    }

    fn newton_matrix(&self, c: f64) -> Option<NewtonMatrix> {
        let mut m = Array2::eye(self.y.len());
        m.scaled_add(-c, &self.jac);
        NewtonMatrix::factor(m.view())
    }
}

impl<S: OdeSystem> OdeIntegrate for Bdf<S> {
    fn len(&self) -> usize {
        self.y.len()
    }

    fn step(&mut self) -> Result<(), StepError> {
        let t = self.t;
        let min_step = self.control.min_step_at(t, self.direction);
        let max_step = self.control.max_step;
        let mut h_abs = if self.h_abs > max_step {
            change_d(&mut self.d, self.order, max_step / self.h_abs);
            self.n_equal_steps = 0;
            self.lu = None;
            max_step
        } else if self.h_abs < min_step {
            change_d(&mut self.d, self.order, min_step / self.h_abs);
            self.n_equal_steps = 0;
            self.lu = None;
            min_step
        } else {
            self.h_abs
        };
        let order = self.order;
        let mut current_jac = false;
        let mut h_unclamped;
        let mut clamped;

        let (t_new, y_new, d, error_norm, safety, scale) = loop {
            if h_abs < min_step {
                return Err(StepError::TooSmallStep {
                    required: h_abs,
                    allowable: min_step,
                });
            }

            h_unclamped = h_abs;
            let mut t_new = t + h_abs * self.direction;
            clamped = self.direction * (t_new - self.t_bound) > 0.;
            if clamped {
                t_new = self.t_bound;
                change_d(&mut self.d, order, (t_new - t).abs() / h_abs);
                self.n_equal_steps = 0;
                self.lu = None;
            }
            let h = t_new - t;
            h_abs = h.abs();

            let y_predict = self.d.slice(s![..=order, ..]).sum_axis(Axis(0));
            let scale = self.control.scale(y_predict.view(), y_predict.view());
            let psi = self.d.slice(s![1..=order, ..]).t().dot(&aview1(&GAMMA[1..=order])) / ALPHA[order];

            let c = h / ALPHA[order];
            let mut solution = None;
            loop {
                let lu = match self.lu.take().or_else(|| self.newton_matrix(c)) {
                    Some(lu) => lu,
                    None => break,
                };
                let result = solve_bdf_system(
                    &mut self.rhs,
                    t_new,
                    y_predict.view(),
                    c,
                    psi.view(),
                    &lu,
                    scale.view(),
                    self.newton_tol,
                );
                self.lu = Some(lu);
                let (converged, n_iter, y_new, d) = result?;
                if converged {
                    solution = Some((n_iter, y_new, d));
                    break;
                }
                if current_jac {
                    break;
                }
                self.jac = self.rhs.jacobian(t_new, y_predict.view())?.0;
                self.lu = None;
                current_jac = true;
            }

            let (n_iter, y_new, d) = match solution {
                Some(solution) => solution,
                None => {
                    h_abs *= 0.5;
                    change_d(&mut self.d, order, 0.5);
                    self.n_equal_steps = 0;
                    self.lu = None;
                    self.rhs.stats.rejected_steps += 1;
                    continue;
                }
            };

            let safety = SAFETY * (2 * NEWTON_MAXITER + 1) as f64 / (2 * NEWTON_MAXITER + n_iter) as f64;
            let scale = self.control.scale(y_new.view(), y_new.view());
            let error = ERROR_CONST[order] * &d;
            let error_norm = norm(error.view(), scale.view());

            if error_norm > 1. {
                let factor = MIN_FACTOR.max(safety * error_norm.powf(-1. / (order as f64 + 1.)));
                h_abs *= factor;
                change_d(&mut self.d, order, factor);
                self.n_equal_steps = 0;
                self.rhs.stats.rejected_steps += 1;
            } else {
                break (t_new, y_new, d, error_norm, safety, scale);
            }
        };

        self.rhs.stats.accepted_steps += 1;
        self.n_equal_steps += 1;
        self.t = t_new;
        self.y = y_new;
        self.h_abs = h_abs;

        // D^{j+1} y_n = D^j y_n - D^j y_{n-1}, and d = D^{k+1} y_n.
        let next = &d - &self.d.row(order + 1);
        self.d.row_mut(order + 2).assign(&next);
        self.d.row_mut(order + 1).assign(&d);
        for i in (0..=order).rev() {
            let above = self.d.row(i + 1).to_owned();
            self.d.row_mut(i).scaled_add(1., &above);
        }

        if clamped && h_unclamped > h_abs {
            // Resume the interrupted step size after landing on the bound.
            let factor = (h_unclamped / h_abs).min(MAX_FACTOR);
            change_d(&mut self.d, order, factor);
            self.h_abs = h_abs * factor;
            self.n_equal_steps = 0;
            self.lu = None;
            return Ok(());
        }

        if self.n_equal_steps < order + 1 {
            return Ok(());
        }

        let error_m_norm = if order > 1 {
            norm((ERROR_CONST[order - 1] * &self.d.row(order)).view(), scale.view())
        } else {
            f64::INFINITY
        };
        let error_p_norm = if order < MAX_ORDER {
            norm((ERROR_CONST[order + 1] * &self.d.row(order + 2)).view(), scale.view())
        } else {
            f64::INFINITY
        };

        let (new_order, best) = best_order(order, [error_m_norm, error_norm, error_p_norm]);
        self.order = new_order;
        let factor = MAX_FACTOR.min(safety * best);
        self.h_abs *= factor;
        change_d(&mut self.d, new_order, factor);
        self.n_equal_steps = 0;
        self.lu = None;
        Ok(())
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

/// Variable-order Adams–Bashforth–Moulton stepper in PECE mode (orders 1 to
/// 5).
///
/// The order-`k` Adams–Bashforth predictor is corrected once with the
/// order-`k + 1` Adams–Moulton formula; their difference is the error
/// estimate.
pub struct Adams<S: OdeSystem> {
    rhs: Rhs<S>,
    t: f64,
    y: Array1<f64>,
    t_bound: f64,
    direction: f64,
    h_abs: f64,
    control: StepControl,
    order: usize,
    n_equal_steps: usize,
    /// Backward differences of `f`, shape `MAX_ORDER + 2, n`.
    d: Array2<f64>,
}

impl<S: OdeSystem> Adams<S> {
    pub fn new(
        system: S,
        t0: f64,
        y0: Array1<f64>,
        t_bound: f64,
        control: StepControl,
    ) -> Result<Adams<S>, StepError> {
        let mut rhs = Rhs::new(system);
        debug_assert_eq!(rhs.dimension(), y0.len());
        let f = rhs.derivative_owned(t0, y0.view())?;
        let mut d = Array2::zeros((MAX_ORDER + 2, y0.len()));
        d.row_mut(0).assign(&f);
        Ok(Adams {
            rhs,
            t: t0,
            y: y0,
            t_bound,
            direction: if t_bound < t0 { -1. } else { 1. },
            h_abs: control.first_step(),
            control,
            order: 1,
            n_equal_steps: 0,
            d,
        })
    }

    /// Order of the predictor used for the next step.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Backward differences `∇^j f` at `t_new` given its derivative `f_new`,
    /// for `j = 0..=order + 1`.
    fn differences_at(&self, f_new: ArrayView1<'_, f64>) -> Array2<f64> {
        let order = self.order;
        let mut dn = Array2::zeros((order + 2, f_new.len()));
        dn.row_mut(0).assign(&f_new);
        for j in 0..=order {
            let next = &dn.row(j) - &self.d.row(j);
            dn.row_mut(j + 1).assign(&next);
        }
        dn
    }
}

impl<S: OdeSystem> OdeIntegrate for Adams<S> {
    fn len(&self) -> usize {
        self.y.len()
    }

    fn step(&mut self) -> Result<(), StepError> {
        let t = self.t;
        let min_step = self.control.min_step_at(t, self.direction);
        let max_step = self.control.max_step;
        let mut h_abs = if self.h_abs > max_step {
            change_d(&mut self.d, self.order, max_step / self.h_abs);
            self.n_equal_steps = 0;
            max_step
        } else if self.h_abs < min_step {
            change_d(&mut self.d, self.order, min_step / self.h_abs);
            self.n_equal_steps = 0;
            min_step
        } else {
            self.h_abs
        };
        let order = self.order;
        let mut h_unclamped;
        let mut clamped;

        let (t_new, y_new, error_norm) = loop {
            if h_abs < min_step {
                return Err(StepError::TooSmallStep {
                    required: h_abs,
                    allowable: min_step,
                });
            }

            h_unclamped = h_abs;
            let mut t_new = t + h_abs * self.direction;
            clamped = self.direction * (t_new - self.t_bound) > 0.;
            if clamped {
                t_new = self.t_bound;
                change_d(&mut self.d, order, (t_new - t).abs() / h_abs);
                self.n_equal_steps = 0;
            }
            let h = t_new - t;
            h_abs = h.abs();

            // Predict.
            let increment = self
                .d
                .slice(s![..order, ..])
                .t()
                .dot(&aview1(&ADAMS_GAMMA[..order]));
            let y_predict = &self.y + &(h * &increment);
            // Evaluate, correct.
            let f_predict = self.rhs.derivative_owned(t_new, y_predict.view())?;
            let dn = self.differences_at(f_predict.view());
            let correction = h * ADAMS_GAMMA[order] * &dn.row(order);
            let y_new = &y_predict + &correction;

            let scale = self.control.scale(self.y.view(), y_new.view());
            let error_norm = norm(correction.view(), scale.view());
            if error_norm < 1. {
                break (t_new, y_new, error_norm);
            }
            let factor = shrink_factor(error_norm, order);
            h_abs *= factor;
            change_d(&mut self.d, order, factor);
            self.n_equal_steps = 0;
            self.rhs.stats.rejected_steps += 1;
        };

        // Evaluate at the corrected state and shift the differences.
        let f_new = self.rhs.derivative_owned(t_new, y_new.view())?;
        let dn = self.differences_at(f_new.view());
        self.d.slice_mut(s![..=order + 1, ..]).assign(&dn);

        self.rhs.stats.accepted_steps += 1;
        self.n_equal_steps += 1;
        self.t = t_new;
        self.y = y_new;
        self.h_abs = h_abs;

        if clamped && h_unclamped > h_abs {
            // Resume the interrupted step size after landing on the bound.
            let factor = (h_unclamped / h_abs).min(MAX_FACTOR);
            change_d(&mut self.d, order, factor);
            self.h_abs = h_abs * factor;
            self.n_equal_steps = 0;
            return Ok(());
        }

        if self.n_equal_steps < order + 1 {
            return Ok(());
        }

        let scale = self.control.scale(self.y.view(), self.y.view());
        let error_at = |q: usize| h_abs * ADAMS_GAMMA[q] * norm(dn.row(q), scale.view());
        let error_m_norm = if order > 1 { error_at(order - 1) } else { f64::INFINITY };
        let error_p_norm = if order < MAX_ORDER { error_at(order + 1) } else { f64::INFINITY };

        let (new_order, best) = best_order(order, [error_m_norm, error_norm, error_p_norm]);
        let factor = MAX_FACTOR.min(SAFETY * best);
        self.order = new_order;
        self.h_abs *= factor;
        change_d(&mut self.d, new_order, factor);
        self.n_equal_steps = 0;
        Ok(())
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
