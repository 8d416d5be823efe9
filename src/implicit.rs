//! Implicit Runge–Kutta steppers for stiff systems.
//!
//! The stage equations are solved by a simplified Newton iteration using the
//! Jacobian at the start of the step, and the error is estimated by step
//! doubling.

use lazy_static::lazy_static;
use ndarray::prelude::*;
use std::marker::PhantomData;

use crate::control::{grow_factor, norm, shrink_factor, step_target, Rhs, Stats, StepControl};
use crate::error::StepError;
use crate::newton::NewtonMatrix;
use crate::system::OdeSystem;
use crate::OdeIntegrate;

/// Maximum number of Newton iterations per stage solve.
const NEWTON_MAXITER: usize = 7;

/// Butcher tableau of a fully implicit Runge–Kutta method.
pub trait ImplicitMethod {
    /// Classical order of the method.
    const ORDER: usize;

    const NUM_STAGES: usize;

    /// Stage coefficients, shape `NUM_STAGES, NUM_STAGES`.
    fn a() -> ArrayView2<'static, f64>;

    /// Stage nodes, length `NUM_STAGES`.
    fn c() -> ArrayView1<'static, f64>;

    /// Weights applied to the stage increments, `b A⁻¹`.
    fn d() -> ArrayView1<'static, f64>;
}

/// Implicit Euler.
pub struct ImplicitEuler;

static EULER_A: [[f64; 1]; 1] = [[1.]];
static EULER_C: [f64; 1] = [1.];
static EULER_D: [f64; 1] = [1.];

impl ImplicitMethod for ImplicitEuler {
    const ORDER: usize = 1;
    const NUM_STAGES: usize = 1;

    fn a() -> ArrayView2<'static, f64> {
        aview2(&EULER_A)
    }

    fn c() -> ArrayView1<'static, f64> {
        aview1(&EULER_C)
    }

    fn d() -> ArrayView1<'static, f64> {
        aview1(&EULER_D)
    }
}

/// Implicit midpoint rule, the one-stage Gauss–Legendre method.
pub struct ImplicitMidpoint;

static MIDPOINT_A: [[f64; 1]; 1] = [[0.5]];
static MIDPOINT_C: [f64; 1] = [0.5];
static MIDPOINT_D: [f64; 1] = [2.];

impl ImplicitMethod for ImplicitMidpoint {
    const ORDER: usize = 2;
    const NUM_STAGES: usize = 1;

    fn a() -> ArrayView2<'static, f64> {
        aview2(&MIDPOINT_A)
    }

    fn c() -> ArrayView1<'static, f64> {
        aview1(&MIDPOINT_C)
    }

    fn d() -> ArrayView1<'static, f64> {
        aview1(&MIDPOINT_D)
    }
}

/// Two-stage Gauss–Legendre method of order 4.
pub struct Gauss4;

lazy_static! {
    static ref SQRT3: f64 = 3f64.sqrt();
    static ref GAUSS4_A: Array2<f64> = array![
        [1. / 4., 1. / 4. - *SQRT3 / 6.],
        [1. / 4. + *SQRT3 / 6., 1. / 4.],
    ];
    static ref GAUSS4_C: Array1<f64> = array![1. / 2. - *SQRT3 / 6., 1. / 2. + *SQRT3 / 6.];
    static ref GAUSS4_D: Array1<f64> = array![-*SQRT3, *SQRT3];
}

impl ImplicitMethod for Gauss4 {
    const ORDER: usize = 4;
    const NUM_STAGES: usize = 2;

    fn a() -> ArrayView2<'static, f64> {
        GAUSS4_A.view()
    }

    fn c() -> ArrayView1<'static, f64> {
        GAUSS4_C.view()
    }

    fn d() -> ArrayView1<'static, f64> {
        GAUSS4_D.view()
    }
}

/// Adaptive implicit Runge–Kutta stepper.
pub struct ImplicitRungeKutta<S, M>
where
    S: OdeSystem,
    M: ImplicitMethod,
{
    rhs: Rhs<S>,
    method: PhantomData<M>,
    t: f64,
    y: Array1<f64>,
    t_bound: f64,
    direction: f64,
    h_abs: f64,
    control: StepControl,
    newton_tol: f64,
    /// Jacobian at `(t, y)`, kept across rejected attempts.
    jac: Option<Array2<f64>>,
}

impl<S, M> ImplicitRungeKutta<S, M>
where
    S: OdeSystem,
    M: ImplicitMethod,
{
    /// Creates a stepper starting at `(t0, y0)` and heading for `t_bound`.
    ///
    /// The derivative is evaluated once at the initial point, which catches a
    /// system that cannot be evaluated there before any step is attempted.
    pub fn new(
        system: S,
        t0: f64,
        y0: Array1<f64>,
        t_bound: f64,
        control: StepControl,
    ) -> Result<ImplicitRungeKutta<S, M>, StepError> {
        let mut rhs = Rhs::new(system);
        debug_assert_eq!(rhs.dimension(), y0.len());
        rhs.derivative_owned(t0, y0.view())?;
        Ok(ImplicitRungeKutta {
            rhs,
            method: PhantomData,
            t: t0,
            y: y0,
            t_bound,
            direction: if t_bound < t0 { -1. } else { 1. },
            h_abs: control.first_step(),
            newton_tol: control.newton_tol(),
            control,
            jac: None,
        })
    }

    /// One full step and two half steps of size `h` from the current point.
    ///
    /// Returns `None` if any of the stage solves failed to converge.
    fn attempt(
        &mut self,
        h: f64,
        jac: ArrayView2<'_, f64>,
    ) -> Result<Option<(Array1<f64>, f64)>, StepError> {
        let newton_scale = self.control.scale(self.y.view(), self.y.view());
        let tol = self.newton_tol;
        let solve = |rhs: &mut Rhs<S>, t: f64, y: ArrayView1<'_, f64>, h: f64| {
            collocate::<S, M>(rhs, t, y, h, jac, newton_scale.view(), tol)
        };

        let y_full = match solve(&mut self.rhs, self.t, self.y.view(), h)? {
            Some(y) => y,
            None => return Ok(None),
        };
        let y_mid = match solve(&mut self.rhs, self.t, self.y.view(), h / 2.)? {
            Some(y) => y,
            None => return Ok(None),
        };
        let y_new = match solve(&mut self.rhs, self.t + h / 2., y_mid.view(), h / 2.)? {
            Some(y) => y,
            None => return Ok(None),
        };

        let error = (&y_new - &y_full) / ((1 << M::ORDER) - 1) as f64;
        let scale = self.control.scale(self.y.view(), y_new.view());
        Ok(Some((y_new, norm(error.view(), scale.view()))))
    }
}

/// Solves the stage equations `Z = h (A ⊗ I) F(Z)` for a step of size `h`
/// from `(t, y)` and returns the new state.
///
/// Returns `None` if the Newton matrix is singular or the iteration diverges.
fn collocate<S, M>(
    rhs: &mut Rhs<S>,
    t: f64,
    y: ArrayView1<'_, f64>,
    h: f64,
    jac: ArrayView2<'_, f64>,
    scale: ArrayView1<'_, f64>,
    tol: f64,
) -> Result<Option<Array1<f64>>, StepError>
where
    S: OdeSystem,
    M: ImplicitMethod,
{
    let n = y.len();
    let stages = M::NUM_STAGES;
    let a = M::a();
    let c = M::c();

    let mut newton = Array2::eye(stages * n);
    for i in 0..stages {
        for j in 0..stages {
            let aij = a[[i, j]];
            if aij != 0. {
                newton
                    .slice_mut(s![i * n..(i + 1) * n, j * n..(j + 1) * n])
                    .scaled_add(-h * aij, &jac);
            }
        }
    }
    let lu = match NewtonMatrix::factor(newton.view()) {
        Some(lu) => lu,
        None => return Ok(None),
    };

    let mut z = Array2::<f64>::zeros((stages, n));
    let mut f = Array2::<f64>::zeros((stages, n));
    let mut dz_norm_old: Option<f64> = None;
    for k in 0..NEWTON_MAXITER {
        for i in 0..stages {
            let y_stage = &z.row(i) + &y;
            rhs.derivative(t + c[i] * h, y_stage.view(), f.row_mut(i))?;
        }
        if f.iter().any(|x| !x.is_finite()) {
            return Ok(None);
        }

        let residual = h * a.dot(&f) - &z;
        let residual = Array1::from_iter(residual.iter().cloned());
        let dz = match lu.solve(residual.view()) {
            Some(dz) => dz,
            None => return Ok(None),
        };

        let mut sum_sq = 0.;
        for i in 0..stages {
            let dz_i = dz.slice(s![i * n..(i + 1) * n]);
            sum_sq += norm(dz_i, scale).powi(2);
            z.row_mut(i).scaled_add(1., &dz_i);
        }
        let dz_norm = (sum_sq / stages as f64).sqrt();

        let rate = dz_norm_old.map(|old| dz_norm / old);
        if let Some(rate) = rate {
            let remaining = (NEWTON_MAXITER - k) as i32;
            if rate >= 1. || rate.powi(remaining) / (1. - rate) * dz_norm > tol {
                return Ok(None);
            }
        }
        if dz_norm == 0. || rate.map_or(false, |rate| rate / (1. - rate) * dz_norm < tol) {
            return Ok(Some(z.t().dot(&M::d()) + &y));
        }
        dz_norm_old = Some(dz_norm);
    }
    Ok(None)
}

impl<S, M> OdeIntegrate for ImplicitRungeKutta<S, M>
where
    S: OdeSystem,
    M: ImplicitMethod,
{
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

            let jac = match self.jac.take() {
                Some(jac) => jac,
                None => self.rhs.jacobian(self.t, self.y.view())?.0,
            };
            let attempt = self.attempt(h, jac.view());
            self.jac = Some(jac);

            match attempt? {
                Some((y_new, error_norm)) if error_norm < 1. => {
                    self.t = t_new;
                    self.y = y_new;
                    self.jac = None;
                    self.h_abs = h_abs * grow_factor(error_norm, M::ORDER);
                    if clamped {
                        self.h_abs = self.h_abs.max(h_unclamped);
                    }
                    self.rhs.stats.accepted_steps += 1;
                    return Ok(());
                }
                Some((_, error_norm)) => h_abs *= shrink_factor(error_norm, M::ORDER),
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
