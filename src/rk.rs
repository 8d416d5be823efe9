//! Explicit Runge–Kutta steppers.

use ndarray::prelude::*;
use std::marker::PhantomData;

use crate::control::{grow_factor, norm, shrink_factor, step_target, Rhs, Stats, StepControl};
use crate::error::StepError;
use crate::system::OdeSystem;
use crate::OdeIntegrate;

/// Adaptive explicit Runge–Kutta stepper.
pub struct RungeKutta<S, M>
where
    S: OdeSystem,
    M: RKMethod,
{
    rhs: Rhs<S>,
    method: PhantomData<M>,
    /// Current time.
    t: f64,
    /// Current state.
    y: Array1<f64>,
    /// Derivative at the current time and state.
    f: Array1<f64>,
    /// Previous time, or `None` if there haven't been any steps.
    t_old: Option<f64>,
    /// Boundary time.
    t_bound: f64,
    /// Integration direction: +1 or -1.
    direction: f64,
    /// Step size to attempt on the next `.step()`.
    h_abs: f64,
    control: StepControl,
    /// Storage array for Runge–Kutta stages, shape `M::NUM_STAGES + 1, self.len()`.
    ///
    /// The last row holds the derivative at the end of the latest attempt.
    k: Array2<f64>,
}

impl<S, M> RungeKutta<S, M>
where
    S: OdeSystem,
    M: RKMethod,
{
    /// Creates a new `RungeKutta` stepper.
    ///
    /// # Parameters
    ///
    /// * `system`: Right-hand side of the system.
    ///
    /// * `t0`: Initial value of the independent variable.
    ///
    /// * `y0`: Initial values of the dependent variable.
    ///
    /// * `t_bound`: Boundary time; the integration won't continue beyond
    ///   it. It also determines the direction of the integration.
    ///
    /// * `control`: Tolerances and step-size limits.
    ///
    /// The derivative is evaluated once at `(t0, y0)`.
    pub fn new(
        system: S,
        t0: f64,
        y0: Array1<f64>,
        t_bound: f64,
        control: StepControl,
    ) -> Result<RungeKutta<S, M>, StepError> {
        let mut rhs = Rhs::new(system);
        debug_assert_eq!(rhs.dimension(), y0.len());
        let direction = if t_bound < t0 { -1. } else { 1. };
        let f = rhs.derivative_owned(t0, y0.view())?;
        let k = Array2::zeros((M::NUM_STAGES + 1, y0.len()));

        Ok(RungeKutta {
            rhs,
            method: PhantomData,
            t: t0,
            y: y0,
            f,
            t_old: None,
            t_bound,
            direction,
            h_abs: control.first_step(),
            control,
            k,
        })
    }

    /// Current state derivative.
    pub fn state_deriv(&self) -> ArrayView1<'_, f64> {
        self.f.view()
    }

    /// Size of last successful step or `None` if no steps were made yet.
    pub fn step_size(&self) -> Option<f64> {
        self.t_old.map(|t_old| (self.t - t_old).abs())
    }

    /// Attempts a step of size `h` from the current point, returning the
    /// candidate state and its error norm.
    ///
    /// On return the last row of `k` holds the derivative at the candidate.
    fn attempt(&mut self, h: f64) -> Result<(Array1<f64>, f64), StepError> {
        if M::EMBEDDED {
            let y_new = rk_stages::<S, M>(
                &mut self.rhs,
                &mut self.k,
                self.t,
                self.y.view(),
                self.f.view(),
                h,
            )?;
            let scale = self.control.scale(self.y.view(), y_new.view());
            let error_norm = M::error_norm(self.k.view(), h, scale.view());
            Ok((y_new, error_norm))
        } else {
            // Step doubling: one full step against two half steps.
            let y_full = rk_stages::<S, M>(
                &mut self.rhs,
                &mut self.k,
                self.t,
                self.y.view(),
                self.f.view(),
                h,
            )?;
            let y_mid = rk_stages::<S, M>(
                &mut self.rhs,
                &mut self.k,
                self.t,
                self.y.view(),
                self.f.view(),
                h / 2.,
            )?;
            let f_mid = self.k.row(M::NUM_STAGES).to_owned();
            let y_new = rk_stages::<S, M>(
                &mut self.rhs,
                &mut self.k,
                self.t + h / 2.,
                y_mid.view(),
                f_mid.view(),
                h / 2.,
            )?;
            let error = (&y_new - &y_full) / ((1 << M::ORDER) - 1) as f64;
            let scale = self.control.scale(self.y.view(), y_new.view());
            Ok((y_new, norm(error.view(), scale.view())))
        }
    }
}

/// Performs a single Runge–Kutta step of size `h` from `(t, y)`.
///
/// Fills the stage rows of `k`, then its last row with the derivative at the
/// returned state. Notation for the Butcher tableau is as in (ref 1).
///
/// # References
///
/// 1. E. Hairer, S. P. Norsett G. Wanner, "Solving Ordinary Differential
///    Equations I: Nonstiff Problems", Sec. II.4.
fn rk_stages<S, M>(
    rhs: &mut Rhs<S>,
    k: &mut Array2<f64>,
    t: f64,
    y: ArrayView1<'_, f64>,
    f: ArrayView1<'_, f64>,
    h: f64,
) -> Result<Array1<f64>, StepError>
where
    S: OdeSystem,
    M: RKMethod,
{
    let a = M::a();
    let c = M::c();
    k.row_mut(0).assign(&f);
    for s in 1..M::NUM_STAGES {
        let dy = k.slice(s![..s, ..]).t().dot(&a.slice(s![s, ..s])) * h;
        let y_stage = dy + &y;
        rhs.derivative(t + c[s] * h, y_stage.view(), k.row_mut(s))?;
    }

    let y_new = h * k.slice(s![..M::NUM_STAGES, ..]).t().dot(&M::b()) + &y;
    rhs.derivative(t + h, y_new.view(), k.row_mut(M::NUM_STAGES))?;
    Ok(y_new)
}

impl<S, M> OdeIntegrate for RungeKutta<S, M>
where
    S: OdeSystem,
    M: RKMethod,
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

            let (y_new, error_norm) = self.attempt(h)?;

            if error_norm < 1. {
                self.t_old = Some(self.t);
                self.t = t_new;
                self.y = y_new;
                self.f.assign(&self.k.row(M::NUM_STAGES));
                self.h_abs = h_abs * grow_factor(error_norm, M::ORDER);
                if clamped {
                    // A short final step says nothing against the old size.
                    self.h_abs = self.h_abs.max(h_unclamped);
                }
                self.rhs.stats.accepted_steps += 1;
                return Ok(());
            }
            h_abs *= shrink_factor(error_norm, M::ORDER);
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

pub trait RKMethod {
    /// Order of the error estimate used for step-size control.
    const ORDER: usize;

    /// Number of stages in the method.
    const NUM_STAGES: usize;

    /// Whether the tableau carries an embedded error estimate. Methods without
    /// one estimate the error by step doubling.
    const EMBEDDED: bool = true;

    /// Coefficients for incrementing time for consecutive RK stages, length
    /// `NUM_STAGES`. The first is always zero.
    fn c() -> ArrayView1<'static, f64>;

    /// Coefficients for combining previous RK stages to compute the next
    /// stage, shape `NUM_STAGES, NUM_STAGES`.
    ///
    /// Only the strictly lower triangle is read.
    fn a() -> ArrayView2<'static, f64>;

    /// Coefficients for combining RK stages for computing the final
    /// prediction, length `NUM_STAGES`.
    fn b() -> ArrayView1<'static, f64>;

    /// Coefficients for estimating the error of a less accurate method, length
    /// `NUM_STAGES + 1`.
    ///
    /// They are computed as the difference between `b`'s in an extended
    /// tableau.
    fn e() -> ArrayView1<'static, f64> {
        aview1(&[])
    }

    /// Scaled RMS norm of the embedded error estimate.
    fn error_norm(k: ArrayView2<'_, f64>, h: f64, scale: ArrayView1<'_, f64>) -> f64 {
        let error = k.t().dot(&Self::e()) * h;
        norm(error.view(), scale)
    }
}

/// Explicit Runge–Kutta method of order 3(2).
///
/// The Bogacki-Shamping pair of formulas is used (ref 1). The error is
/// controlled assuming 2nd order accuracy, but steps are taken using a 3rd
/// oder accurate formula (local extrapolation is done).
///
/// # References
///
/// 1. P. Bogacki, L.F. Shampine, "A 3(2) Pair of Runge-Kutta Formulas",
///    Appl. Math. Lett. Vol. 2, No. 4. pp. 321-325, 1989.
pub struct RK23;

static RK23_C: [f64; 3] = [0., 1. / 2., 3. / 4.];
static RK23_A: [[f64; 3]; 3] = [[0., 0., 0.], [1. / 2., 0., 0.], [0., 3. / 4., 0.]];
static RK23_B: [f64; 3] = [2. / 9., 1. / 3., 4. / 9.];
static RK23_E: [f64; 4] = [5. / 72., -1. / 12., -1. / 9., 1. / 8.];

impl RKMethod for RK23 {
    const ORDER: usize = 2;

    const NUM_STAGES: usize = 3;

    fn c() -> ArrayView1<'static, f64> {
        aview1(&RK23_C)
    }

    fn a() -> ArrayView2<'static, f64> {
        aview2(&RK23_A)
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&RK23_B)
    }

    fn e() -> ArrayView1<'static, f64> {
        aview1(&RK23_E)
    }
}

/// Classical 4th order Runge–Kutta method.
///
/// The tableau has no embedded formula, so the error is estimated by comparing
/// one full step with two half steps; the two half steps are propagated.
pub struct RK4;

static RK4_C: [f64; 4] = [0., 1. / 2., 1. / 2., 1.];
static RK4_A: [[f64; 4]; 4] = [
    [0., 0., 0., 0.],
    [1. / 2., 0., 0., 0.],
    [0., 1. / 2., 0., 0.],
    [0., 0., 1., 0.],
];
static RK4_B: [f64; 4] = [1. / 6., 1. / 3., 1. / 3., 1. / 6.];

impl RKMethod for RK4 {
    const ORDER: usize = 4;

    const NUM_STAGES: usize = 4;

    const EMBEDDED: bool = false;

    fn c() -> ArrayView1<'static, f64> {
        aview1(&RK4_C)
    }

    fn a() -> ArrayView2<'static, f64> {
        aview2(&RK4_A)
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&RK4_B)
    }
}

/// Runge–Kutta–Fehlberg method of order 4(5).
///
/// Steps are taken with the 5th order formula and the error is controlled
/// assuming 4th order accuracy.
pub struct RKF45;

static RKF45_C: [f64; 6] = [0., 1. / 4., 3. / 8., 12. / 13., 1., 1. / 2.];
static RKF45_A: [[f64; 6]; 6] = [
    [0., 0., 0., 0., 0., 0.],
    [1. / 4., 0., 0., 0., 0., 0.],
    [3. / 32., 9. / 32., 0., 0., 0., 0.],
    [1932. / 2197., -7200. / 2197., 7296. / 2197., 0., 0., 0.],
    [439. / 216., -8., 3680. / 513., -845. / 4104., 0., 0.],
    [-8. / 27., 2., -3544. / 2565., 1859. / 4104., -11. / 40., 0.],
];
static RKF45_B: [f64; 6] = [
    16. / 135.,
    0.,
    6656. / 12825.,
    28561. / 56430.,
    -9. / 50.,
    2. / 55.,
];
static RKF45_E: [f64; 7] = [
    1. / 360.,
    0.,
    -128. / 4275.,
    -2197. / 75240.,
    1. / 50.,
    2. / 55.,
    0.,
];

impl RKMethod for RKF45 {
    const ORDER: usize = 4;

    const NUM_STAGES: usize = 6;

    fn c() -> ArrayView1<'static, f64> {
        aview1(&RKF45_C)
    }

    fn a() -> ArrayView2<'static, f64> {
        aview2(&RKF45_A)
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&RKF45_B)
    }

    fn e() -> ArrayView1<'static, f64> {
        aview1(&RKF45_E)
    }
}

/// Cash–Karp Runge–Kutta method of order 4(5).
///
/// # References
///
/// 1. J. R. Cash, A. H. Karp, "A variable order Runge-Kutta method for initial
///    value problems with rapidly varying right-hand sides", ACM Transactions
///    on Mathematical Software, Vol. 16, No. 3, pp. 201-222, 1990.
pub struct RKCK;

static RKCK_C: [f64; 6] = [0., 1. / 5., 3. / 10., 3. / 5., 1., 7. / 8.];
static RKCK_A: [[f64; 6]; 6] = [
    [0., 0., 0., 0., 0., 0.],
    [1. / 5., 0., 0., 0., 0., 0.],
    [3. / 40., 9. / 40., 0., 0., 0., 0.],
    [3. / 10., -9. / 10., 6. / 5., 0., 0., 0.],
    [-11. / 54., 5. / 2., -70. / 27., 35. / 27., 0., 0.],
    [
        1631. / 55296.,
        175. / 512.,
        575. / 13824.,
        44275. / 110592.,
        253. / 4096.,
        0.,
    ],
];
static RKCK_B: [f64; 6] = [37. / 378., 0., 250. / 621., 125. / 594., 0., 512. / 1771.];
static RKCK_E: [f64; 7] = [
    37. / 378. - 2825. / 27648.,
    0.,
    250. / 621. - 18575. / 48384.,
    125. / 594. - 13525. / 55296.,
    -277. / 14336.,
    512. / 1771. - 1. / 4.,
    0.,
];

impl RKMethod for RKCK {
    const ORDER: usize = 4;

    const NUM_STAGES: usize = 6;

    fn c() -> ArrayView1<'static, f64> {
        aview1(&RKCK_C)
    }

    fn a() -> ArrayView2<'static, f64> {
        aview2(&RKCK_A)
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&RKCK_B)
    }

    fn e() -> ArrayView1<'static, f64> {
        aview1(&RKCK_E)
    }
}

/// Explicit Runge–Kutta method of order 8 (Prince–Dormand).
///
/// The error is estimated by combining a 5th and a 3rd order formula (ref 1)
/// and controlled assuming 7th order accuracy.
///
/// # References
///
/// 1. E. Hairer, S. P. Norsett G. Wanner, "Solving Ordinary Differential
///    Equations I: Nonstiff Problems", Sec. II.
pub struct RK8PD;

static RK8PD_C: [f64; 12] = [
    0.0,
    5.26001519587677318785587544488e-2,
    7.89002279381515978178381316732e-2,
    0.118350341907227396726757197510,
    0.281649658092772603273242802490,
    1.0 / 3.0,
    0.25,
    4.0 / 13.0,
    127.0 / 195.0,
    0.6,
    6.0 / 7.0,
    1.0,
];

#[rustfmt::skip]
static RK8PD_A: [[f64; 12]; 12] = [
    [0.; 12],
    [5.26001519587677318785587544488e-2, 0., 0., 0., 0., 0., 0., 0., 0., 0., 0., 0.],
    [1.97250569845378994544595329183e-2, 5.91751709536136983633785987549e-2,
     0., 0., 0., 0., 0., 0., 0., 0., 0., 0.],
    [2.95875854768068491816892993775e-2, 0., 8.87627564304205475450678981324e-2,
     0., 0., 0., 0., 0., 0., 0., 0., 0.],
    [2.41365134159266685502369798665e-1, 0., -8.84549479328286085344864962717e-1,
     9.24834003261792003115737966543e-1, 0., 0., 0., 0., 0., 0., 0., 0.],
    [3.7037037037037037037037037037e-2, 0., 0., 1.70828608729473871279604482173e-1,
     1.25467687566822425016691814123e-1, 0., 0., 0., 0., 0., 0., 0.],
    [3.7109375e-2, 0., 0., 1.70252211019544039314978060272e-1,
     6.02165389804559606850219397283e-2, -1.7578125e-2, 0., 0., 0., 0., 0., 0.],
    [3.70920001185047927108779319836e-2, 0., 0., 1.70383925712239993810214054705e-1,
     1.07262030446373284651809199168e-1, -1.53194377486244017527936158236e-2,
     8.27378916381402288758473766002e-3, 0., 0., 0., 0., 0.],
    [6.24110958716075717114429577812e-1, 0., 0., -3.36089262944694129406857109825,
     -8.68219346841726006818189891453e-1, 2.75920996994467083049415600797e1,
     2.01540675504778934086186788979e1, -4.34898841810699588477366255144e1,
     0., 0., 0., 0.],
    [4.77662536438264365890433908527e-1, 0., 0., -2.48811461997166764192642586468,
     -5.90290826836842996371446475743e-1, 2.12300514481811942347288949897e1,
     1.52792336328824235832596922938e1, -3.32882109689848629194453265587e1,
     -2.03312017085086261358222928593e-2, 0., 0., 0.],
    [-9.3714243008598732571704021658e-1, 0., 0., 5.18637242884406370830023853209,
     1.09143734899672957818500254654, -8.14978701074692612513997267357,
     -1.85200656599969598641566180701e1, 2.27394870993505042818970056734e1,
     2.49360555267965238987089396762, -3.0467644718982195003823669022, 0., 0.],
    [2.27331014751653820792359768449, 0., 0., -1.05344954667372501984066689879e1,
     -2.00087205822486249909675718444, -1.79589318631187989172765950534e1,
     2.79488845294199600508499808837e1, -2.85899827713502369474065508674,
     -8.87285693353062954433549289258, 1.23605671757943030647266201528e1,
     6.43392746015763530355970484046e-1, 0.],
];

static RK8PD_B: [f64; 12] = [
    5.42937341165687622380535766363e-2,
    0.0,
    0.0,
    0.0,
    0.0,
    4.45031289275240888144113950566,
    1.89151789931450038304281599044,
    -5.8012039600105847814672114227,
    3.1116436695781989440891606237e-1,
    -1.52160949662516078556178806805e-1,
    2.01365400804030348374776537501e-1,
    4.47106157277725905176885569043e-2,
];

/// 5th order error estimator.
static RK8PD_E5: [f64; 13] = [
    0.1312004499419488073250102996e-1,
    0.0,
    0.0,
    0.0,
    0.0,
    -0.1225156446376204440720569753e1,
    -0.4957589496572501915214079952,
    0.1664377182454986536961530415e1,
    -0.3503288487499736816886487290,
    0.3341791187130174790297318841,
    0.8192320648511571246570742613e-1,
    -0.2235530786388629525884427845e-1,
    0.0,
];

/// 3rd order error estimator.
static RK8PD_E3: [f64; 13] = [
    5.42937341165687622380535766363e-2 - 0.244094488188976377952755905512,
    0.0,
    0.0,
    0.0,
    0.0,
    4.45031289275240888144113950566,
    1.89151789931450038304281599044,
    -5.8012039600105847814672114227,
    3.1116436695781989440891606237e-1 - 0.733846688281611857341361741547,
    -1.52160949662516078556178806805e-1,
    2.01365400804030348374776537501e-1,
    4.47106157277725905176885569043e-2 - 0.220588235294117647058823529412e-1,
    0.0,
];

impl RKMethod for RK8PD {
    const ORDER: usize = 7;

    const NUM_STAGES: usize = 12;

    fn c() -> ArrayView1<'static, f64> {
        aview1(&RK8PD_C)
    }

    fn a() -> ArrayView2<'static, f64> {
        aview2(&RK8PD_A)
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&RK8PD_B)
    }

    fn e() -> ArrayView1<'static, f64> {
        aview1(&RK8PD_E5)
    }

    fn error_norm(k: ArrayView2<'_, f64>, h: f64, scale: ArrayView1<'_, f64>) -> f64 {
        let err5 = k.t().dot(&aview1(&RK8PD_E5)) / &scale;
        let err3 = k.t().dot(&aview1(&RK8PD_E3)) / &scale;
        let err5_sq = err5.dot(&err5);
        let err3_sq = err3.dot(&err3);
        if err5_sq == 0. && err3_sq == 0. {
            return 0.;
        }
        let denom = err5_sq + 0.01 * err3_sq;
        h.abs() * err5_sq / (denom * scale.len() as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn check_tableau<M: RKMethod>() {
        let a = M::a();
        let c = M::c();
        assert_eq!(a.dim(), (M::NUM_STAGES, M::NUM_STAGES));
        assert_eq!(c.len(), M::NUM_STAGES);
        assert_abs_diff_eq!(M::b().sum(), 1., epsilon = 1e-12);
        for s in 0..M::NUM_STAGES {
            // Row sums of A equal the nodes.
            assert_abs_diff_eq!(a.row(s).sum(), c[s], epsilon = 1e-12);
            for j in s..M::NUM_STAGES {
                assert_eq!(a[[s, j]], 0.);
            }
        }
        if M::EMBEDDED {
            assert_eq!(M::e().len(), M::NUM_STAGES + 1);
            assert_abs_diff_eq!(M::e().sum(), 0., epsilon = 1e-12);
        }
    }

    #[test]
    fn tableaus_are_consistent() {
        check_tableau::<RK23>();
        check_tableau::<RK4>();
        check_tableau::<RKF45>();
        check_tableau::<RKCK>();
        check_tableau::<RK8PD>();
    }
}
