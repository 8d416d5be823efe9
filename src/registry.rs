//! Step-type names and the steppers they select.

use log::debug;
use ndarray::Array1;
use std::fmt;
use std::str::FromStr;

use crate::bsimp::Bsimp;
use crate::control::StepControl;
use crate::error::{ConfigError, StepError};
use crate::implicit::{Gauss4, ImplicitEuler, ImplicitMidpoint, ImplicitRungeKutta};
use crate::multistep::{Adams, Bdf};
use crate::rk::{RungeKutta, RK23, RK4, RK8PD, RKCK, RKF45};
use crate::system::OdeSystem;
use crate::OdeIntegrate;

/// Integration algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepType {
    /// Embedded Runge–Kutta 2(3).
    Rk2,
    /// Classical 4th order Runge–Kutta.
    Rk4,
    /// Runge–Kutta–Fehlberg 4(5).
    Rkf45,
    /// Runge–Kutta Cash–Karp 4(5).
    Rkck,
    /// Runge–Kutta Prince–Dormand 8(5,3).
    Rk8pd,
    /// Implicit Euler.
    Rk1imp,
    /// Implicit midpoint.
    Rk2imp,
    /// Two-stage Gauss–Legendre.
    Rk4imp,
    /// Semi-implicit Bulirsch–Stoer.
    Bsimp,
    /// Adams–Bashforth–Moulton multistep.
    Msadams,
    /// Variable-order BDF.
    Msbdf,
}

/// Every accepted spelling, including the `_j` aliases of the methods that
/// consult the Jacobian.
static NAMES: [(&str, StepType); 16] = [
    ("rk2", StepType::Rk2),
    ("rk4", StepType::Rk4),
    ("rkf45", StepType::Rkf45),
    ("rkck", StepType::Rkck),
    ("rk8pd", StepType::Rk8pd),
    ("rk1imp", StepType::Rk1imp),
    ("rk1imp_j", StepType::Rk1imp),
    ("rk2imp", StepType::Rk2imp),
    ("rk2imp_j", StepType::Rk2imp),
    ("rk4imp", StepType::Rk4imp),
    ("rk4imp_j", StepType::Rk4imp),
    ("bsimp", StepType::Bsimp),
    ("bsimp_j", StepType::Bsimp),
    ("msadams", StepType::Msadams),
    ("msbdf", StepType::Msbdf),
    ("msbdf_j", StepType::Msbdf),
];

impl StepType {
    /// All step types.
    pub const ALL: [StepType; 11] = [
        StepType::Rk2,
        StepType::Rk4,
        StepType::Rkf45,
        StepType::Rkck,
        StepType::Rk8pd,
        StepType::Rk1imp,
        StepType::Rk2imp,
        StepType::Rk4imp,
        StepType::Bsimp,
        StepType::Msadams,
        StepType::Msbdf,
    ];

    /// Looks up a step type by name. Names are case-sensitive.
    pub fn resolve(name: &str) -> Result<StepType, ConfigError> {
        let step_type = NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, step_type)| step_type)
            .ok_or_else(|| ConfigError::UnknownStepType(name.to_owned()))?;
        debug!("step type `{}` resolved to {:?}", name, step_type);
        Ok(step_type)
    }

    /// Canonical name.
    pub fn name(self) -> &'static str {
        match self {
            StepType::Rk2 => "rk2",
            StepType::Rk4 => "rk4",
            StepType::Rkf45 => "rkf45",
            StepType::Rkck => "rkck",
            StepType::Rk8pd => "rk8pd",
            StepType::Rk1imp => "rk1imp",
            StepType::Rk2imp => "rk2imp",
            StepType::Rk4imp => "rk4imp",
            StepType::Bsimp => "bsimp",
            StepType::Msadams => "msadams",
            StepType::Msbdf => "msbdf",
        }
    }

    /// Returns `true` if the algorithm calls the Jacobian.
    pub fn uses_jacobian(self) -> bool {
        matches!(
            self,
            StepType::Rk1imp
                | StepType::Rk2imp
                | StepType::Rk4imp
                | StepType::Bsimp
                | StepType::Msbdf
        )
    }

    /// Builds a stepper for `system` starting at `(t0, y0)`.
    ///
    /// Every stepper evaluates the derivative at the initial point; `msbdf`
    /// evaluates the Jacobian there too.
    pub fn build<'a, S>(
        self,
        system: S,
        t0: f64,
        y0: Array1<f64>,
        t_bound: f64,
        control: StepControl,
    ) -> Result<Box<dyn OdeIntegrate + 'a>, StepError>
    where
        S: OdeSystem + 'a,
    {
        Ok(match self {
            StepType::Rk2 => Box::new(RungeKutta::<S, RK23>::new(system, t0, y0, t_bound, control)?),
            StepType::Rk4 => Box::new(RungeKutta::<S, RK4>::new(system, t0, y0, t_bound, control)?),
            StepType::Rkf45 => Box::new(RungeKutta::<S, RKF45>::new(system, t0, y0, t_bound, control)?),
            StepType::Rkck => Box::new(RungeKutta::<S, RKCK>::new(system, t0, y0, t_bound, control)?),
            StepType::Rk8pd => Box::new(RungeKutta::<S, RK8PD>::new(system, t0, y0, t_bound, control)?),
            StepType::Rk1imp => Box::new(ImplicitRungeKutta::<S, ImplicitEuler>::new(
                system, t0, y0, t_bound, control,
            )?),
            StepType::Rk2imp => Box::new(ImplicitRungeKutta::<S, ImplicitMidpoint>::new(
                system, t0, y0, t_bound, control,
            )?),
            StepType::Rk4imp => Box::new(ImplicitRungeKutta::<S, Gauss4>::new(
                system, t0, y0, t_bound, control,
            )?),
            StepType::Bsimp => Box::new(Bsimp::new(system, t0, y0, t_bound, control)?),
            StepType::Msadams => Box::new(Adams::new(system, t0, y0, t_bound, control)?),
            StepType::Msbdf => Box::new(Bdf::new(system, t0, y0, t_bound, control)?),
        })
    }
}

impl FromStr for StepType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<StepType, ConfigError> {
        StepType::resolve(s)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
