//! Adaptive integration of ordinary differential equations whose right-hand
//! side lives behind host callbacks.
//!
//! A run integrates `dy/dt = f(t, y)` from `t0` to `t1` and records the state
//! at `num_steps + 1` evenly spaced reporting times. The right-hand side is
//! either a pair of [`HostFunction`]s, marshalled through a
//! [`CallbackBridge`], or any Rust type implementing [`OdeSystem`].
//!
//! ```
//! use ndarray_odeiv::{solve, HostValue};
//!
//! let decay = |args: &[HostValue]| vec![HostValue::Float(-args[1].to_number())];
//! let no_jacobian = |_: &[HostValue]| Vec::<HostValue>::new();
//! let solution = solve(decay, no_jacobian, 0., 1., 10, 1, &[1.], "rkf45", 1e-3, 1e-8, 1e-8)
//!     .unwrap();
//! assert_eq!(solution.table.len(), 11);
//! let y1 = solution.table.last().unwrap().y[0];
//! assert!((y1 - (-1f64).exp()).abs() < 1e-6);
//! ```

pub mod bridge;
pub mod bsimp;
pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod host;
pub mod implicit;
pub mod multistep;
mod newton;
pub mod registry;
pub mod results;
pub mod rk;
pub mod system;

pub use crate::bridge::CallbackBridge;
pub use crate::config::SolveConfig;
pub use crate::control::{Stats, StepControl};
pub use crate::driver::{DriverState, Failure, IntegrationDriver, Solution, Status};
pub use crate::error::{CallbackError, ConfigError, EvalError, SolveError, StepError};
pub use crate::host::{HostFunction, HostValue};
pub use crate::registry::StepType;
pub use crate::results::{ResultTable, Row};
pub use crate::system::{DerivativeFn, JacobianFn, NativeSystem, OdeSystem};

use ndarray::prelude::*;

pub trait OdeIntegrate {
    /// Returns the number of elements in the state.
    fn len(&self) -> usize;
    /// Perform one step (adaptive step size).
    fn step(&mut self) -> Result<(), StepError>;
    /// Current time.
    fn time(&self) -> f64;
    /// The ending time.
    fn time_bound(&self) -> f64;
    /// Moves the ending time. It must not lie behind the current time.
    fn set_time_bound(&mut self, t_bound: f64);
    /// Current state.
    fn state(&self) -> ArrayView1<'_, f64>;
    /// Work done so far.
    fn stats(&self) -> Stats;
    /// Returns `true` if the integration has reached `time_bound`.
    fn finished(&self) -> bool {
        self.time() == self.time_bound()
    }
    /// Integrate until reaching `time_bound`.
    fn run_to_bound(&mut self) -> Result<(), StepError> {
        while !self.finished() {
            self.step()?;
        }
        Ok(())
    }
}

/// Integrates the system given by the host callbacks `derivative` and
/// `jacobian` from `t0` to `t1`, reporting at `num_steps + 1` times.
///
/// `derivative` is called with `(t, y_0, ..., y_{num_y-1})` and returns the
/// `num_y` derivatives. `jacobian` is called with the same arguments and
/// returns `(dfdy, dfdt)` as array references; it is only called by step
/// types that use it.
///
/// Numerical failures are not errors: they end the run early and are
/// reported in [`Solution::status`] along with the rows produced so far.
#[allow(clippy::too_many_arguments)]
pub fn solve<D, J>(
    derivative: D,
    jacobian: J,
    t0: f64,
    t1: f64,
    num_steps: usize,
    num_y: usize,
    initial_state: &[f64],
    step_type: &str,
    initial_step: f64,
    abs_tol: f64,
    rel_tol: f64,
) -> Result<Solution, SolveError>
where
    D: HostFunction,
    J: HostFunction,
{
    let config = SolveConfig {
        t0,
        t1,
        num_steps,
        step_type: step_type.to_owned(),
        initial_step,
        abs_tol,
        rel_tol,
        ..SolveConfig::default()
    };
    let bridge = CallbackBridge::new(derivative, jacobian, num_y);
    solve_system(bridge, initial_state, &config)
}

/// Like [`solve`], with every option taken from `config`.
pub fn solve_with<D, J>(
    derivative: D,
    jacobian: J,
    initial_state: &[f64],
    config: &SolveConfig,
) -> Result<Solution, SolveError>
where
    D: HostFunction,
    J: HostFunction,
{
    let bridge = CallbackBridge::new(derivative, jacobian, initial_state.len())
        .validate_every_call(config.validate_every_call);
    solve_system(bridge, initial_state, config)
}

/// Integrates a Rust-side system.
pub fn solve_system<S: OdeSystem>(
    system: S,
    initial_state: &[f64],
    config: &SolveConfig,
) -> Result<Solution, SolveError> {
    IntegrationDriver::new(system, initial_state, config)?.run()
}
