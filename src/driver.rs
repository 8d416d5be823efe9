//! The reporting loop: steps a system from one reporting time to the next
//! and collects a row at each.

use log::{error, info, trace, warn};
use ndarray::prelude::*;
use std::mem;

use crate::config::SolveConfig;
use crate::control::{Stats, StepControl};
use crate::error::{CallbackError, ConfigError, SolveError, StepError};
use crate::registry::StepType;
use crate::results::ResultTable;
use crate::system::OdeSystem;
use crate::OdeIntegrate;

/// Lifecycle of a driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    /// The stepper has not been built yet.
    Initializing,
    /// Rows are being produced.
    Stepping,
    /// Every reporting row was produced.
    Completed,
    /// Stepping stopped early.
    Failed,
}

/// Why a run stopped before reaching the final reporting time.
#[derive(Clone, Debug, PartialEq)]
pub struct Failure {
    /// Index of the reporting row that could not be produced. Always at
    /// least 1, since the initial row is recorded even when the stepper
    /// cannot be set up.
    pub reporting_index: usize,
    /// Time the stepper had reached.
    pub t: f64,
    pub error: StepError,
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    Completed,
    Failed(Failure),
}

/// Output of a run that did not hit a fatal error.
#[derive(Clone, Debug, PartialEq)]
pub struct Solution {
    pub table: ResultTable,
    pub status: Status,
    pub stats: Stats,
}

impl Solution {
    pub fn is_completed(&self) -> bool {
        self.status == Status::Completed
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.status {
            Status::Completed => None,
            Status::Failed(failure) => Some(failure),
        }
    }
}

enum Stage<'a> {
    Pending {
        system: Box<dyn OdeSystem + 'a>,
        y0: Array1<f64>,
    },
    Running(Box<dyn OdeIntegrate + 'a>),
    Aborted,
}

/// Drives one integration run.
///
/// Each call to [`advance`](IntegrationDriver::advance) does one unit of work:
/// the first builds the stepper and records the initial row, every later one
/// integrates up to the next reporting time and records that row.
pub struct IntegrationDriver<'a> {
    stage: Stage<'a>,
    state: DriverState,
    table: ResultTable,
    step_type: StepType,
    control: StepControl,
    t0: f64,
    t_step: f64,
    num_steps: usize,
    max_sub_steps: Option<usize>,
    /// Index of the next row to produce.
    next: usize,
    failure: Option<Failure>,
}

impl<'a> IntegrationDriver<'a> {
    /// Checks `config` and prepares a run of `system` from `initial_state`.
    ///
    /// No callback is invoked until the first call to `advance`.
    pub fn new<S>(
        system: S,
        initial_state: &[f64],
        config: &SolveConfig,
    ) -> Result<IntegrationDriver<'a>, ConfigError>
    where
        S: OdeSystem + 'a,
    {
        let num_y = system.dimension();
        let plan = config.validate(num_y, initial_state)?;
        info!(
            "integrating {} equations with {} from t = {} to t = {} in {} steps",
            num_y, plan.step_type, config.t0, config.t1, config.num_steps
        );
        Ok(IntegrationDriver {
            stage: Stage::Pending {
                system: Box::new(system),
                y0: Array1::from(initial_state.to_vec()),
            },
            state: DriverState::Initializing,
            table: ResultTable::new(num_y),
            step_type: plan.step_type,
            control: plan.control,
            t0: config.t0,
            t_step: plan.t_step,
            num_steps: config.num_steps,
            max_sub_steps: config.max_sub_steps,
            next: 0,
            failure: None,
        })
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Rows produced so far.
    pub fn table(&self) -> &ResultTable {
        &self.table
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Work done by the stepper so far.
    pub fn stats(&self) -> Stats {
        match &self.stage {
            Stage::Running(stepper) => stepper.stats(),
            _ => Stats::default(),
        }
    }

    /// Reporting time `j`.
    fn reporting_time(&self, j: usize) -> f64 {
        j as f64 * self.t_step + self.t0
    }

    /// Does the next unit of work and returns the new state.
    ///
    /// A callback that breaks its contract moves the driver to `Failed` and
    /// is returned as the error. Numerical failures are recorded in
    /// [`failure`](IntegrationDriver::failure) instead.
    pub fn advance(&mut self) -> Result<DriverState, CallbackError> {
        match mem::replace(&mut self.stage, Stage::Aborted) {
            Stage::Pending { system, y0 } => self.initialize(system, y0)?,
            Stage::Running(mut stepper) => {
                let result = match self.state {
                    DriverState::Stepping => self.report_next(&mut *stepper),
                    _ => Ok(()),
                };
                self.stage = Stage::Running(stepper);
                result?
            }
            Stage::Aborted => {}
        }
        Ok(self.state)
    }

    fn initialize(
        &mut self,
        system: Box<dyn OdeSystem + 'a>,
        y0: Array1<f64>,
    ) -> Result<(), CallbackError> {
        let t_first = self.reporting_time(1);
        match self.step_type.build(system, self.t0, y0.clone(), t_first, self.control) {
            Ok(stepper) => {
                self.record(self.t0, stepper.state());
                self.state = DriverState::Stepping;
                self.stage = Stage::Running(stepper);
                Ok(())
            }
            // A broken callback contract leaves no rows.
            Err(e @ StepError::Callback(_)) => self.fail(e, self.t0),
            Err(e) => {
                self.record(self.t0, y0.view());
                self.fail(e, self.t0)
            }
        }
    }

    fn report_next(&mut self, stepper: &mut dyn OdeIntegrate) -> Result<(), CallbackError> {
        let t_target = self.reporting_time(self.next);
        match step_until(stepper, t_target, self.max_sub_steps) {
            Ok(()) => {
                self.record(t_target, stepper.state());
                if self.next > self.num_steps {
                    self.state = DriverState::Completed;
                }
                Ok(())
            }
            Err(e) => self.fail(e, stepper.time()),
        }
    }

    fn record(&mut self, t: f64, y: ArrayView1<'_, f64>) {
        trace!("row {}: t = {}, y = {}", self.next, t, y);
        self.table.append_row(t, y);
        self.next += 1;
    }

    fn fail(&mut self, e: StepError, t: f64) -> Result<(), CallbackError> {
        self.state = DriverState::Failed;
        match e {
            StepError::Callback(source) => {
                error!(
                    "{} at t = {}; aborting after {} rows",
                    source,
                    t,
                    self.table.len()
                );
                Err(source)
            }
            e => {
                warn!(
                    "integration stopped at t = {} before row {}: {}",
                    t, self.next, e
                );
                self.failure = Some(Failure {
                    reporting_index: self.next,
                    t,
                    error: e,
                });
                Ok(())
            }
        }
    }

    /// Runs to the end and returns the rows.
    pub fn run(mut self) -> Result<Solution, SolveError> {
        loop {
            match self.advance() {
                Ok(DriverState::Completed) | Ok(DriverState::Failed) => break,
                Ok(_) => {}
                Err(source) => {
                    return Err(SolveError::Callback {
                        source,
                        partial: self.table,
                    })
                }
            }
        }
        let stats = self.stats();
        info!(
            "produced {} of {} rows with {} accepted and {} rejected steps",
            self.table.len(),
            self.num_steps + 1,
            stats.accepted_steps,
            stats.rejected_steps
        );
        Ok(Solution {
            table: self.table,
            status: match self.failure {
                Some(failure) => Status::Failed(failure),
                None => Status::Completed,
            },
            stats,
        })
    }
}

/// Steps until `stepper` reaches `t_target`, taking at most `max_sub_steps`
/// steps if given.
fn step_until(
    stepper: &mut dyn OdeIntegrate,
    t_target: f64,
    max_sub_steps: Option<usize>,
) -> Result<(), StepError> {
    stepper.set_time_bound(t_target);
    let mut taken = 0;
    while !stepper.finished() {
        if let Some(limit) = max_sub_steps {
            if taken == limit {
                return Err(StepError::TooManySteps {
                    limit,
                    target: t_target,
                });
            }
        }
        stepper.step()?;
        taken += 1;
    }
    Ok(())
}
