//! Error types.

use std::fmt;
use thiserror::Error;

use crate::results::ResultTable;

/// Which host callback produced a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callback {
    Derivative,
    Jacobian,
}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Derivative => write!(f, "derivative"),
            Callback::Jacobian => write!(f, "jacobian"),
        }
    }
}

/// A reference-typed part of the Jacobian callback's result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JacobianPart {
    Dfdt,
    Dfdy,
    DfdyRow(usize),
}

impl fmt::Display for JacobianPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JacobianPart::Dfdt => write!(f, "dfdt"),
            JacobianPart::Dfdy => write!(f, "dfdy"),
            JacobianPart::DfdyRow(j) => write!(f, "dfdy row {}", j),
        }
    }
}

/// Position of a scalar within a callback's result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Element {
    Derivative(usize),
    Dfdt(usize),
    Dfdy(usize, usize),
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Derivative(i) => write!(f, "f[{}]", i),
            Element::Dfdt(i) => write!(f, "dfdt[{}]", i),
            Element::Dfdy(j, i) => write!(f, "dfdy[{}][{}]", j, i),
        }
    }
}

/// Marshalling failures. These are fatal for the run.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CallbackError {
    #[error("{callback} callback returned {actual} values, expected {expected}")]
    Arity {
        callback: Callback,
        expected: usize,
        actual: usize,
    },
    #[error("{callback} callback returned a non-numeric {found} at {element}")]
    Type {
        callback: Callback,
        element: Element,
        found: &'static str,
    },
    #[error("jacobian callback: {part} must be a reference to an array")]
    NotArray { part: JacobianPart },
    #[error("jacobian callback: {part} delivered {measured} elements, not {required} as required")]
    Shape {
        part: JacobianPart,
        measured: usize,
        required: usize,
    },
}

/// Outcome of a failed system evaluation.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EvalError {
    /// The system flagged the values it was asked about as unusable.
    #[error("system function signalled a bad value")]
    BadFunction,
    #[error(transparent)]
    Callback(#[from] CallbackError),
}

impl EvalError {
    pub(crate) fn at(self, t: f64) -> StepError {
        match self {
            EvalError::BadFunction => StepError::BadFunction { t },
            EvalError::Callback(e) => StepError::Callback(e),
        }
    }
}

/// Errors reported by a stepper.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StepError {
    #[error("required step size {required} is smaller than min allowable step size {allowable}")]
    TooSmallStep { required: f64, allowable: f64 },
    #[error("system function signalled a bad value at t = {t}")]
    BadFunction { t: f64 },
    #[error("took {limit} steps without reaching t = {target}")]
    TooManySteps { limit: usize, target: f64 },
    #[error(transparent)]
    Callback(#[from] CallbackError),
}

impl StepError {
    /// Returns `true` for failures that end the run with partial results
    /// rather than an error.
    pub fn is_numerical(&self) -> bool {
        !matches!(self, StepError::Callback(_))
    }
}

/// Invalid solver configuration.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown step type `{0}`")]
    UnknownStepType(String),
    #[error("num_steps must be at least 1")]
    NoSteps,
    #[error("num_y must be at least 1")]
    EmptyState,
    #[error("initial state has {actual} elements, expected num_y = {expected}")]
    StateLength { expected: usize, actual: usize },
    #[error("{0} is not finite")]
    NotFinite(&'static str),
    #[error("t1 equals t0")]
    EmptyInterval,
    #[error("initial step size must be positive")]
    InitialStepNotPositive,
    #[error("max_step must be positive")]
    MaxStepNotPositive,
    #[error("min_step must be non-negative and not larger than max_step")]
    InvalidMinStep,
    #[error("tolerances must be non-negative")]
    NegativeTolerance,
    #[error("abs_tol and rel_tol cannot both be zero")]
    ZeroTolerance,
    #[error("max_sub_steps must be at least 1")]
    ZeroSubStepLimit,
}

/// Errors returned by the driver entry points.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// A callback broke its contract. `partial` holds the rows completed
    /// before the failure.
    #[error("{source} (after {} result rows)", .partial.len())]
    Callback {
        #[source]
        source: CallbackError,
        partial: ResultTable,
    },
}
