//! The interface between steppers and the right-hand side of the system.

use ndarray::prelude::*;

use crate::error::EvalError;

/// Right-hand side `f(t, y)` of `dy/dt = f(t, y)`.
pub trait DerivativeFn {
    /// Fills `dydt` with the derivative of `y` at time `t`.
    fn derivative(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        dydt: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError>;
}

/// Jacobian of the right-hand side.
pub trait JacobianFn {
    /// Fills `dfdy` with `∂f_j/∂y_i` at `[[j, i]]` and `dfdt` with `∂f/∂t`.
    fn jacobian(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        dfdy: ArrayViewMut2<'_, f64>,
        dfdt: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError>;
}

/// A first-order system the steppers can integrate.
pub trait OdeSystem: DerivativeFn + JacobianFn {
    /// Number of dependent variables.
    fn dimension(&self) -> usize;
}

impl<T: DerivativeFn + ?Sized> DerivativeFn for &mut T {
    fn derivative(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        dydt: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError> {
        (**self).derivative(t, y, dydt)
    }
}

impl<T: JacobianFn + ?Sized> JacobianFn for &mut T {
    fn jacobian(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        dfdy: ArrayViewMut2<'_, f64>,
        dfdt: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError> {
        (**self).jacobian(t, y, dfdy, dfdt)
    }
}

impl<T: OdeSystem + ?Sized> OdeSystem for &mut T {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }
}

impl<T: DerivativeFn + ?Sized> DerivativeFn for Box<T> {
    fn derivative(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        dydt: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError> {
        (**self).derivative(t, y, dydt)
    }
}

impl<T: JacobianFn + ?Sized> JacobianFn for Box<T> {
    fn jacobian(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        dfdy: ArrayViewMut2<'_, f64>,
        dfdt: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError> {
        (**self).jacobian(t, y, dfdy, dfdt)
    }
}

impl<T: OdeSystem + ?Sized> OdeSystem for Box<T> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }
}

/// A system defined by Rust closures, which never fail.
///
/// `fun(t, y, dydt)` should fill in `dydt`; `jac(t, y, dfdy, dfdt)` should
/// fill in both Jacobian buffers.
pub struct NativeSystem<F, J> {
    dimension: usize,
    fun: F,
    jac: J,
}

impl<F, J> NativeSystem<F, J>
where
    F: FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>),
    J: FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut2<'_, f64>, ArrayViewMut1<'_, f64>),
{
    pub fn new(dimension: usize, fun: F, jac: J) -> Self {
        NativeSystem { dimension, fun, jac }
    }
}

impl<F, J> DerivativeFn for NativeSystem<F, J>
where
    F: FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>),
{
    fn derivative(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        dydt: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError> {
        (self.fun)(t, y, dydt);
        Ok(())
    }
}

impl<F, J> JacobianFn for NativeSystem<F, J>
where
    J: FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut2<'_, f64>, ArrayViewMut1<'_, f64>),
{
    fn jacobian(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        dfdy: ArrayViewMut2<'_, f64>,
        dfdt: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError> {
        (self.jac)(t, y, dfdy, dfdt);
        Ok(())
    }
}

impl<F, J> OdeSystem for NativeSystem<F, J>
where
    F: FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>),
    J: FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut2<'_, f64>, ArrayViewMut1<'_, f64>),
{
    fn dimension(&self) -> usize {
        self.dimension
    }
}
