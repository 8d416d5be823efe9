//! Marshalling between the steppers and host callbacks.
//!
//! The derivative callback is called as `@f = func($t, @y)` and must return
//! exactly `num_y` numbers; returning a string anywhere in the list flags the
//! values as bad. The Jacobian callback is called as
//! `(\@dfdy, \@dfdt) = jac($t, @y)`, where `dfdy` holds `num_y` row
//! references of `num_y` numbers each.

use log::debug;
use ndarray::prelude::*;

use crate::error::{Callback, CallbackError, Element, EvalError, JacobianPart};
use crate::host::{HostFunction, HostValue};
use crate::system::{DerivativeFn, JacobianFn, OdeSystem};

/// Wraps a pair of host callbacks as an [`OdeSystem`].
///
/// A bridge starts out strict: every value coming back from the host is
/// checked for shape and type. With `validate_every_call(false)` the bridge
/// trusts the host once a Jacobian evaluation has passed those checks, and
/// stops checking for the rest of its life. A bridge is meant to serve one
/// integration run.
pub struct CallbackBridge<D, J> {
    derivative: D,
    jacobian: J,
    num_y: usize,
    validate_every_call: bool,
    strict: bool,
    args: Vec<HostValue>,
}

impl<D, J> CallbackBridge<D, J>
where
    D: HostFunction,
    J: HostFunction,
{
    pub fn new(derivative: D, jacobian: J, num_y: usize) -> Self {
        CallbackBridge {
            derivative,
            jacobian,
            num_y,
            validate_every_call: true,
            strict: true,
            args: Vec::with_capacity(num_y + 1),
        }
    }

    /// Sets whether results are validated on every call (the default) or only
    /// until the first successful Jacobian evaluation.
    pub fn validate_every_call(mut self, validate: bool) -> Self {
        self.validate_every_call = validate;
        self
    }

    /// Returns `true` while results are still being validated.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Flattens `t` and `y` into the argument list.
    fn marshal_args(&mut self, t: f64, y: ArrayView1<'_, f64>) {
        self.args.clear();
        self.args.push(HostValue::Float(t));
        self.args.extend(y.iter().map(|&yi| HostValue::Float(yi)));
    }

    /// Calls the derivative callback and fills `f` with its results.
    pub fn evaluate_derivative(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        mut f: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError> {
        self.marshal_args(t, y);
        let results = self.derivative.call(&self.args);
        if results.len() != self.num_y {
            return Err(CallbackError::Arity {
                callback: Callback::Derivative,
                expected: self.num_y,
                actual: results.len(),
            }
            .into());
        }

        let mut bad = None;
        for (i, (value, fi)) in results.iter().zip(f.iter_mut()).enumerate() {
            if value.is_string() {
                bad.get_or_insert(i);
                *fi = f64::NAN;
            } else if self.strict {
                *fi = value.as_number().ok_or(CallbackError::Type {
                    callback: Callback::Derivative,
                    element: Element::Derivative(i),
                    found: value.type_name(),
                })?;
            } else {
                *fi = value.to_number();
            }
        }
        if let Some(i) = bad {
            debug!("derivative callback flagged f[{}] as bad at t = {}", i, t);
            return Err(EvalError::BadFunction);
        }
        Ok(())
    }

    /// Calls the Jacobian callback and fills `dfdy` (row `j`, column `i` at
    /// `[[j, i]]`) and `dfdt`.
    pub fn evaluate_jacobian(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        mut dfdy: ArrayViewMut2<'_, f64>,
        dfdt: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError> {
        self.marshal_args(t, y);
        let mut results = self.jacobian.call(&self.args);
        if results.len() != 2 {
            return Err(CallbackError::Arity {
                callback: Callback::Jacobian,
                expected: 2,
                actual: results.len(),
            }
            .into());
        }

        // The list is unwound from the end: dfdt comes off first.
        let dfdt_value = results.pop().unwrap_or(HostValue::Undef);
        let dfdy_value = results.pop().unwrap_or(HostValue::Undef);

        self.unpack_row(&dfdt_value, JacobianPart::Dfdt, dfdt, Element::Dfdt)?;

        let rows = self.unpack_rows(&dfdy_value)?;
        let undef = HostValue::Undef;
        for (j, out) in dfdy.outer_iter_mut().enumerate() {
            let row = rows.get(j).unwrap_or(&undef);
            self.unpack_row(row, JacobianPart::DfdyRow(j), out, |i| Element::Dfdy(j, i))?;
        }

        if self.strict && !self.validate_every_call {
            debug!("jacobian callback validated at t = {}; trusting the host from now on", t);
            self.strict = false;
        }
        Ok(())
    }

    /// Checks the outer `dfdy` reference and returns its rows.
    fn unpack_rows<'v>(&self, value: &'v HostValue) -> Result<&'v [HostValue], CallbackError> {
        match value.as_array() {
            Some(rows) => {
                if self.strict && rows.len() != self.num_y {
                    return Err(CallbackError::Shape {
                        part: JacobianPart::Dfdy,
                        measured: rows.len(),
                        required: self.num_y,
                    });
                }
                Ok(rows)
            }
            None if self.strict => Err(CallbackError::NotArray {
                part: JacobianPart::Dfdy,
            }),
            None => Ok(&[]),
        }
    }

    /// Copies one referenced array of numbers into `out`.
    ///
    /// When not strict, a missing reference or element reads as 0.
    fn unpack_row<E>(
        &self,
        value: &HostValue,
        part: JacobianPart,
        mut out: ArrayViewMut1<'_, f64>,
        element: E,
    ) -> Result<(), CallbackError>
    where
        E: Fn(usize) -> Element,
    {
        let items = match value.as_array() {
            Some(items) => items,
            None if self.strict => return Err(CallbackError::NotArray { part }),
            None => &[],
        };
        if self.strict && items.len() != self.num_y {
            return Err(CallbackError::Shape {
                part,
                measured: items.len(),
                required: self.num_y,
            });
        }
        for (i, out) in out.iter_mut().enumerate() {
            *out = match items.get(i) {
                Some(item) if self.strict => {
                    item.as_number().ok_or_else(|| CallbackError::Type {
                        callback: Callback::Jacobian,
                        element: element(i),
                        found: item.type_name(),
                    })?
                }
                Some(item) => item.to_number(),
                None => 0.,
            };
        }
        Ok(())
    }
}

impl<D, J> DerivativeFn for CallbackBridge<D, J>
where
    D: HostFunction,
    J: HostFunction,
{
    fn derivative(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        dydt: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError> {
        self.evaluate_derivative(t, y, dydt)
    }
}

impl<D, J> JacobianFn for CallbackBridge<D, J>
where
    D: HostFunction,
    J: HostFunction,
{
    fn jacobian(
        &mut self,
        t: f64,
        y: ArrayView1<'_, f64>,
        dfdy: ArrayViewMut2<'_, f64>,
        dfdt: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvalError> {
        self.evaluate_jacobian(t, y, dfdy, dfdt)
    }
}

impl<D, J> OdeSystem for CallbackBridge<D, J>
where
    D: HostFunction,
    J: HostFunction,
{
    fn dimension(&self) -> usize {
        self.num_y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn no_jacobian(_: &[HostValue]) -> Vec<HostValue> {
        Vec::new()
    }

    fn eval_f<D: HostFunction, J: HostFunction>(
        bridge: &mut CallbackBridge<D, J>,
        y: &[f64],
    ) -> (Result<(), EvalError>, Array1<f64>) {
        let mut f = Array1::zeros(y.len());
        let res = bridge.evaluate_derivative(0.5, aview1(y), f.view_mut());
        (res, f)
    }

    fn eval_jac<D: HostFunction, J: HostFunction>(
        bridge: &mut CallbackBridge<D, J>,
        n: usize,
    ) -> (Result<(), EvalError>, Array2<f64>, Array1<f64>) {
        let mut dfdy = Array2::zeros((n, n));
        let mut dfdt = Array1::zeros(n);
        let y = Array1::<f64>::ones(n);
        let res = bridge.evaluate_jacobian(0., y.view(), dfdy.view_mut(), dfdt.view_mut());
        (res, dfdy, dfdt)
    }

    #[test]
    fn arguments_are_time_then_flattened_state() {
        let seen = RefCell::new(Vec::new());
        let func = |args: &[HostValue]| {
            seen.borrow_mut().extend_from_slice(args);
            vec![HostValue::Float(0.); 3]
        };
        let mut bridge = CallbackBridge::new(func, no_jacobian, 3);
        let (res, _) = eval_f(&mut bridge, &[1., 2., 3.]);
        res.unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![
                HostValue::Float(0.5),
                HostValue::Float(1.),
                HostValue::Float(2.),
                HostValue::Float(3.),
            ]
        );
    }

    #[test]
    fn results_keep_their_order() {
        let func = |_: &[HostValue]| vec![HostValue::Float(10.), HostValue::Int(20), HostValue::Float(30.)];
        let mut bridge = CallbackBridge::new(func, no_jacobian, 3);
        let (res, f) = eval_f(&mut bridge, &[0., 0., 0.]);
        res.unwrap();
        assert_eq!(f, array![10., 20., 30.]);
    }

    #[test]
    fn wrong_arity_is_fatal() {
        let func = |_: &[HostValue]| vec![HostValue::Float(1.)];
        let mut bridge = CallbackBridge::new(func, no_jacobian, 2);
        let (res, _) = eval_f(&mut bridge, &[0., 0.]);
        assert_eq!(
            res,
            Err(EvalError::Callback(CallbackError::Arity {
                callback: Callback::Derivative,
                expected: 2,
                actual: 1,
            }))
        );
    }

    #[test]
    fn string_anywhere_flags_bad_function() {
        for bad in 0..3 {
            let func = move |_: &[HostValue]| {
                (0..3)
                    .map(|i| if i == bad { HostValue::from("oops") } else { HostValue::Float(1.) })
                    .collect()
            };
            let mut bridge = CallbackBridge::new(func, no_jacobian, 3);
            let (res, _) = eval_f(&mut bridge, &[0., 0., 0.]);
            assert_eq!(res, Err(EvalError::BadFunction), "string at {}", bad);
        }
    }

    #[test]
    fn non_numeric_element_is_a_type_error_when_strict() {
        let func = |_: &[HostValue]| vec![HostValue::from("bad"), HostValue::Undef];
        let mut bridge = CallbackBridge::new(func, no_jacobian, 2);
        let (res, _) = eval_f(&mut bridge, &[0., 0.]);
        assert_eq!(
            res,
            Err(EvalError::Callback(CallbackError::Type {
                callback: Callback::Derivative,
                element: Element::Derivative(1),
                found: "undef",
            }))
        );
    }

    fn good_jacobian(_: &[HostValue]) -> Vec<HostValue> {
        vec![
            HostValue::matrix(vec![vec![1., 2.], vec![3., 4.]]),
            HostValue::array(vec![5., 6.]),
        ]
    }

    #[test]
    fn jacobian_is_row_major() {
        let func = |_: &[HostValue]| vec![HostValue::Float(0.); 2];
        let mut bridge = CallbackBridge::new(func, good_jacobian, 2);
        let (res, dfdy, dfdt) = eval_jac(&mut bridge, 2);
        res.unwrap();
        assert_eq!(dfdy, array![[1., 2.], [3., 4.]]);
        assert_eq!(dfdy.as_slice().unwrap(), &[1., 2., 3., 4.]);
        assert_eq!(dfdt, array![5., 6.]);
    }

    #[test]
    fn jacobian_arity() {
        let jac = |_: &[HostValue]| vec![HostValue::array(vec![0.])];
        let mut bridge = CallbackBridge::new(no_jacobian, jac, 1);
        let (res, _, _) = eval_jac(&mut bridge, 1);
        assert_eq!(
            res,
            Err(EvalError::Callback(CallbackError::Arity {
                callback: Callback::Jacobian,
                expected: 2,
                actual: 1,
            }))
        );
    }

    #[test]
    fn jacobian_shape_checks() {
        let short_dfdt = |_: &[HostValue]| {
            vec![HostValue::matrix(vec![vec![1., 2.], vec![3., 4.]]), HostValue::array(vec![5.])]
        };
        let mut bridge = CallbackBridge::new(no_jacobian, short_dfdt, 2);
        assert_eq!(
            eval_jac(&mut bridge, 2).0,
            Err(EvalError::Callback(CallbackError::Shape {
                part: JacobianPart::Dfdt,
                measured: 1,
                required: 2,
            }))
        );

        let short_row = |_: &[HostValue]| {
            vec![HostValue::matrix(vec![vec![1., 2.], vec![3.]]), HostValue::array(vec![5., 6.])]
        };
        let mut bridge = CallbackBridge::new(no_jacobian, short_row, 2);
        assert_eq!(
            eval_jac(&mut bridge, 2).0,
            Err(EvalError::Callback(CallbackError::Shape {
                part: JacobianPart::DfdyRow(1),
                measured: 1,
                required: 2,
            }))
        );

        let scalar_dfdy = |_: &[HostValue]| vec![HostValue::Float(1.), HostValue::array(vec![5., 6.])];
        let mut bridge = CallbackBridge::new(no_jacobian, scalar_dfdy, 2);
        assert_eq!(
            eval_jac(&mut bridge, 2).0,
            Err(EvalError::Callback(CallbackError::NotArray {
                part: JacobianPart::Dfdy,
            }))
        );
    }

    #[test]
    fn relaxes_after_first_jacobian_only_when_asked() {
        let calls = RefCell::new(0);
        let jac = |_: &[HostValue]| {
            *calls.borrow_mut() += 1;
            if *calls.borrow() == 1 {
                good_jacobian(&[])
            } else {
                vec![HostValue::matrix(vec![vec![7.]]), HostValue::array(vec![8.])]
            }
        };
        let mut bridge = CallbackBridge::new(no_jacobian, jac, 2).validate_every_call(false);
        assert!(bridge.is_strict());
        eval_jac(&mut bridge, 2).0.unwrap();
        assert!(!bridge.is_strict());
        let (res, dfdy, dfdt) = eval_jac(&mut bridge, 2);
        res.unwrap();
        assert_eq!(dfdy, array![[7., 0.], [0., 0.]]);
        assert_eq!(dfdt, array![8., 0.]);
    }

    #[test]
    fn stays_strict_by_default() {
        let calls = RefCell::new(0);
        let jac = |_: &[HostValue]| {
            *calls.borrow_mut() += 1;
            if *calls.borrow() == 1 {
                good_jacobian(&[])
            } else {
                vec![HostValue::matrix(vec![vec![7.]]), HostValue::array(vec![8.])]
            }
        };
        let mut bridge = CallbackBridge::new(no_jacobian, jac, 2);
        eval_jac(&mut bridge, 2).0.unwrap();
        assert!(bridge.is_strict());
        assert!(matches!(
            eval_jac(&mut bridge, 2).0,
            Err(EvalError::Callback(CallbackError::Shape { .. }))
        ));
    }
}
