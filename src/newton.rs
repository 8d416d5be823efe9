//! Factored iteration matrices for the Newton solves of the implicit
//! steppers.

use nalgebra::{DMatrix, DVector, Dyn, LU};
use ndarray::prelude::*;

/// LU factors of a Newton iteration matrix such as `I - h J`.
#[derive(Clone, Debug)]
pub(crate) struct NewtonMatrix {
    lu: LU<f64, Dyn, Dyn>,
}

impl NewtonMatrix {
    /// Factors `m`, returning `None` if it has non-finite entries or is
    /// singular.
    pub(crate) fn factor(m: ArrayView2<'_, f64>) -> Option<NewtonMatrix> {
        if m.iter().any(|x| !x.is_finite()) {
            return None;
        }
        let lu = DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| m[[i, j]]).lu();
        if lu.is_invertible() {
            Some(NewtonMatrix { lu })
        } else {
            None
        }
    }

    /// Solves `M x = b`, or `None` if the solution overflows.
    pub(crate) fn solve(&self, b: ArrayView1<'_, f64>) -> Option<Array1<f64>> {
        let b = DVector::from_iterator(b.len(), b.iter().cloned());
        let x = self.lu.solve(&b)?;
        if x.iter().all(|x| x.is_finite()) {
            Some(x.iter().cloned().collect())
        } else {
            None
        }
    }
}
