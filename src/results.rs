//! The table of reporting rows produced by a run.

use ndarray::prelude::*;

/// State at one reporting time.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub t: f64,
    pub y: Array1<f64>,
}

/// Ordered, append-only sequence of reporting rows.
///
/// The first row of a run is the initial condition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultTable {
    num_y: usize,
    rows: Vec<Row>,
}

impl ResultTable {
    /// Creates an empty table for states of `num_y` elements.
    pub fn new(num_y: usize) -> ResultTable {
        ResultTable {
            num_y,
            rows: Vec::new(),
        }
    }

    /// Appends a row holding a copy of `y`.
    pub fn append_row(&mut self, t: f64, y: ArrayView1<'_, f64>) {
        debug_assert_eq!(y.len(), self.num_y);
        self.rows.push(Row { t, y: y.to_owned() });
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of state elements per row.
    pub fn num_y(&self) -> usize {
        self.num_y
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn last(&self) -> Option<&Row> {
        self.rows.last()
    }

    /// Reporting times.
    pub fn times(&self) -> Array1<f64> {
        self.rows.iter().map(|row| row.t).collect()
    }

    /// States, one row per reporting time.
    pub fn states(&self) -> Array2<f64> {
        let mut states = Array2::zeros((self.rows.len(), self.num_y));
        for (mut out, row) in states.outer_iter_mut().zip(&self.rows) {
            out.assign(&row.y);
        }
        states
    }

    /// Rows laid out as `[t, y_0, ..., y_{num_y-1}]`.
    pub fn to_array(&self) -> Array2<f64> {
        let mut table = Array2::zeros((self.rows.len(), self.num_y + 1));
        for (mut out, row) in table.outer_iter_mut().zip(&self.rows) {
            out[0] = row.t;
            out.slice_mut(s![1..]).assign(&row.y);
        }
        table
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_snapshots() {
        let mut table = ResultTable::new(2);
        let mut y = array![1., 2.];
        table.append_row(0., y.view());
        y[0] = 5.;
        table.append_row(0.5, y.view());
        y.fill(0.);
        assert_eq!(table.rows()[0].y, array![1., 2.]);
        assert_eq!(table.rows()[1].y, array![5., 2.]);
    }

    #[test]
    fn array_views() {
        let mut table = ResultTable::new(2);
        assert!(table.is_empty());
        assert_eq!(table.to_array().dim(), (0, 3));
        table.append_row(0., aview1(&[1., 2.]));
        table.append_row(1., aview1(&[3., 4.]));
        assert_eq!(table.len(), 2);
        assert_eq!(table.times(), array![0., 1.]);
        assert_eq!(table.states(), array![[1., 2.], [3., 4.]]);
        assert_eq!(table.to_array(), array![[0., 1., 2.], [1., 3., 4.]]);
        assert_eq!(table.last().map(|row| row.t), Some(1.));
        let rows = table.into_rows();
        assert_eq!(rows[1], Row { t: 1., y: array![3., 4.] });
    }
}
