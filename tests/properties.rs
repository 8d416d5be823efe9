//! Property tests for the reporting loop.

use ndarray::prelude::*;
use proptest::prelude::*;
use std::cell::Cell;

use ndarray_odeiv::{
    solve_system, solve_with, HostValue, NativeSystem, SolveConfig, SolveError, Status, StepType,
};

fn decay(_: f64, y: ArrayView1<'_, f64>, mut dy: ArrayViewMut1<'_, f64>) {
    dy.assign(&-&y);
}

fn decay_jacobian(_: f64, _: ArrayView1<'_, f64>, mut dfdy: ArrayViewMut2<'_, f64>, mut dfdt: ArrayViewMut1<'_, f64>) {
    dfdy.fill(0.);
    dfdy.diag_mut().fill(-1.);
    dfdt.fill(0.);
}

fn step_type_strategy() -> impl Strategy<Value = StepType> {
    prop::sample::select(StepType::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn rows_sit_on_the_reporting_grid(
        t0 in -10.0f64..10.0,
        span in 0.1f64..5.0,
        backward in any::<bool>(),
        num_steps in 1usize..25,
        y0 in 0.1f64..10.0,
        step_type in prop::sample::select(vec!["rkf45", "rkck", "rk8pd"]),
    ) {
        let t1 = if backward { t0 - span } else { t0 + span };
        let config = SolveConfig {
            t0,
            t1,
            num_steps,
            step_type: step_type.to_owned(),
            initial_step: 1e-3,
            abs_tol: 1e-10,
            rel_tol: 1e-10,
            ..SolveConfig::default()
        };
        let system = NativeSystem::new(1, decay, decay_jacobian);
        let solution = solve_system(system, &[y0], &config).unwrap();
        prop_assert_eq!(&solution.status, &Status::Completed);
        prop_assert_eq!(solution.table.len(), num_steps + 1);

        let t_step = (t1 - t0) / num_steps as f64;
        for (j, row) in solution.table.rows().iter().enumerate() {
            prop_assert_eq!(row.t, j as f64 * t_step + t0);
            let exact = y0 * (t0 - row.t).exp();
            prop_assert!(
                (row.y[0] - exact).abs() <= 1e-6 * exact,
                "t = {}: {} vs {}", row.t, row.y[0], exact
            );
        }
        prop_assert_eq!(solution.table.rows()[0].y[0], y0);
        prop_assert!((solution.table.times()[num_steps] - t1).abs() <= 1e-12 * (1. + t1.abs()));
    }

    #[test]
    fn unknown_names_never_reach_the_host(name in "[a-z0-9_]{0,10}") {
        prop_assume!(StepType::resolve(&name).is_err());
        let calls = Cell::new(0);
        let derivative = |args: &[HostValue]| {
            calls.set(calls.get() + 1);
            vec![HostValue::Float(-args[1].to_number())]
        };
        let jacobian = |_: &[HostValue]| {
            calls.set(calls.get() + 1);
            Vec::<HostValue>::new()
        };
        let config = SolveConfig { step_type: name, ..SolveConfig::default() };
        let result = solve_with(derivative, jacobian, &[1.], &config);
        prop_assert!(matches!(result, Err(SolveError::Config(_))));
        prop_assert_eq!(calls.get(), 0);
    }

    #[test]
    fn wrong_arity_at_the_initial_point_yields_no_rows(
        step_type in step_type_strategy(),
        num_y in 1usize..4,
        extra in 1usize..3,
        short in any::<bool>(),
    ) {
        let returned = if short { num_y - 1 } else { num_y + extra };
        let derivative = |_: &[HostValue]| vec![HostValue::Float(0.); returned];
        let jacobian = |_: &[HostValue]| Vec::<HostValue>::new();
        let config = SolveConfig {
            step_type: step_type.name().to_owned(),
            ..SolveConfig::default()
        };
        match solve_with(derivative, jacobian, &vec![1.; num_y], &config) {
            Err(SolveError::Callback { partial, .. }) => prop_assert!(partial.is_empty()),
            other => prop_assert!(false, "unexpected result {:?}", other),
        }
    }

    #[test]
    fn bad_values_end_the_run_with_partial_rows(
        step_type in step_type_strategy(),
        t_bad in 0.05f64..0.95,
        num_y in 1usize..4,
        position in 0usize..4,
    ) {
        let position = position % num_y;
        let derivative = |args: &[HostValue]| {
            let mut f: Vec<HostValue> = args[1..]
                .iter()
                .map(|y| HostValue::Float(-y.to_number()))
                .collect();
            if args[0].to_number() > t_bad {
                f[position] = HostValue::from("bad");
            }
            f
        };
        let jacobian = |_: &[HostValue]| {
            let dfdy = (0..num_y)
                .map(|j| (0..num_y).map(|i| if i == j { -1. } else { 0. }).collect::<Vec<_>>())
                .collect::<Vec<_>>();
            vec![HostValue::matrix(dfdy), HostValue::array(vec![0.; num_y])]
        };
        let config = SolveConfig {
            num_steps: 10,
            step_type: step_type.name().to_owned(),
            initial_step: 1e-3,
            ..SolveConfig::default()
        };
        let solution = solve_with(derivative, jacobian, &vec![1.; num_y], &config).unwrap();
        let failure = solution.failure().cloned();
        prop_assert!(failure.is_some());
        let failure = failure.unwrap();
        prop_assert_eq!(failure.reporting_index, solution.table.len());
        prop_assert!(solution.table.len() >= 1 && solution.table.len() <= 10);
        // A row past t_bad is possible only when the step that reached it
        // never sampled beyond t_bad; the following interval then fails.
        for row in solution.table.rows() {
            prop_assert!(row.t < t_bad + 0.1 + 1e-12);
        }
    }
}
