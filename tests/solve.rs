use approx::assert_abs_diff_eq;
use std::cell::Cell;

use ndarray_odeiv::error::JacobianPart;
use ndarray_odeiv::{
    solve, solve_with, CallbackError, ConfigError, HostValue, SolveConfig, SolveError, Status,
    StepError, StepType,
};

fn time(args: &[HostValue]) -> f64 {
    args[0].to_number()
}

fn decay(args: &[HostValue]) -> Vec<HostValue> {
    args[1..].iter().map(|y| HostValue::Float(-y.to_number())).collect()
}

fn decay_jacobian(_: &[HostValue]) -> Vec<HostValue> {
    vec![HostValue::matrix(vec![vec![-1.]]), HostValue::array(vec![0.])]
}

fn no_jacobian(_: &[HostValue]) -> Vec<HostValue> {
    Vec::new()
}

fn decay_config(step_type: &str) -> SolveConfig {
    SolveConfig {
        t0: 0.,
        t1: 2.,
        num_steps: 4,
        step_type: step_type.to_owned(),
        initial_step: 1e-3,
        abs_tol: 1e-8,
        rel_tol: 1e-8,
        ..SolveConfig::default()
    }
}

#[test]
fn every_step_type_follows_exponential_decay() {
    for &step_type in StepType::ALL.iter() {
        let (config, epsilon) = match step_type {
            StepType::Rk1imp => (
                SolveConfig {
                    abs_tol: 1e-6,
                    rel_tol: 1e-6,
                    ..decay_config(step_type.name())
                },
                1e-3,
            ),
            _ => (decay_config(step_type.name()), 1e-5),
        };
        let solution = solve_with(decay, decay_jacobian, &[1.], &config).unwrap();
        assert_eq!(solution.status, Status::Completed, "{}", step_type);
        assert_eq!(solution.table.len(), 5);
        for (j, row) in solution.table.rows().iter().enumerate() {
            assert_eq!(row.t, j as f64 * 0.5);
            assert!(
                (row.y[0] - (-row.t).exp()).abs() < epsilon,
                "{} at t = {}: {}",
                step_type,
                row.t,
                row.y[0]
            );
        }
        assert!(solution.stats.accepted_steps > 0);
        assert_eq!(solution.stats.jacobian_evals > 0, step_type.uses_jacobian());
    }
}

#[test]
fn positional_entry_point() {
    let solution = solve(
        decay, no_jacobian, 0., 1., 10, 2, &[1., 2.], "rk8pd", 1e-6, 1e-10, 1e-10,
    )
    .unwrap();
    assert!(solution.is_completed());
    let array = solution.table.to_array();
    assert_eq!(array.dim(), (11, 3));
    assert_eq!(array[[0, 0]], 0.);
    assert_eq!(array[[0, 2]], 2.);
    assert_abs_diff_eq!(array[[10, 0]], 1., epsilon = 1e-12);
    assert_abs_diff_eq!(array[[10, 1]], (-1f64).exp(), epsilon = 1e-8);
    assert_abs_diff_eq!(array[[10, 2]], 2. * (-1f64).exp(), epsilon = 1e-8);
}

#[test]
fn unknown_step_type_invokes_no_callback() {
    let calls = Cell::new(0);
    let derivative = |args: &[HostValue]| {
        calls.set(calls.get() + 1);
        decay(args)
    };
    let result = solve(
        derivative, no_jacobian, 0., 1., 10, 1, &[1.], "rk45", 1e-6, 1e-6, 0.,
    );
    match result {
        Err(SolveError::Config(ConfigError::UnknownStepType(name))) => assert_eq!(name, "rk45"),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(calls.get(), 0);
}

#[test]
fn wrong_arity_keeps_completed_rows() {
    let derivative = |args: &[HostValue]| {
        let mut f = decay(args);
        if time(args) > 0.5 {
            f.push(HostValue::Float(0.));
        }
        f
    };
    let result = solve(
        derivative, no_jacobian, 0., 1., 10, 1, &[1.], "rkf45", 1e-3, 1e-8, 1e-8,
    );
    match result {
        Err(SolveError::Callback { source, partial }) => {
            assert_eq!(
                source,
                CallbackError::Arity {
                    callback: ndarray_odeiv::error::Callback::Derivative,
                    expected: 1,
                    actual: 2,
                }
            );
            assert_eq!(partial.len(), 6);
            assert_eq!(partial.rows()[5].t, 0.5);
            assert_abs_diff_eq!(partial.rows()[5].y[0], (-0.5f64).exp(), epsilon = 1e-6);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn string_result_stops_the_run_cleanly() {
    for bad_index in 0..2 {
        let derivative = move |args: &[HostValue]| {
            let mut f = decay(args);
            if time(args) > 0.5 {
                f[bad_index] = HostValue::from("domain error");
            }
            f
        };
        let solution = solve(
            derivative, no_jacobian, 0., 1., 10, 2, &[1., 1.], "rkf45", 1e-3, 1e-8, 1e-8,
        )
        .unwrap();
        assert_eq!(solution.table.len(), 6);
        let failure = solution.failure().unwrap();
        assert_eq!(failure.reporting_index, 6);
        assert!(failure.t >= 0.5);
        match failure.error {
            StepError::BadFunction { t } => assert!(t > 0.5),
            ref e => panic!("unexpected error {}", e),
        }
    }
}

#[test]
fn bad_value_at_the_initial_point_keeps_the_initial_row() {
    for &step_type in &["rk4", "rk8pd", "bsimp", "msadams", "msbdf"] {
        let derivative = |_: &[HostValue]| vec![HostValue::from("nope")];
        let jacobian = |_: &[HostValue]| {
            vec![HostValue::matrix(vec![vec![-1.]]), HostValue::array(vec![0.])]
        };
        let solution = solve(
            derivative, jacobian, 0., 1., 4, 1, &[1.], step_type, 1e-3, 1e-6, 0.,
        )
        .unwrap();
        assert_eq!(solution.table.len(), 1, "{}", step_type);
        let row = &solution.table.rows()[0];
        assert_eq!(row.t, 0.);
        assert_eq!(row.y[0], 1.);
        let failure = solution.failure().unwrap();
        assert_eq!(failure.reporting_index, 1);
        assert_eq!(failure.error, StepError::BadFunction { t: 0. });
    }
}

#[test]
fn van_der_pol_oscillates() {
    let mu = 1.;
    let derivative = move |args: &[HostValue]| {
        let (y0, y1) = (args[1].to_number(), args[2].to_number());
        vec![
            HostValue::Float(y1),
            HostValue::Float(mu * (1. - y0 * y0) * y1 - y0),
        ]
    };
    let jacobian = move |args: &[HostValue]| {
        let (y0, y1) = (args[1].to_number(), args[2].to_number());
        vec![
            HostValue::matrix(vec![vec![0., 1.], vec![-2. * mu * y0 * y1 - 1., mu * (1. - y0 * y0)]]),
            HostValue::array(vec![0., 0.]),
        ]
    };
    let solution = solve(
        derivative, jacobian, 0., 100., 100, 2, &[1., 0.], "rk8pd", 1e-6, 1e-6, 1e-6,
    )
    .unwrap();
    assert_eq!(solution.status, Status::Completed);
    assert_eq!(solution.table.len(), 101);

    let states = solution.table.states();
    let x = states.column(0);
    let sign_changes = x
        .iter()
        .zip(x.iter().skip(1))
        .filter(|(a, b)| a.signum() != b.signum())
        .count();
    assert!(sign_changes > 20, "{} sign changes", sign_changes);
    let amplitude = x.iter().skip(50).fold(0f64, |m, &v| m.max(v.abs()));
    assert!(amplitude > 1.8 && amplitude < 2.1, "amplitude {}", amplitude);
}

#[test]
fn stiff_problem_with_jacobian_steppers() {
    let derivative = |args: &[HostValue]| {
        let (t, y) = (time(args), args[1].to_number());
        vec![HostValue::Float(-1000. * (y - t.cos()) - t.sin())]
    };
    let jacobian = |args: &[HostValue]| {
        let t = time(args);
        vec![
            HostValue::matrix(vec![vec![-1000.]]),
            HostValue::array(vec![-1000. * t.sin() - t.cos()]),
        ]
    };
    for name in &["msbdf", "bsimp", "rk4imp", "rk2imp", "rk1imp"] {
        let config = SolveConfig {
            t1: 1.,
            num_steps: 10,
            step_type: name.to_string(),
            initial_step: 1e-4,
            abs_tol: 1e-6,
            rel_tol: 1e-6,
            ..SolveConfig::default()
        };
        let solution = solve_with(derivative, jacobian, &[1.], &config).unwrap();
        assert!(solution.is_completed(), "{}", name);
        for row in solution.table.rows() {
            assert!(
                (row.y[0] - row.t.cos()).abs() < 1e-3,
                "{} at t = {}: {}",
                name,
                row.t,
                row.y[0]
            );
        }
    }
}

#[test]
fn jacobian_aliases_run_the_same_algorithm() {
    for name in &["rk1imp", "rk2imp", "rk4imp", "bsimp", "msbdf"] {
        let plain = solve_with(decay, decay_jacobian, &[1.], &decay_config(name)).unwrap();
        let alias = solve_with(
            decay,
            decay_jacobian,
            &[1.],
            &decay_config(&format!("{}_j", name)),
        )
        .unwrap();
        assert_eq!(plain, alias, "{}", name);
    }
}

#[test]
fn strict_jacobian_shape_error_at_setup() {
    let jacobian = |_: &[HostValue]| vec![HostValue::matrix(vec![vec![-1.]]), HostValue::array(vec![])];
    match solve_with(decay, jacobian, &[1.], &decay_config("msbdf")) {
        Err(SolveError::Callback { source, partial }) => {
            assert_eq!(
                source,
                CallbackError::Shape {
                    part: JacobianPart::Dfdt,
                    measured: 0,
                    required: 1,
                }
            );
            assert!(partial.is_empty());
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn strict_jacobian_shape_error_after_the_initial_row() {
    let jacobian = |_: &[HostValue]| vec![HostValue::matrix(vec![vec![-1., 0.]]), HostValue::array(vec![0.])];
    match solve_with(decay, jacobian, &[1.], &decay_config("bsimp")) {
        Err(SolveError::Callback { source, partial }) => {
            assert_eq!(
                source,
                CallbackError::Shape {
                    part: JacobianPart::DfdyRow(0),
                    measured: 2,
                    required: 1,
                }
            );
            assert_eq!(partial.len(), 1);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn relaxed_validation_trusts_later_jacobians() {
    let calls = Cell::new(0);
    let jacobian = |args: &[HostValue]| {
        calls.set(calls.get() + 1);
        if calls.get() == 1 {
            decay_jacobian(args)
        } else {
            vec![HostValue::matrix(vec![vec![-1., 99.]]), HostValue::array(vec![])]
        }
    };
    let config = SolveConfig {
        validate_every_call: false,
        ..decay_config("rk2imp")
    };
    let solution = solve_with(decay, jacobian, &[1.], &config).unwrap();
    assert!(solution.is_completed());
    assert!(calls.get() > 1);
    assert_abs_diff_eq!(solution.table.last().unwrap().y[0], (-2f64).exp(), epsilon = 1e-5);

    calls.set(0);
    let strict = solve_with(decay, jacobian, &[1.], &decay_config("rk2imp"));
    assert!(matches!(
        strict,
        Err(SolveError::Callback {
            source: CallbackError::Shape { .. },
            ..
        })
    ));
}

#[test]
fn sub_step_limit_is_a_numerical_failure() {
    let config = SolveConfig {
        initial_step: 1e-6,
        max_sub_steps: Some(3),
        ..decay_config("rkf45")
    };
    let solution = solve_with(decay, no_jacobian, &[1.], &config).unwrap();
    assert_eq!(solution.table.len(), 1);
    let failure = solution.failure().unwrap();
    assert_eq!(failure.reporting_index, 1);
    assert_eq!(
        failure.error,
        StepError::TooManySteps {
            limit: 3,
            target: 0.5,
        }
    );
}

#[test]
fn step_size_underflow() {
    let fast = |args: &[HostValue]| vec![HostValue::Float(-50. * args[1].to_number())];
    let config = SolveConfig {
        initial_step: 0.05,
        min_step: 0.05,
        abs_tol: 1e-12,
        rel_tol: 1e-12,
        ..decay_config("rk2")
    };
    let solution = solve_with(fast, no_jacobian, &[1.], &config).unwrap();
    assert_eq!(solution.table.len(), 1);
    let failure = solution.failure().unwrap();
    assert!(matches!(failure.error, StepError::TooSmallStep { .. }));
    assert_eq!(failure.t, 0.);
}

#[test]
fn backward_integration() {
    let config = SolveConfig {
        t0: 1.,
        t1: 0.,
        ..decay_config("rkck")
    };
    let solution = solve_with(decay, no_jacobian, &[(-1f64).exp()], &config).unwrap();
    assert!(solution.is_completed());
    let times = solution.table.times();
    assert_eq!(times.len(), 5);
    for (j, &t) in times.iter().enumerate() {
        assert_eq!(t, 1. - 0.25 * j as f64);
    }
    for row in solution.table.rows() {
        assert_abs_diff_eq!(row.y[0], (-row.t).exp(), epsilon = 1e-6);
    }
}
