//! End-to-end runs of the manager/worker protocol on in-process ranks.
//!
//! Assertions stay outside the manager closure: a panic on the manager
//! would leave the worker threads waiting for a signal forever.

mod util;

use combigrid_dist::combination::{CombiParameters, CombinationScheme};
use combigrid_dist::levels::LevelVector;
use combigrid_dist::manager::{
    run_local, DecayTaskSpec, FunctionTaskSpec, Signal, Status, SystemConfig, TaskDescriptor, TaskSpec,
    TestFunction,
};
use combigrid_dist::CombiError;
use serial_test::serial;
use util::{assert_close, sampled};

fn linear() -> TestFunction {
    TestFunction::Linear {
        offset: 0.5,
        slopes: vec![1.5, -2.0],
    }
}

fn linear_at(x: &[f64]) -> f64 {
    0.5 + 1.5 * x[0] - 2.0 * x[1]
}

/// Tasks for every grid of `scheme` plus matching parameters.
fn setup(scheme: &CombinationScheme, spec: TaskSpec) -> (Vec<TaskDescriptor>, CombiParameters) {
    let boundary = vec![true; scheme.dim()];
    let tasks: Vec<TaskDescriptor> = scheme
        .iter()
        .map(|(l, c)| TaskDescriptor::new(l.clone(), boundary.clone(), c, spec.clone()).unwrap())
        .collect();
    let ids: Vec<_> = tasks.iter().map(TaskDescriptor::id).collect();
    let params = CombiParameters::from_scheme(scheme, boundary, &ids).unwrap();
    (tasks, params)
}

fn scheme() -> CombinationScheme {
    CombinationScheme::new(LevelVector::from([2, 2]), LevelVector::from([4, 4])).unwrap()
}

#[test]
#[serial]
fn full_cycle_reproduces_a_linear_function() {
    let (tasks, params) = setup(&scheme(), TaskSpec::Function(FunctionTaskSpec { function: linear() }));
    let n_tasks = tasks.len();
    let points = vec![vec![0.25, 0.5], vec![0.9, 0.1], vec![0.0, 1.0]];
    let fine = LevelVector::from([5, 5]);

    let (values, combined, gathered, states) = run_local(SystemConfig::new(2, 2), |m| {
        m.update_combi_parameters(params.clone())?;
        m.run_first(tasks.clone())?;
        m.combine()?;
        let values = m.eval(&points)?;
        let combined = m.combine_fg(&fine)?;
        let gathered = m.grid_gather(&LevelVector::from([3, 3]))?;
        let states = m.sync_tasks()?;
        Ok((values, combined, gathered, states))
    })
    .unwrap();

    for (v, x) in values.iter().zip(&points) {
        assert_close(*v, linear_at(x), 1e-12);
    }
    let exact = sampled(&fine, &[true, true], linear_at);
    assert!(combined.max_abs_diff(&exact).unwrap() < 1e-12);
    let gathered = gathered.expect("level (3, 3) is part of the scheme");
    assert!(!gathered.is_hierarchized());
    assert!(gathered.max_abs_diff(&sampled(&LevelVector::from([3, 3]), &[true, true], linear_at)).unwrap() < 1e-12);
    assert_eq!(states.len(), n_tasks);
    assert!(states.iter().all(|s| s.base.steps == 1 && s.base.finished));
}

#[test]
#[serial]
fn run_first_balances_estimated_load() {
    let (tasks, params) = setup(&scheme(), TaskSpec::Function(FunctionTaskSpec { function: linear() }));
    let placed = run_local(SystemConfig::new(2, 1), |m| {
        m.update_combi_parameters(params.clone())?;
        m.run_first(tasks.clone())?;
        Ok(m.groups().iter().map(|g| (g.tasks().len(), g.load())).collect::<Vec<_>>())
    })
    .unwrap();
    // 85, 85, 81, 45 and 45 points: {85, 81} and {85, 45, 45}
    let loads: Vec<f64> = placed.iter().map(|&(_, l)| l).collect();
    assert_eq!(loads, vec![166.0, 175.0]);
    assert_eq!(placed.iter().map(|&(n, _)| n).sum::<usize>(), 5);
}

#[test]
#[serial]
fn run_next_advances_every_task() {
    let spec = TaskSpec::Decay(DecayTaskSpec {
        initial: TestFunction::Constant(1.0),
        rate: 2.0,
        dt: 0.25,
    });
    let (tasks, params) = setup(&scheme(), spec);
    let (states, grid) = run_local(SystemConfig::new(2, 2), |m| {
        m.update_combi_parameters(params.clone())?;
        m.run_first(tasks.clone())?;
        m.run_next()?;
        m.run_next()?;
        Ok((m.sync_tasks()?, m.grid_gather(&LevelVector::from([2, 4]))?))
    })
    .unwrap();
    assert!(states.iter().all(|s| s.base.steps == 3 && s.base.finished));
    let want = (-1.5f64).exp();
    assert!(grid.unwrap().data().iter().all(|v| (v - want).abs() < 1e-14));
}

#[test]
#[serial]
fn recompute_seeds_from_the_combined_solution() {
    let spec = TaskSpec::Decay(DecayTaskSpec {
        initial: linear(),
        rate: 1.0,
        dt: 0.1,
    });
    let (tasks, params) = setup(&scheme(), spec.clone());
    // (2, 2) lies below the scheme; its subspaces are all in the target
    let spare = TaskDescriptor::new(LevelVector::from([2, 2]), vec![true, true], 0.0, spec).unwrap();
    let spare_id = spare.id();

    let (early, group, placed, grid) = run_local(SystemConfig::new(2, 2), |m| {
        m.update_combi_parameters(params.clone())?;
        m.run_first(tasks.clone())?;
        let early = m.recompute(spare.clone()).map(|_| ());
        m.combine()?;
        let group = m.recompute(spare.clone())?;
        Ok((early, group, m.group_of(spare_id), m.grid_gather(&LevelVector::from([2, 2]))?))
    })
    .unwrap();

    assert!(matches!(early, Err(CombiError::NoCombinationTarget)));
    assert_eq!(placed, Some(group));
    // combined at one step, then one more step on the recomputed grid
    let factor = (-0.2f64).exp();
    let want = sampled(&LevelVector::from([2, 2]), &[true, true], |x| factor * linear_at(x));
    assert!(grid.unwrap().max_abs_diff(&want).unwrap() < 1e-12);
}

#[test]
#[serial]
fn added_tasks_are_not_finished_until_run() {
    let (mut tasks, params) = setup(&scheme(), TaskSpec::Function(FunctionTaskSpec { function: linear() }));
    let extra = tasks.pop().unwrap();
    let extra_id = extra.id();
    let states = run_local(SystemConfig::new(2, 1), |m| {
        m.update_combi_parameters(params.clone())?;
        m.run_first(tasks.clone())?;
        m.add_task(extra.clone())?;
        m.sync_tasks()
    })
    .unwrap();
    for s in &states {
        assert_eq!(s.base.finished, s.id() != extra_id, "task {}", s.id());
    }
}

#[test]
#[serial]
fn failing_handlers_are_reported_and_groups_stay_usable() {
    let (tasks, params) = setup(&scheme(), TaskSpec::Function(FunctionTaskSpec { function: linear() }));
    let (failed, after) = run_local(SystemConfig::new(2, 2), |m| {
        m.update_combi_parameters(params.clone())?;
        m.run_first(tasks.clone())?;
        // one coordinate for two-dimensional grids
        let failed = m.eval(&[vec![0.5]]);
        let after = m.eval(&[vec![0.5, 0.5]])?;
        Ok((failed, after))
    })
    .unwrap();
    assert!(matches!(failed, Err(CombiError::GroupFailed { .. })));
    assert_close(after[0], linear_at(&[0.5, 0.5]), 1e-12);

    // a driver that stops on the failure still shuts the workers down
    let r = run_local(SystemConfig::new(1, 1), |m| {
        m.update_combi_parameters(params.clone())?;
        m.run_first(tasks.clone())?;
        m.eval(&[vec![0.5]])
    });
    assert!(matches!(r, Err(CombiError::GroupFailed { group: 0 })));
}

#[test]
#[serial]
fn busy_groups_reject_signals() {
    let (first, second, status) = run_local(SystemConfig::new(2, 1), |m| {
        let g = m.group_mut(0).ok_or(CombiError::NoTasks)?;
        let first = g.send_signal(Signal::RunNext, &[]);
        let second = g.send_signal(Signal::RunNext, &[]);
        g.wait_status()?;
        Ok((first, second, g.status()?))
    })
    .unwrap();
    assert!(first.is_ok());
    assert!(matches!(second, Err(CombiError::GroupBusy { group: 0 })));
    assert_eq!(status, Status::Wait);
}

#[test]
#[serial]
fn sequencing_violations_are_reported() {
    let r = run_local(SystemConfig::new(1, 2), |m| m.combine());
    assert!(matches!(r, Err(CombiError::NoTasks)));

    let (tasks, _) = setup(&scheme(), TaskSpec::Function(FunctionTaskSpec { function: linear() }));
    let r = run_local(SystemConfig::new(1, 2), |m| {
        m.run_first(tasks.clone())?;
        m.combine()
    });
    assert!(matches!(r, Err(CombiError::MissingCombiParameters)));

    let missing = run_local(SystemConfig::new(2, 1), |m| m.grid_gather(&LevelVector::from([1, 1]))).unwrap();
    assert!(missing.is_none());
}
