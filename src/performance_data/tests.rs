use super::*;
use crate::objective::Aggregator;

fn objectives(spec: &str) -> Vec<Objective> {
    Objective::parse_list(spec).unwrap()
}

fn store(solvers: &[&str], instances: &[&str], n_runs: u32) -> PerformanceDataStore {
    PerformanceDataStore::new(
        Path::new("performance_data.csv"),
        solvers,
        &objectives("PAR10"),
        instances,
        n_runs,
    )
    .unwrap()
}

fn store_error(err: anyhow::Error) -> StoreError {
    err.downcast_ref::<StoreError>().cloned().unwrap()
}

#[test]
fn test_new_sorts_dimensions() {
    let store = store(&["B", "A", "B"], &["i2", "i1"], 2);
    assert_eq!(store.solvers(), &["A", "B"]);
    assert_eq!(store.instances(), &["i1", "i2"]);
    assert_eq!(store.runs(), &[1, 2]);
    assert!(store.has_missing_values());
}

#[test]
fn test_new_rejects_degenerate_dimensions() {
    let path = Path::new("x.csv");
    assert!(PerformanceDataStore::new(path, &["A"], &[], &["i1"], 1).is_err());
    assert!(
        PerformanceDataStore::new(path, &["A"], &objectives("PAR10"), &["i1"], 0)
            .is_err()
    );
    assert!(PerformanceDataStore::new(
        path,
        &["A"],
        &objectives("PAR10,PAR10"),
        &["i1"],
        1
    )
    .is_err());
}

#[test]
fn test_ambiguous_indexing_fails() {
    let mut store = PerformanceDataStore::new(
        Path::new("x.csv"),
        &["A"],
        &objectives("PAR10,quality:max"),
        &["i1"],
        2,
    )
    .unwrap();
    let err = store.get_value("A", "i1", None, Some(1)).unwrap_err();
    assert_eq!(
        store_error(err),
        StoreError::AmbiguousIndex {
            dimension: "objective",
            count: 2
        }
    );
    let err = store
        .set_value(1.0, "A", "i1", Some("PAR10"), None)
        .unwrap_err();
    assert_eq!(
        store_error(err),
        StoreError::AmbiguousIndex {
            dimension: "run",
            count: 2
        }
    );
    store.set_value(1.0, "A", "i1", Some("PAR10"), Some(2)).unwrap();
    assert_eq!(store.get_value("A", "i1", Some("PAR10"), Some(2)).unwrap(), 1.0);
    assert!(store.best_performance(None, &[]).is_err());
    let err = store.get_value("A", "i1", Some("cost"), Some(1)).unwrap_err();
    assert_eq!(store_error(err), StoreError::UnknownObjective("cost".into()));
    let err = store.get_value("C", "i1", Some("PAR10"), Some(1)).unwrap_err();
    assert_eq!(store_error(err), StoreError::UnknownSolver("C".into()));
}

#[test]
fn test_get_values_spans_unspecified_dimensions() {
    let mut store = store(&["A"], &["i1", "i2"], 2);
    store.set_value(1.0, "A", "i1", None, Some(1)).unwrap();
    store.set_value(2.0, "A", "i1", None, Some(2)).unwrap();
    store.set_value(3.0, "A", "i2", None, Some(1)).unwrap();
    let values = store.get_values("A", None, None, None).unwrap();
    assert_eq!(values.len(), 4);
    assert_eq!(&values[..3], &[1.0, 2.0, 3.0]);
    assert!(values[3].is_nan());
    assert_eq!(store.get_values("A", Some("i1"), None, None).unwrap(), vec![1.0, 2.0]);
    assert_eq!(store.get_values("A", None, None, Some(1)).unwrap(), vec![1.0, 3.0]);
}

#[test]
fn test_structural_mutation_keeps_values() {
    let mut store = store(&["B"], &["i1"], 1);
    store.set_value(4.0, "B", "i1", None, None).unwrap();
    store.add_solver("A", Some(1.0)).unwrap();
    store.add_solver("C", None).unwrap();
    store.add_solver("A", None).unwrap();
    assert_eq!(store.solvers(), &["A", "B", "C"]);
    assert_eq!(store.get_value("A", "i1", None, None).unwrap(), 1.0);
    assert_eq!(store.get_value("B", "i1", None, None).unwrap(), 4.0);
    assert!(store.get_value("C", "i1", None, None).unwrap().is_nan());

    store.add_instance("i0", None).unwrap();
    assert_eq!(store.instances(), &["i0", "i1"]);
    assert_eq!(store.get_value("B", "i1", None, None).unwrap(), 4.0);

    store.remove_solver("A").unwrap();
    store.remove_solver("missing").unwrap();
    store.remove_instance("i0").unwrap();
    assert_eq!(store.solvers(), &["B", "C"]);
    assert_eq!(store.get_value("B", "i1", None, None).unwrap(), 4.0);
}

#[test]
fn test_objective_and_run_dimensions() {
    let mut store = store(&["A"], &["i1"], 1);
    store.set_value(2.0, "A", "i1", None, None).unwrap();
    store.add_objective("quality:max".parse().unwrap()).unwrap();
    assert!(store.is_multi_objective());
    assert_eq!(store.get_value("A", "i1", Some("PAR10"), None).unwrap(), 2.0);
    assert!(store.get_value("A", "i1", Some("quality:max"), None).unwrap().is_nan());

    store.add_runs(2).unwrap();
    assert_eq!(store.runs(), &[1, 2, 3]);
    store
        .set_value(5.0, "A", "i1", Some("quality:max"), Some(2))
        .unwrap();
    store.remove_empty_runs().unwrap();
    assert_eq!(store.runs(), &[1, 2]);
    store.remove_runs(5).unwrap();
    assert_eq!(store.runs(), &[1]);

    store.filter_objectives(&["quality:max"]).unwrap();
    assert_eq!(store.objectives().len(), 1);
    assert!(store.remove_objective("quality:max").is_err());
}

#[test]
fn test_job_list_order_and_rerun() {
    let mut store = store(&["A", "B"], &["i1", "i2"], 2);
    assert_eq!(store.get_job_list(false).len(), 8);
    for run in [1, 2] {
        for solver in ["A", "B"] {
            store.set_value(1.0, solver, "i1", None, Some(run)).unwrap();
        }
    }
    store.set_value(1.0, "B", "i2", None, Some(1)).unwrap();
    let jobs = store.get_job_list(false);
    assert_eq!(
        jobs,
        vec![
            PerformanceJob {
                instance: "i2".into(),
                run: 1,
                solver: "A".into()
            },
            PerformanceJob {
                instance: "i2".into(),
                run: 2,
                solver: "A".into()
            },
            PerformanceJob {
                instance: "i2".into(),
                run: 2,
                solver: "B".into()
            },
        ]
    );
    assert_eq!(store.get_job_list(true).len(), 8);
    let remaining = store.remaining_jobs();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining["i2"], vec!["A".to_string(), "B".to_string()]);
    assert!(store.is_missing("A", "i2").unwrap());
    assert!(!store.is_missing("A", "i1").unwrap());
}

#[test]
fn test_best_instance_performance_ignores_missing() {
    let mut store = store(&["A", "B"], &["i1", "i2", "i3"], 2);
    store.set_value(5.0, "A", "i1", None, Some(1)).unwrap();
    store.set_value(2.0, "A", "i1", None, Some(2)).unwrap();
    store.set_value(3.0, "B", "i1", None, Some(1)).unwrap();
    store.set_value(7.0, "B", "i2", None, Some(2)).unwrap();
    let best = store.best_instance_performance(None, None, &[]).unwrap();
    assert_eq!(best[0], ("i1".to_string(), 2.0));
    assert_eq!(best[1], ("i2".to_string(), 7.0));
    assert!(best[2].1.is_nan());

    let run_one = store.best_instance_performance(None, Some(1), &["B"]).unwrap();
    assert_eq!(run_one[0], ("i1".to_string(), 5.0));
    assert!(run_one[1].1.is_nan());
    assert!(store.best_instance_performance(None, None, &["Z"]).is_err());
}

#[test]
fn test_best_performance_maximise() {
    let mut store = PerformanceDataStore::new(
        Path::new("x.csv"),
        &["A", "B"],
        &objectives("accuracy:max"),
        &["i1", "i2"],
        1,
    )
    .unwrap();
    for (solver, instance, value) in
        [("A", "i1", 0.5), ("B", "i1", 0.9), ("A", "i2", 0.7), ("B", "i2", 0.1)]
    {
        store.set_value(value, solver, instance, None, None).unwrap();
    }
    assert!((store.best_performance(None, &[]).unwrap() - 0.8).abs() < 1e-12);
    let contributions = store.marginal_contribution(None, true).unwrap();
    assert_eq!(contributions[0].solver, "A");
    assert!((contributions[0].performance_without - 0.5).abs() < 1e-12);
    assert!((contributions[1].performance_without - 0.6).abs() < 1e-12);
    assert!(contributions[0].contribution < contributions[1].contribution);
}

#[test]
fn test_solver_ranking() {
    let mut store = store(&["A", "B", "C"], &["i1", "i2"], 1);
    for (solver, instance, value) in
        [("A", "i1", 4.0), ("A", "i2", 4.0), ("B", "i1", 1.0), ("B", "i2", 5.0)]
    {
        store.set_value(value, solver, instance, None, None).unwrap();
    }
    let ranking = store.get_solver_ranking(None).unwrap();
    assert_eq!(ranking[0], ("B".to_string(), 3.0));
    assert_eq!(ranking[1], ("A".to_string(), 4.0));
    assert_eq!(ranking[2].0, "C");
    assert!(ranking[2].1.is_nan());
}

#[test]
fn test_schedule_performance_runtime() {
    let mut store = store(&["A", "B"], &["i1", "i2"], 1);
    for (solver, instance, value) in
        [("A", "i1", 50.0), ("B", "i1", 2.0), ("A", "i2", 1.0), ("B", "i2", 9.0)]
    {
        store.set_value(value, solver, instance, None, None).unwrap();
    }
    let schedule = BTreeMap::from([
        (
            "i1".to_string(),
            vec![ScheduleStep::new("A", Some(10.0)), ScheduleStep::new("B", None)],
        ),
        (
            "i2".to_string(),
            vec![ScheduleStep::new("A", Some(10.0)), ScheduleStep::new("B", None)],
        ),
    ]);
    let performance = store
        .schedule_performance(&schedule, Some("selector"), None, None)
        .unwrap();
    assert_eq!(
        performance,
        vec![("i1".to_string(), 12.0), ("i2".to_string(), 1.0)]
    );
    assert_eq!(store.get_value("selector", "i1", None, None).unwrap(), 12.0);

    let budgeted = store
        .schedule_performance(&schedule, None, None, Some(9.0))
        .unwrap();
    assert_eq!(budgeted[0], ("i1".to_string(), 10.0));
    // spending exactly the budget still allows the next attempt
    let budgeted = store
        .schedule_performance(&schedule, None, None, Some(10.0))
        .unwrap();
    assert_eq!(budgeted[0], ("i1".to_string(), 12.0));
}

#[test]
fn test_schedule_attempt_finishing_at_its_cutoff_succeeds() {
    let mut store = store(&["A", "B"], &["i1"], 1);
    store.set_value(30.0, "A", "i1", None, None).unwrap();
    store.set_value(5.0, "B", "i1", None, None).unwrap();
    let schedule = BTreeMap::from([(
        "i1".to_string(),
        vec![ScheduleStep::new("A", Some(30.0)), ScheduleStep::new("B", None)],
    )]);
    let performance = store
        .schedule_performance(&schedule, None, None, Some(60.0))
        .unwrap();
    assert_eq!(performance, vec![("i1".to_string(), 30.0)]);
}

#[test]
fn test_schedule_performance_quality() {
    let mut store = PerformanceDataStore::new(
        Path::new("x.csv"),
        &["A", "B"],
        &objectives("quality:min"),
        &["i1"],
        1,
    )
    .unwrap();
    store.set_value(3.0, "A", "i1", None, None).unwrap();
    store.set_value(2.0, "B", "i1", None, None).unwrap();
    let schedule = BTreeMap::from([(
        "i1".to_string(),
        vec![ScheduleStep::new("A", None), ScheduleStep::new("B", None)],
    )]);
    let performance = store.schedule_performance(&schedule, None, None, None).unwrap();
    assert_eq!(performance, vec![("i1".to_string(), 2.0)]);
}

#[test]
fn test_penalise_and_mean() {
    let mut store = store(&["A", "B"], &["i1"], 1);
    store.set_value(70.0, "A", "i1", None, None).unwrap();
    store.set_value(2.0, "B", "i1", None, None).unwrap();
    store.penalise(60.0, 600.0, None, false).unwrap();
    assert_eq!(store.get_value("A", "i1", None, None).unwrap(), 600.0);
    assert_eq!(store.mean(None, None, None).unwrap(), 301.0);
    assert_eq!(store.mean(None, Some("B"), Some("i1")).unwrap(), 2.0);
    store.penalise(5.0, 0.0, None, true).unwrap();
    assert_eq!(store.get_value("B", "i1", None, None).unwrap(), 0.0);

    store.clean();
    assert!(store.mean(None, None, None).unwrap().is_nan());
    assert_eq!(store.get_job_list(false).len(), 2);
}

#[test]
fn test_reset_value_clears_seed_and_configuration() {
    let mut store = store(&["A"], &["i1"], 1);
    let cell = Cell {
        value: 3.0,
        seed: Some(42),
        configuration: Some("-alpha 1".into()),
    };
    store.set_cell(cell.clone(), "A", "i1", None, None).unwrap();
    store.set_value(4.0, "A", "i1", None, None).unwrap();
    assert_eq!(store.get_cell("A", "i1", None, None).unwrap().seed, Some(42));
    store.reset_value("A", "i1", None, None).unwrap();
    assert_eq!(store.get_cell("A", "i1", None, None).unwrap(), &Cell::default());
}

#[test]
fn test_external_frame() {
    let mut store = store(&["A", "B"], &["i1", "i2"], 1);
    store.set_value(1.5, "A", "i1", None, None).unwrap();
    let df = store.to_external_frame(None).unwrap();
    assert_eq!(df.get_column_names(), vec!["instance", "A", "B"]);
    assert_eq!(df.height(), 2);
    assert_eq!(df.column("B").unwrap().null_count(), 2);

    store.add_runs(1).unwrap();
    let err = store.to_external_frame(None).unwrap_err();
    assert!(matches!(
        store_error(err),
        StoreError::AmbiguousIndex { dimension: "run", .. }
    ));
}

#[test]
fn test_gmean_instance_aggregator() {
    let mut objective: Objective = "PAR10".parse().unwrap();
    objective.instance_aggregator = Aggregator::GMean;
    let mut store = PerformanceDataStore::new(
        Path::new("x.csv"),
        &["A"],
        &[objective],
        &["i1", "i2"],
        1,
    )
    .unwrap();
    store.set_value(2.0, "A", "i1", None, None).unwrap();
    store.set_value(8.0, "A", "i2", None, None).unwrap();
    assert!((store.best_performance(None, &[]).unwrap() - 4.0).abs() < 1e-12);
}
