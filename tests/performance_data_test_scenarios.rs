use portfolio_data::{
    datastructures::{Cell, PerformanceJob},
    error::StoreError,
    performance_data::PerformanceDataStore,
    Persisted,
};
mod common;
use common::*;
use itertools::Itertools;
use std::{fs, io::Write};

fn fill(store: &mut PerformanceDataStore, solver: &str, values: &[(&str, f64)]) {
    for (instance, value) in values {
        store.set_value(*value, solver, instance, None, None).unwrap();
    }
}

#[test]
fn test_scenario_outstanding_jobs_and_best_solver() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = performance_store(dir.path(), &["A", "B"], &["i1", "i2"], 1);
    assert_eq!(store.get_job_list(false).len(), 4);

    fill(&mut store, "A", &[("i1", 5.0)]);
    fill(&mut store, "B", &[("i1", 3.0)]);
    let jobs = store.get_job_list(false);
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job.instance == "i2"));

    let best = store.best_instance_performance(None, None, &[]).unwrap();
    assert_eq!(best[0], ("i1".to_string(), 3.0));
    assert!(best[1].1.is_nan());
}

#[test]
fn test_scenario_marginal_contribution_with_tie() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = performance_store(dir.path(), &["A", "B"], &["i1", "i2"], 1);
    fill(&mut store, "A", &[("i1", 5.0), ("i2", 10.0)]);
    fill(&mut store, "B", &[("i1", 3.0), ("i2", 10.0)]);
    assert!(store.get_job_list(false).is_empty());
    assert_eq!(store.best_performance(None, &[]).unwrap(), 6.5);

    let contributions = store.marginal_contribution(None, false).unwrap();
    assert_eq!(contributions[0].solver, "A");
    assert_eq!(contributions[0].contribution, 0.0);
    assert_eq!(contributions[0].performance_without, 6.5);
    assert_eq!(contributions[1].solver, "B");
    assert_eq!(contributions[1].performance_without, 7.5);
    assert_eq!(contributions[1].contribution, 7.5 / 6.5);

    let sorted = store.marginal_contribution(None, true).unwrap();
    assert_eq!(sorted.iter().map(|c| c.solver.as_str()).collect_vec(), ["B", "A"]);
}

#[test]
fn test_round_trip_keeps_every_cell() {
    let dir = tempfile::tempdir().unwrap();
    let path = performance_path(dir.path());
    let mut store = PerformanceDataStore::create(
        &path,
        &["A", "B"],
        &objectives("PAR10,cost:min"),
        &["i1", "i2"],
        2,
    )
    .unwrap();
    store
        .set_cell(
            Cell {
                value: 1.25,
                seed: Some(42),
                configuration: Some("-alpha 0.5".into()),
            },
            "A",
            "i1",
            Some("cost:min"),
            Some(2),
        )
        .unwrap();
    store.set_value(0.1, "B", "i2", Some("PAR10"), Some(1)).unwrap();
    store.save(std::time::Duration::from_secs(1)).unwrap();
    assert_eq!(PerformanceDataStore::load(&path).unwrap(), store);
}

#[test]
fn test_duplicate_rows_keep_last() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = performance_store(dir.path(), &["A"], &["i1"], 1);
    fill(&mut store, "A", &[("i1", 5.0)]);
    store.write_unlocked().unwrap();
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(performance_path(dir.path()))
        .unwrap();
    writeln!(file, "PAR10,i1,1,A,42.0,,").unwrap();
    drop(file);
    let loaded = PerformanceDataStore::load(&performance_path(dir.path())).unwrap();
    assert_eq!(loaded.get_value("A", "i1", None, None).unwrap(), 42.0);
}

#[test]
fn test_malformed_file_is_structural_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = performance_path(dir.path());
    fs::write(&path, "objective,instance,run\nPAR10,i1,1\n").unwrap();
    let err = PerformanceDataStore::load(&path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Structural { .. })
    ));
    // unreadable data is never silently replaced
    assert!(PerformanceDataStore::create(&path, &["A"], &objectives("PAR10"), &["i1"], 1).is_err());
}

fn assert_structural(err: anyhow::Error) {
    assert!(
        matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Structural { .. })
        ),
        "{err}"
    );
}

#[test]
fn test_row_cut_mid_write_fails_loudly() {
    let dir = tempfile::tempdir().unwrap();
    let path = performance_path(dir.path());
    let mut store = performance_store(dir.path(), &["A", "B"], &["i1"], 1);
    fill(&mut store, "B", &[("i1", 7.0)]);
    store.write_unlocked().unwrap();
    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(file, "PAR10,i1,1,A,42.0,,").unwrap();
    drop(file);
    let content = fs::read_to_string(&path).unwrap();
    let cut = content.rfind("42.0").unwrap();
    fs::write(&path, &content[..cut]).unwrap();
    assert_structural(PerformanceDataStore::load(&path).unwrap_err());

    // every field present but the row never finished
    fs::write(&path, content.trim_end_matches('\n')).unwrap();
    assert_structural(PerformanceDataStore::load(&path).unwrap_err());
}

#[test]
fn test_empty_key_cell_fails_loudly() {
    let dir = tempfile::tempdir().unwrap();
    let path = performance_path(dir.path());
    let mut store = performance_store(dir.path(), &["A"], &["i1"], 1);
    fill(&mut store, "A", &[("i1", 5.0)]);
    store.write_unlocked().unwrap();
    let content = fs::read_to_string(&path).unwrap();
    assert!(content.contains("PAR10,i1,1,A,"));
    fs::write(&path, content.replace("PAR10,i1,1,A,", "PAR10,i1,1,,")).unwrap();
    assert_structural(PerformanceDataStore::load(&path).unwrap_err());
}

#[test]
fn test_empty_dimensions_survive_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let path = performance_path(dir.path());
    let mut store = performance_store(dir.path(), &["A"], &["i1"], 1);
    store.remove_solver("A").unwrap();
    store.remove_instance("i1").unwrap();
    assert!(store.solvers().is_empty());
    assert!(store.get_job_list(true).is_empty());
    store.write_unlocked().unwrap();

    let mut loaded = PerformanceDataStore::load(&path).unwrap();
    assert_eq!(loaded, store);
    loaded.add_solver("B", None).unwrap();
    loaded.add_instance("i2", None).unwrap();
    loaded.add_solver("C", Some(1.0)).unwrap();
    assert_eq!(loaded.solvers(), &["B", "C"]);
    assert_eq!(
        loaded.get_job_list(false),
        vec![PerformanceJob {
            instance: "i2".into(),
            run: 1,
            solver: "B".into(),
        }]
    );
}

#[test]
fn test_setting_every_cell_completes_the_job_list() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = performance_store(dir.path(), &["A", "B"], &["i1", "i2"], 2);
    let all_jobs = store.get_job_list(true);
    assert_eq!(all_jobs.len(), 8);
    for job in &all_jobs {
        let before = store.get_job_list(false);
        store
            .set_value(1.0, &job.solver, &job.instance, None, Some(job.run))
            .unwrap();
        let after = store.get_job_list(false);
        assert_eq!(after.len(), before.len() - 1);
        assert!(!after.contains(job));
    }
    assert!(store.get_job_list(false).is_empty());
    assert_eq!(store.get_job_list(true), all_jobs);
    assert!(store.remaining_jobs().is_empty());
}

#[test]
fn test_removing_solvers_never_improves_the_virtual_best() {
    let dir = tempfile::tempdir().unwrap();
    let solvers = ["A", "B", "C"];
    let instances = ["i1", "i2", "i3", "i4"];
    let mut store = performance_store(dir.path(), &solvers, &instances, 1);
    for (s, solver) in solvers.iter().enumerate() {
        for (i, instance) in instances.iter().enumerate() {
            let value = ((s * 7 + i * 3) % 5) as f64 + 1.0;
            store.set_value(value, solver, instance, None, None).unwrap();
        }
    }
    let best = store.best_performance(None, &[]).unwrap();
    for size in 1..solvers.len() {
        for excluded in solvers.iter().copied().combinations(size) {
            let without = store.best_performance(None, &excluded).unwrap();
            assert!(without >= best, "excluding {excluded:?}: {without} < {best}");
        }
    }
}

#[test]
fn test_dominated_solver_contributes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = performance_store(dir.path(), &["A", "B", "C"], &["i1", "i2", "i3"], 1);
    fill(&mut store, "A", &[("i1", 1.0), ("i2", 9.0), ("i3", 5.0)]);
    fill(&mut store, "B", &[("i1", 4.0), ("i2", 2.0), ("i3", 6.0)]);
    fill(&mut store, "C", &[("i1", 5.0), ("i2", 3.0), ("i3", 7.0)]);
    let contributions = store.marginal_contribution(None, true).unwrap();
    let c = contributions.iter().find(|c| c.solver == "C").unwrap();
    assert_eq!(c.contribution, 0.0);
    assert!(contributions[0].contribution > 1.0);
}

#[test]
fn test_multi_run_store_demands_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = performance_store(dir.path(), &["A"], &["i1"], 2);
    let err = store.get_value("A", "i1", None, None).unwrap_err();
    assert_eq!(
        err.downcast_ref::<StoreError>(),
        Some(&StoreError::AmbiguousIndex {
            dimension: "run",
            count: 2
        })
    );
    assert!(store
        .to_external_format(None, &dir.path().join("export.csv"))
        .is_err());
}

#[test]
fn test_external_export_is_flat() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = performance_store(dir.path(), &["A", "B"], &["i1", "i2"], 1);
    fill(&mut store, "A", &[("i1", 5.0)]);
    let target = dir.path().join("export.csv");
    store.to_external_format(None, &target).unwrap();
    let exported = fs::read_to_string(&target).unwrap();
    let lines = exported.lines().collect_vec();
    assert_eq!(lines[0], "instance,A,B");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("i1,5"));
}
