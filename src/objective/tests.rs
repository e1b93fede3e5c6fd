use super::*;

#[test]
fn test_parse_par() {
    let objective: Objective = "PAR10".parse().unwrap();
    assert_eq!(objective.name, "PAR10");
    assert!(objective.minimise);
    assert!(objective.is_runtime());
    assert_eq!(objective.penalty_factor, Some(10));
    assert_eq!(objective.solver_aggregator, Aggregator::Min);
}

#[test]
fn test_parse_quality_directions() {
    let max: Objective = "accuracy:max".parse().unwrap();
    assert!(!max.minimise);
    assert!(!max.is_runtime());
    assert_eq!(max.solver_aggregator, Aggregator::Max);
    let min: Objective = "quality:min".parse().unwrap();
    assert!(min.minimise);
    let bare: Objective = "cost".parse().unwrap();
    assert!(bare.minimise);
    assert!("quality:sideways".parse::<Objective>().is_err());
    assert!("".parse::<Objective>().is_err());
}

#[test]
fn test_parse_list() {
    let objectives = Objective::parse_list("PAR10, quality:max,").unwrap();
    assert_eq!(
        objectives.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
        vec!["PAR10", "quality:max"]
    );
}

#[test]
fn test_post_process_penalizes_failures() {
    let objective: Objective = "PAR10".parse().unwrap();
    assert_eq!(objective.post_process(12.0, 60.0, SolverStatus::Success), 12.0);
    assert_eq!(objective.post_process(12.0, 60.0, SolverStatus::Timeout), 600.0);
    assert_eq!(objective.post_process(61.0, 60.0, SolverStatus::Sat), 600.0);
    let quality: Objective = "quality:min".parse().unwrap();
    assert_eq!(quality.post_process(61.0, 60.0, SolverStatus::Crashed), 61.0);
}

#[test]
fn test_aggregators() {
    let values = [4.0, 1.0, 2.0, 1.0];
    assert_eq!(Aggregator::Mean.apply(&values), 2.0);
    assert_eq!(Aggregator::Median.apply(&values), 1.5);
    assert_eq!(Aggregator::Sum.apply(&values), 8.0);
    assert_eq!(Aggregator::Min.apply(&values), 1.0);
    assert_eq!(Aggregator::Max.apply(&values), 4.0);
    assert!((Aggregator::GMean.apply(&[2.0, 8.0]) - 4.0).abs() < 1e-12);
    assert!(Aggregator::Mean.apply(&[1.0, f64::NAN]).is_nan());
    assert!(Aggregator::Min.apply(&[]).is_nan());
    assert_eq!(Aggregator::Sum.apply(&[]), 0.0);
}

#[test]
fn test_solver_status_from_str() {
    assert_eq!("timeout".parse::<SolverStatus>().unwrap(), SolverStatus::Timeout);
    assert!("SAT".parse::<SolverStatus>().unwrap().is_positive());
    assert!(!SolverStatus::Killed.is_positive());
    assert!("FINE".parse::<SolverStatus>().is_err());
}
