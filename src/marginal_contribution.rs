use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    datastructures::{is_missing, Contribution, Instance, ScheduleStep, Settings},
    feature_data::FeatureDataStore,
    lock::{atomic_write, Persisted, DEFAULT_LOCK_TIMEOUT},
    objective::Objective,
    performance_data::{sort_contributions, PerformanceDataStore},
    selector::{Selector, SelectorScenario},
};

/// Substitution of missing or failed values before aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenaltyPolicy {
    pub cutoff_time: f64,
    pub penalty_multiplier: f64,
    /// Replaces missing quality values and bounds values worse than it.
    pub cap_value: Option<f64>,
}

impl PenaltyPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cutoff_time: settings.cutoff_time,
            penalty_multiplier: settings.penalty_multiplier,
            cap_value: settings.cap_value,
        }
    }

    pub fn penalty(&self) -> f64 {
        self.cutoff_time * self.penalty_multiplier
    }

    pub fn apply(&self, objective: &Objective, value: f64) -> f64 {
        if objective.is_runtime() {
            if is_missing(value) || value > self.cutoff_time {
                self.penalty()
            } else {
                value
            }
        } else {
            match self.cap_value {
                Some(cap) if is_missing(value) || objective.is_better(cap, value) => cap,
                _ => value,
            }
        }
    }

    /// Copy of `store` with this policy applied to one objective.
    pub fn penalised(
        &self,
        store: &PerformanceDataStore,
        objective: Option<&str>,
    ) -> Result<PerformanceDataStore> {
        let mut penalised = store.clone();
        let objective = penalised.verify_objective(objective)?.clone();
        penalised.map_values(Some(&objective.name), |v| self.apply(&objective, v))?;
        Ok(penalised)
    }
}

/// Marginal contribution of each solver to an oracle portfolio, computed on
/// the penalised ground truth.
pub fn compute_perfect_selector_marginal_contribution(
    performance: &PerformanceDataStore,
    objective: Option<&str>,
    policy: &PenaltyPolicy,
) -> Result<Vec<Contribution>> {
    let penalised = policy.penalised(performance, objective)?;
    penalised.marginal_contribution(objective, true)
}

/// Score of a trained selector: predicted schedules evaluated against the
/// stored values, penalised per instance, then aggregated over instances.
pub fn compute_selector_performance(
    selector: &dyn Selector,
    model: &Path,
    performance: &PerformanceDataStore,
    features: &FeatureDataStore,
    objective: &Objective,
    policy: &PenaltyPolicy,
) -> Result<f64> {
    let mut schedules = BTreeMap::<Instance, Vec<ScheduleStep>>::new();
    for instance in performance.instances() {
        let feature_vector = features.get_instance(instance)?;
        let schedule = selector.predict(model, instance, &feature_vector)?;
        debug!("Schedule for {instance}: {schedule:?}");
        schedules.insert(instance.clone(), schedule);
    }
    let budget = objective.is_runtime().then_some(policy.cutoff_time);
    // Evaluation needs `&mut` only for writing a target solver.
    let per_instance = performance.clone().schedule_performance(
        &schedules,
        None,
        Some(&objective.name),
        budget,
    )?;
    let penalised = per_instance
        .into_iter()
        .map(|(_, v)| policy.apply(objective, v))
        .collect::<Vec<_>>();
    Ok(objective.instance_aggregator.apply(&penalised))
}

/// Contribution of a solver given the selector score with and without it.
fn contribution_ratio(
    solver: &str,
    objective: &Objective,
    with: f64,
    without: f64,
) -> f64 {
    if without == with {
        0.0
    } else if objective.is_better(without, with) {
        warn!(
            "Selector without {solver} performs better ({without} vs {with}), \
             the selector is dubious; contribution set to 0"
        );
        0.0
    } else {
        without / with
    }
}

/// Marginal contribution of each solver to a selector actually trained by
/// `selector`, one ablated selector per solver.
///
/// Features are imputed on a copy before training. The ablated performance
/// data is kept as `performance_store.csv` in each ablation directory.
pub fn compute_actual_selector_marginal_contribution(
    selector: &dyn Selector,
    scenario: &SelectorScenario,
    performance: &PerformanceDataStore,
    features: &FeatureDataStore,
    policy: &PenaltyPolicy,
) -> Result<Vec<Contribution>> {
    let objective = &scenario.objective;
    let mut features = features.clone();
    if features.has_missing_value() {
        features.impute_missing_values();
    }

    scenario.write_inputs(performance, &features)?;
    let model = selector.construct(scenario)?;
    let with =
        compute_selector_performance(selector, &model, performance, &features, objective, policy)?;
    info!("Selector performance with all solvers: {with}");

    let mut contributions = Vec::with_capacity(performance.solvers().len());
    for solver in performance.solvers() {
        let ablated = scenario.ablate(solver);
        let mut reduced =
            performance.clone_to(&ablated.directory.join("performance_store.csv"));
        reduced.remove_solver(solver)?;
        reduced.save(DEFAULT_LOCK_TIMEOUT)?;
        ablated.write_inputs(&reduced, &features)?;
        let model = selector.construct(&ablated)?;
        let without =
            compute_selector_performance(selector, &model, &reduced, &features, objective, policy)?;
        info!("Selector performance without {solver}: {without}");
        contributions.push(Contribution {
            solver: solver.clone(),
            contribution: contribution_ratio(solver, objective, with, without),
            performance_without: without,
        });
    }
    sort_contributions(&mut contributions, objective.minimise);
    Ok(contributions)
}

/// Persisted result of a contribution computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionReport {
    pub objective: String,
    /// Checksum of the store files the rows were computed from.
    pub fingerprint: u32,
    pub contributions: Vec<Contribution>,
}

/// crc32 over the contents of `paths`; absent files hash as empty.
pub fn fingerprint(paths: &[&Path]) -> Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    for path in paths {
        match fs::read(path) {
            Ok(bytes) => hasher.update(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("reading {path:?}")),
        }
        hasher.update(&[0]);
    }
    Ok(hasher.finalize())
}

/// Return the report stored at `results`, or compute and store a new one if
/// it is absent, stale, for another objective or `recompute` is set.
pub fn memoized(
    results: &Path,
    objective: &str,
    fingerprint: u32,
    recompute: bool,
    compute: impl FnOnce() -> Result<Vec<Contribution>>,
) -> Result<Vec<Contribution>> {
    if !recompute {
        match fs::read(results) {
            Ok(bytes) => match serde_json::from_slice::<ContributionReport>(&bytes) {
                Ok(report)
                    if report.fingerprint == fingerprint
                        && report.objective == objective =>
                {
                    info!("Reusing marginal contributions from {results:?}");
                    return Ok(report.contributions);
                }
                Ok(_) => debug!("{results:?} is stale"),
                Err(e) => warn!("Ignoring unreadable results file {results:?}: {e}"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("reading {results:?}")),
        }
    }
    let contributions = compute()?;
    let report = ContributionReport {
        objective: objective.to_string(),
        fingerprint,
        contributions,
    };
    atomic_write(results, &serde_json::to_vec_pretty(&report)?)?;
    Ok(report.contributions)
}

/// Store locations and policy shared by both contribution computations.
#[derive(Debug, Clone, PartialEq)]
pub struct ContributionContext {
    pub performance_data: PathBuf,
    pub feature_data: PathBuf,
    pub out_dir: PathBuf,
    pub policy: PenaltyPolicy,
    pub selector_time_budget: Option<u64>,
}

impl ContributionContext {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            performance_data: settings.performance_data.clone(),
            feature_data: settings.feature_data.clone(),
            out_dir: settings.out_dir.clone(),
            policy: PenaltyPolicy::from_settings(settings),
            selector_time_budget: settings.selector_time_budget,
        }
    }

    pub fn results_path(&self, kind: &str) -> PathBuf {
        self.out_dir.join(format!("marginal_contribution_{kind}.json"))
    }

    fn fingerprint(&self) -> Result<u32> {
        fingerprint(&[&self.performance_data, &self.feature_data])
    }

    /// Memoized [`compute_perfect_selector_marginal_contribution`].
    pub fn perfect(
        &self,
        objective: Option<&str>,
        recompute: bool,
    ) -> Result<Vec<Contribution>> {
        let performance = PerformanceDataStore::load(&self.performance_data)?;
        let objective = performance.verify_objective(objective)?.name.clone();
        memoized(
            &self.results_path("perfect"),
            &objective,
            self.fingerprint()?,
            recompute,
            || {
                compute_perfect_selector_marginal_contribution(
                    &performance,
                    Some(&objective),
                    &self.policy,
                )
            },
        )
    }

    /// Memoized [`compute_actual_selector_marginal_contribution`], with the
    /// selector scenario under `<out_dir>/selector`.
    pub fn actual(
        &self,
        selector: &dyn Selector,
        objective: Option<&str>,
        recompute: bool,
    ) -> Result<Vec<Contribution>> {
        let performance = PerformanceDataStore::load(&self.performance_data)?;
        let features = FeatureDataStore::load(&self.feature_data)?;
        let objective = performance.verify_objective(objective)?.clone();
        let scenario = SelectorScenario::new(
            &self.out_dir.join("selector"),
            objective.clone(),
            self.policy.cutoff_time,
            self.selector_time_budget,
        );
        memoized(
            &self.results_path("actual"),
            &objective.name,
            self.fingerprint()?,
            recompute,
            || {
                compute_actual_selector_marginal_contribution(
                    selector,
                    &scenario,
                    &performance,
                    &features,
                    &self.policy,
                )
            },
        )
    }
}
