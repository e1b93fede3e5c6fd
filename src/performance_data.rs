use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use itertools::{izip, Itertools};
use log::{debug, info, warn};
use ndarray::{Array4, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    csv_parser::{self, utils::*, PERFORMANCE_KEY, PERFORMANCE_SCHEMA},
    datastructures::*,
    error::StoreError,
    lock::{Persisted, DEFAULT_LOCK_TIMEOUT},
    objective::Objective,
};

const OBJECTIVE_AXIS: Axis = Axis(0);
const INSTANCE_AXIS: Axis = Axis(1);
const RUN_AXIS: Axis = Axis(2);
const SOLVER_AXIS: Axis = Axis(3);

#[derive(Serialize, Deserialize)]
struct Dimensions {
    objectives: Vec<String>,
    instances: Vec<Instance>,
    runs: Vec<u32>,
    solvers: Vec<Solver>,
}

/// Performance values addressed by (objective, instance, run, solver).
///
/// Every combination of the four dimension lists has a [`Cell`]; results that
/// were not computed yet hold the missing sentinel. Objectives keep their
/// declaration order, instances and solvers are sorted, run ids ascend from 1.
/// Each dimension list except objectives and runs may be empty.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceDataStore {
    path: PathBuf,
    objectives: Vec<Objective>,
    instances: Vec<Instance>,
    runs: Vec<u32>,
    solvers: Vec<Solver>,
    cells: Array4<Cell>,
}

impl PerformanceDataStore {
    /// Create an all-missing store and persist it.
    ///
    /// Existing data at `path` is overwritten if it can be read, an unreadable
    /// file is an error.
    pub fn create(
        path: &Path,
        solvers: &[&str],
        objectives: &[Objective],
        instances: &[&str],
        n_runs: u32,
    ) -> Result<PerformanceDataStore> {
        if path.exists() {
            PerformanceDataStore::load(path).with_context(|| {
                format!("refusing to replace unreadable data at {path:?}")
            })?;
            warn!("Overwriting existing performance data {path:?}");
        }
        let store = PerformanceDataStore::new(
            path,
            solvers,
            objectives,
            instances,
            n_runs,
        )?;
        store.save(DEFAULT_LOCK_TIMEOUT)?;
        info!(
            "Created performance data {path:?}: {} objectives, {} instances, {} runs, {} solvers",
            store.objectives.len(),
            store.instances.len(),
            store.runs.len(),
            store.solvers.len()
        );
        Ok(store)
    }

    /// In-memory store, not persisted until saved.
    pub fn new(
        path: &Path,
        solvers: &[&str],
        objectives: &[Objective],
        instances: &[&str],
        n_runs: u32,
    ) -> Result<PerformanceDataStore> {
        if objectives.is_empty() {
            return Err(
                StoreError::Invalid("at least one objective is required".into())
                    .into(),
            );
        }
        if n_runs == 0 {
            return Err(
                StoreError::Invalid("at least one run is required".into()).into()
            );
        }
        if let Some(duplicate) =
            objectives.iter().map(|o| &o.name).duplicates().next()
        {
            return Err(StoreError::Invalid(format!(
                "objective {duplicate} declared twice"
            ))
            .into());
        }
        let solvers = sorted_unique(solvers);
        let instances = sorted_unique(instances);
        let runs = (1..=n_runs).collect_vec();
        let cells = Array4::default((
            objectives.len(),
            instances.len(),
            runs.len(),
            solvers.len(),
        ));
        Ok(PerformanceDataStore {
            path: path.to_path_buf(),
            objectives: objectives.to_vec(),
            instances,
            runs,
            solvers,
            cells,
        })
    }

    /// Copy of this store that persists to `path`.
    pub fn clone_to(&self, path: &Path) -> PerformanceDataStore {
        PerformanceDataStore {
            path: path.to_path_buf(),
            ..self.clone()
        }
    }

    pub fn objectives(&self) -> &[Objective] {
        &self.objectives
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn runs(&self) -> &[u32] {
        &self.runs
    }

    pub fn solvers(&self) -> &[Solver] {
        &self.solvers
    }

    pub fn is_multi_objective(&self) -> bool {
        self.objectives.len() > 1
    }

    /// Resolve an optional objective name. Omitting it is only allowed when
    /// the store holds a single objective.
    pub fn verify_objective(&self, objective: Option<&str>) -> Result<&Objective> {
        Ok(&self.objectives[self.objective_index(objective)?])
    }

    /// Resolve an optional run id. Omitting it is only allowed when the store
    /// holds a single run.
    pub fn verify_run(&self, run: Option<u32>) -> Result<u32> {
        Ok(self.runs[self.run_index(run)?])
    }

    fn objective_index(&self, objective: Option<&str>) -> Result<usize> {
        match objective {
            None if self.objectives.len() == 1 => Ok(0),
            None => Err(StoreError::AmbiguousIndex {
                dimension: "objective",
                count: self.objectives.len(),
            }
            .into()),
            Some(name) => self
                .objectives
                .iter()
                .position(|o| o.name == name)
                .ok_or_else(|| StoreError::UnknownObjective(name.into()).into()),
        }
    }

    fn run_index(&self, run: Option<u32>) -> Result<usize> {
        match run {
            None if self.runs.len() == 1 => Ok(0),
            None => Err(StoreError::AmbiguousIndex {
                dimension: "run",
                count: self.runs.len(),
            }
            .into()),
            Some(run) => self
                .runs
                .binary_search(&run)
                .map_err(|_| StoreError::UnknownRun(run).into()),
        }
    }

    fn instance_index(&self, instance: &str) -> Result<usize> {
        search(&self.instances, instance)
            .map_err(|_| StoreError::UnknownInstance(instance.into()).into())
    }

    fn solver_index(&self, solver: &str) -> Result<usize> {
        search(&self.solvers, solver)
            .map_err(|_| StoreError::UnknownSolver(solver.into()).into())
    }

    fn cell_index(
        &self,
        solver: &str,
        instance: &str,
        objective: Option<&str>,
        run: Option<u32>,
    ) -> Result<[usize; 4]> {
        Ok([
            self.objective_index(objective)?,
            self.instance_index(instance)?,
            self.run_index(run)?,
            self.solver_index(solver)?,
        ])
    }

    /// Add a solver to every (objective, instance, run), filled with `initial`
    /// or the missing sentinel.
    pub fn add_solver(&mut self, solver: &str, initial: Option<f64>) -> Result<()> {
        let Err(index) = search(&self.solvers, solver) else {
            warn!("Solver {solver} already present in {:?}", self.path);
            return Ok(());
        };
        let fill = Cell::with_value(initial.unwrap_or(MISSING));
        self.cells = insert_index(&self.cells, SOLVER_AXIS, index, fill)?;
        self.solvers.insert(index, solver.to_string());
        debug!("Added solver {solver}");
        Ok(())
    }

    pub fn remove_solver(&mut self, solver: &str) -> Result<()> {
        match search(&self.solvers, solver) {
            Ok(index) => {
                self.cells = remove_index(&self.cells, SOLVER_AXIS, index)?;
                self.solvers.remove(index);
                debug!("Removed solver {solver}");
            }
            Err(_) => warn!("Solver {solver} not present in {:?}", self.path),
        }
        Ok(())
    }

    pub fn add_instance(
        &mut self,
        instance: &str,
        initial: Option<f64>,
    ) -> Result<()> {
        let Err(index) = search(&self.instances, instance) else {
            warn!("Instance {instance} already present in {:?}", self.path);
            return Ok(());
        };
        let fill = Cell::with_value(initial.unwrap_or(MISSING));
        self.cells = insert_index(&self.cells, INSTANCE_AXIS, index, fill)?;
        self.instances.insert(index, instance.to_string());
        debug!("Added instance {instance}");
        Ok(())
    }

    pub fn remove_instance(&mut self, instance: &str) -> Result<()> {
        match search(&self.instances, instance) {
            Ok(index) => {
                self.cells = remove_index(&self.cells, INSTANCE_AXIS, index)?;
                self.instances.remove(index);
                debug!("Removed instance {instance}");
            }
            Err(_) => {
                warn!("Instance {instance} not present in {:?}", self.path)
            }
        }
        Ok(())
    }

    /// Append an objective; all of its cells start missing.
    pub fn add_objective(&mut self, objective: Objective) -> Result<()> {
        if self.objectives.iter().any(|o| o.name == objective.name) {
            warn!("Objective {objective} already present in {:?}", self.path);
            return Ok(());
        }
        self.cells = insert_index(
            &self.cells,
            OBJECTIVE_AXIS,
            self.objectives.len(),
            Cell::default(),
        )?;
        self.objectives.push(objective);
        Ok(())
    }

    pub fn remove_objective(&mut self, objective: &str) -> Result<()> {
        let index = self.objective_index(Some(objective))?;
        if self.objectives.len() == 1 {
            return Err(StoreError::Invalid(format!(
                "cannot remove {objective}, the last objective of {:?}",
                self.path
            ))
            .into());
        }
        self.cells = remove_index(&self.cells, OBJECTIVE_AXIS, index)?;
        self.objectives.remove(index);
        Ok(())
    }

    /// Keep only the named objectives.
    pub fn filter_objectives(&mut self, keep: &[&str]) -> Result<()> {
        for name in keep {
            self.objective_index(Some(name))?;
        }
        let drop = self
            .objectives
            .iter()
            .map(|o| o.name.clone())
            .filter(|name| !keep.contains(&name.as_str()))
            .collect_vec();
        for name in drop {
            self.remove_objective(&name)?;
        }
        Ok(())
    }

    /// Append `n` runs after the current last run id.
    pub fn add_runs(&mut self, n: u32) -> Result<()> {
        for _ in 0..n {
            let next = self.runs.last().map_or(1, |r| r + 1);
            self.cells = insert_index(
                &self.cells,
                RUN_AXIS,
                self.runs.len(),
                Cell::default(),
            )?;
            self.runs.push(next);
        }
        Ok(())
    }

    /// Drop the last `n` runs. The first run is never removed.
    pub fn remove_runs(&mut self, n: u32) -> Result<()> {
        let removable = self.runs.len() - 1;
        if n as usize > removable {
            warn!(
                "Asked to remove {n} runs but only {removable} can be removed from {:?}",
                self.path
            );
        }
        for _ in 0..(n as usize).min(removable) {
            let last = self.runs.len() - 1;
            self.cells = remove_index(&self.cells, RUN_AXIS, last)?;
            self.runs.pop();
        }
        Ok(())
    }

    /// Drop runs without any data, except the first.
    pub fn remove_empty_runs(&mut self) -> Result<()> {
        for index in (1..self.runs.len()).rev() {
            let empty = self
                .cells
                .index_axis(RUN_AXIS, index)
                .iter()
                .all(Cell::is_empty);
            if empty {
                self.cells = remove_index(&self.cells, RUN_AXIS, index)?;
                let run = self.runs.remove(index);
                debug!("Removed empty run {run}");
            }
        }
        Ok(())
    }

    pub fn get_cell(
        &self,
        solver: &str,
        instance: &str,
        objective: Option<&str>,
        run: Option<u32>,
    ) -> Result<&Cell> {
        Ok(&self.cells[self.cell_index(solver, instance, objective, run)?])
    }

    pub fn get_value(
        &self,
        solver: &str,
        instance: &str,
        objective: Option<&str>,
        run: Option<u32>,
    ) -> Result<f64> {
        Ok(self.get_cell(solver, instance, objective, run)?.value)
    }

    /// Values of `solver` across every dimension left unspecified, ordered by
    /// objective, instance, then run.
    pub fn get_values(
        &self,
        solver: &str,
        instance: Option<&str>,
        objective: Option<&str>,
        run: Option<u32>,
    ) -> Result<Vec<f64>> {
        let s = self.solver_index(solver)?;
        let objectives = match objective {
            Some(name) => vec![self.objective_index(Some(name))?],
            None => (0..self.objectives.len()).collect(),
        };
        let instances = match instance {
            Some(name) => vec![self.instance_index(name)?],
            None => (0..self.instances.len()).collect(),
        };
        let runs = match run {
            Some(run) => vec![self.run_index(Some(run))?],
            None => (0..self.runs.len()).collect(),
        };
        Ok(objectives
            .into_iter()
            .cartesian_product(instances)
            .cartesian_product(runs)
            .map(|((o, i), r)| self.cells[[o, i, r, s]].value)
            .collect())
    }

    pub fn set_cell(
        &mut self,
        cell: Cell,
        solver: &str,
        instance: &str,
        objective: Option<&str>,
        run: Option<u32>,
    ) -> Result<()> {
        let index = self.cell_index(solver, instance, objective, run)?;
        self.cells[index] = cell;
        Ok(())
    }

    /// Write a value, keeping the seed and configuration of the cell.
    pub fn set_value(
        &mut self,
        value: f64,
        solver: &str,
        instance: &str,
        objective: Option<&str>,
        run: Option<u32>,
    ) -> Result<()> {
        let index = self.cell_index(solver, instance, objective, run)?;
        self.cells[index].value = value;
        Ok(())
    }

    pub fn reset_value(
        &mut self,
        solver: &str,
        instance: &str,
        objective: Option<&str>,
        run: Option<u32>,
    ) -> Result<()> {
        self.set_cell(Cell::default(), solver, instance, objective, run)
    }

    /// Set every cell to missing.
    pub fn clean(&mut self) {
        self.cells.fill(Cell::default());
    }

    pub fn has_missing_values(&self) -> bool {
        self.cells.iter().any(|c| is_missing(c.value))
    }

    /// Whether any objective or run of (solver, instance) is missing.
    pub fn is_missing(&self, solver: &str, instance: &str) -> Result<bool> {
        let i = self.instance_index(instance)?;
        let s = self.solver_index(solver)?;
        Ok(self
            .cells
            .index_axis(INSTANCE_AXIS, i)
            .index_axis(Axis(2), s)
            .iter()
            .any(|c| is_missing(c.value)))
    }

    /// Mean over a slice of the store. Missing values are skipped; the mean
    /// of an all-missing slice is missing.
    pub fn mean(
        &self,
        objective: Option<&str>,
        solver: Option<&str>,
        instance: Option<&str>,
    ) -> Result<f64> {
        let o = self.objective_index(objective)?;
        let s = solver.map(|s| self.solver_index(s)).transpose()?;
        let i = instance.map(|i| self.instance_index(i)).transpose()?;
        let present = self
            .cells
            .index_axis(OBJECTIVE_AXIS, o)
            .indexed_iter()
            .filter(|((ii, _, ss), _)| {
                i.map_or(true, |i| i == *ii) && s.map_or(true, |s| s == *ss)
            })
            .map(|(_, c)| c.value)
            .filter(|v| !is_missing(*v))
            .collect_vec();
        if present.is_empty() {
            return Ok(MISSING);
        }
        Ok(present.iter().sum::<f64>() / present.len() as f64)
    }

    /// Outstanding (instance, run, solver) jobs ordered by instance, run and
    /// solver. A job is outstanding if any objective misses its value; with
    /// `rerun` every combination is listed.
    pub fn get_job_list(&self, rerun: bool) -> Vec<PerformanceJob> {
        self.cells
            .lanes(OBJECTIVE_AXIS)
            .into_iter()
            .zip(
                self.instances
                    .iter()
                    .cartesian_product(self.runs.iter())
                    .cartesian_product(self.solvers.iter()),
            )
            .filter(|(lane, _)| rerun || lane.iter().any(|c| is_missing(c.value)))
            .map(|(_, ((instance, run), solver))| PerformanceJob {
                instance: instance.clone(),
                run: *run,
                solver: solver.clone(),
            })
            .collect()
    }

    /// Outstanding solvers per instance. Instances without outstanding work
    /// are left out.
    pub fn remaining_jobs(&self) -> BTreeMap<Instance, Vec<Solver>> {
        let mut remaining: BTreeMap<Instance, Vec<Solver>> = BTreeMap::new();
        for job in self.get_job_list(false) {
            let solvers = remaining.entry(job.instance).or_default();
            if !solvers.contains(&job.solver) {
                solvers.push(job.solver);
            }
        }
        remaining.values_mut().for_each(|solvers| solvers.sort());
        remaining
    }

    /// Best value per instance over the non-excluded solvers and over all runs
    /// unless `run` is given. Missing values are skipped; an instance without
    /// any value stays missing. Among equal values the first in (run, solver)
    /// order wins, which is deterministic but carries no meaning.
    pub fn best_instance_performance(
        &self,
        objective: Option<&str>,
        run: Option<u32>,
        exclude_solvers: &[&str],
    ) -> Result<Vec<(Instance, f64)>> {
        let o = self.objective_index(objective)?;
        let minimise = self.objectives[o].minimise;
        let runs = match run {
            Some(run) => vec![self.run_index(Some(run))?],
            None => (0..self.runs.len()).collect(),
        };
        let excluded = exclude_solvers
            .iter()
            .map(|s| self.solver_index(s))
            .collect::<Result<Vec<_>>>()?;
        let solvers = (0..self.solvers.len())
            .filter(|s| !excluded.contains(s))
            .collect_vec();
        Ok(self
            .instances
            .iter()
            .enumerate()
            .map(|(i, instance)| {
                let best = runs
                    .iter()
                    .cartesian_product(solvers.iter())
                    .map(|(r, s)| self.cells[[o, i, *r, *s]].value)
                    .filter(|v| !is_missing(*v))
                    .fold(MISSING, |best, v| {
                        let better = if minimise { v < best } else { v > best };
                        if is_missing(best) || better {
                            v
                        } else {
                            best
                        }
                    });
                (instance.clone(), best)
            })
            .collect())
    }

    /// Virtual best solver score: the instance aggregator applied to
    /// [`Self::best_instance_performance`].
    pub fn best_performance(
        &self,
        objective: Option<&str>,
        exclude_solvers: &[&str],
    ) -> Result<f64> {
        let aggregator = self.verify_objective(objective)?.instance_aggregator;
        let best = self
            .best_instance_performance(objective, None, exclude_solvers)?
            .into_iter()
            .map(|(_, v)| v)
            .collect_vec();
        Ok(aggregator.apply(&best))
    }

    /// Marginal contribution of every solver to the virtual best solver.
    ///
    /// The contribution is the ratio of the score without the solver to the
    /// score with all solvers, or exactly 0.0 if removing the solver leaves
    /// the score unchanged. `sort` orders by contribution, descending for
    /// minimised objectives.
    pub fn marginal_contribution(
        &self,
        objective: Option<&str>,
        sort: bool,
    ) -> Result<Vec<Contribution>> {
        let minimise = self.verify_objective(objective)?.minimise;
        let best = self.best_performance(objective, &[])?;
        let mut contributions = self
            .solvers
            .iter()
            .map(|solver| {
                let without =
                    self.best_performance(objective, &[solver.as_str()])?;
                let contribution =
                    if without == best { 0.0 } else { without / best };
                Ok(Contribution {
                    solver: solver.clone(),
                    contribution,
                    performance_without: without,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if sort {
            sort_contributions(&mut contributions, minimise);
        }
        Ok(contributions)
    }

    /// Aggregate score per solver (run aggregator, then instance aggregator),
    /// best first. Missing scores are ranked last.
    pub fn get_solver_ranking(
        &self,
        objective: Option<&str>,
    ) -> Result<Vec<(Solver, f64)>> {
        let o = self.objective_index(objective)?;
        let objective = &self.objectives[o];
        let mut ranking = self
            .solvers
            .iter()
            .enumerate()
            .map(|(s, solver)| {
                let per_instance = (0..self.instances.len())
                    .map(|i| {
                        let runs = self
                            .cells
                            .slice(ndarray::s![o, i, .., s])
                            .iter()
                            .map(|c| c.value)
                            .collect_vec();
                        objective.run_aggregator.apply(&runs)
                    })
                    .collect_vec();
                (solver.clone(), objective.instance_aggregator.apply(&per_instance))
            })
            .collect_vec();
        ranking.sort_by(|(_, a), (_, b)| {
            is_missing(*a).cmp(&is_missing(*b)).then_with(|| {
                if objective.minimise {
                    a.total_cmp(b)
                } else {
                    b.total_cmp(a)
                }
            })
        });
        Ok(ranking)
    }

    /// Score a solver schedule per instance against the stored ground truth.
    ///
    /// For runtime objectives the attempts run in order, each consuming its
    /// time up to its cutoff, until an attempt finishes no later than its
    /// cutoff or the time spent exceeds `budget`. For quality objectives the
    /// best value over the attempts counts. With `target_solver` the scores
    /// are also written into that solver, which is added if needed.
    pub fn schedule_performance(
        &mut self,
        schedule: &BTreeMap<Instance, Vec<ScheduleStep>>,
        target_solver: Option<&str>,
        objective: Option<&str>,
        budget: Option<f64>,
    ) -> Result<Vec<(Instance, f64)>> {
        let objective = self.verify_objective(objective)?.clone();
        let run = self.verify_run(None).ok();
        let mut performances = Vec::with_capacity(schedule.len());
        for (instance, steps) in schedule {
            let mut performance = if objective.is_runtime() { 0.0 } else { MISSING };
            for step in steps {
                let value = match run {
                    Some(run) => self.get_value(
                        &step.solver,
                        instance,
                        Some(&objective.name),
                        Some(run),
                    )?,
                    None => {
                        let runs = self.get_values(
                            &step.solver,
                            Some(instance),
                            Some(&objective.name),
                            None,
                        )?;
                        objective.run_aggregator.apply(&runs)
                    }
                };
                if objective.is_runtime() {
                    let allotted = step.cutoff.unwrap_or(f64::INFINITY);
                    performance += if is_missing(value) {
                        MISSING
                    } else {
                        value.min(allotted)
                    };
                    let exhausted = budget.map_or(false, |b| performance > b);
                    if value <= allotted || exhausted {
                        break;
                    }
                } else if is_missing(performance)
                    || objective.is_better(value, performance)
                {
                    performance = value;
                }
            }
            performances.push((instance.clone(), performance));
        }
        if let Some(target) = target_solver {
            self.add_solver(target, None)?;
            for (instance, performance) in &performances {
                for run in self.runs.clone() {
                    self.set_value(
                        *performance,
                        target,
                        instance,
                        Some(&objective.name),
                        Some(run),
                    )?;
                }
            }
        }
        Ok(performances)
    }

    /// Apply `f` to every value of one objective, missing values included.
    pub fn map_values(
        &mut self,
        objective: Option<&str>,
        mut f: impl FnMut(f64) -> f64,
    ) -> Result<()> {
        let o = self.objective_index(objective)?;
        self.cells
            .index_axis_mut(OBJECTIVE_AXIS, o)
            .iter_mut()
            .for_each(|c| c.value = f(c.value));
        Ok(())
    }

    /// Replace values beyond `threshold` by `penalty`: values above it, or
    /// below it when `lower_bound` is set. Missing values are left alone.
    pub fn penalise(
        &mut self,
        threshold: f64,
        penalty: f64,
        objective: Option<&str>,
        lower_bound: bool,
    ) -> Result<()> {
        self.map_values(objective, |v| {
            let beyond = if lower_bound { v < threshold } else { v > threshold };
            if beyond {
                penalty
            } else {
                v
            }
        })
    }

    /// Instance column plus one value column per solver, for a single
    /// objective and a single run.
    pub fn to_external_frame(&self, objective: Option<&str>) -> Result<DataFrame> {
        let o = self.objective_index(objective)?;
        let r = self.run_index(None)?;
        let mut columns = vec![Series::new("instance", &self.instances)];
        for (s, solver) in self.solvers.iter().enumerate() {
            columns.push(f64_series(
                solver,
                self.cells.slice(ndarray::s![o, .., r, s]).iter().map(|c| c.value),
            ));
        }
        Ok(DataFrame::new(columns)?)
    }

    /// Write [`Self::to_external_frame`] to `target`.
    pub fn to_external_format(
        &self,
        objective: Option<&str>,
        target: &Path,
    ) -> Result<()> {
        let mut df = self.to_external_frame(objective)?;
        csv_parser::write_csv(target, &mut df)
    }

    /// Long-format frame of every cell that holds any data.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let rows = self
            .cells
            .indexed_iter()
            .filter(|(_, cell)| !cell.is_empty())
            .collect_vec();
        Ok(DataFrame::new(vec![
            Series::new(
                "objective",
                rows.iter()
                    .map(|((o, ..), _)| self.objectives[*o].name.as_str())
                    .collect_vec(),
            ),
            Series::new(
                "instance",
                rows.iter()
                    .map(|((_, i, ..), _)| self.instances[*i].as_str())
                    .collect_vec(),
            ),
            Series::new(
                "run",
                rows.iter()
                    .map(|((_, _, r, _), _)| self.runs[*r] as i64)
                    .collect_vec(),
            ),
            Series::new(
                "solver",
                rows.iter()
                    .map(|((.., s), _)| self.solvers[*s].as_str())
                    .collect_vec(),
            ),
            f64_series("value", rows.iter().map(|(_, c)| c.value)),
            Series::new("seed", rows.iter().map(|(_, c)| c.seed).collect_vec()),
            Series::new(
                "configuration",
                rows.iter()
                    .map(|(_, c)| c.configuration.as_deref())
                    .collect_vec(),
            ),
        ])?)
    }
}

impl Persisted for PerformanceDataStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<PerformanceDataStore> {
        let (dimensions, df): (Dimensions, DataFrame) =
            csv_parser::read_store(path, &PERFORMANCE_SCHEMA, &PERFORMANCE_KEY)?;
        let structural = |reason: String| StoreError::Structural {
            path: path.to_path_buf(),
            reason,
        };
        let objectives = dimensions
            .objectives
            .iter()
            .map(|o| o.parse::<Objective>())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| structural(e.to_string()))?;
        let mut store = PerformanceDataStore::new(
            path,
            &dimensions.solvers.iter().map(String::as_str).collect_vec(),
            &objectives,
            &dimensions.instances.iter().map(String::as_str).collect_vec(),
            1,
        )
        .map_err(|e| structural(e.to_string()))?;
        let mut runs = dimensions.runs;
        runs.sort_unstable();
        runs.dedup();
        if runs.is_empty() {
            return Err(structural("no runs declared".into()).into());
        }
        store.cells = Array4::default((
            store.objectives.len(),
            store.instances.len(),
            runs.len(),
            store.solvers.len(),
        ));
        store.runs = runs;

        for (objective, instance, run, solver, value, seed, configuration) in izip!(
            key_column(&df, "objective")?,
            key_column(&df, "instance")?,
            i64_column(&df, "run")?,
            key_column(&df, "solver")?,
            f64_column(&df, "value")?,
            i64_column(&df, "seed")?,
            utf8_column(&df, "configuration")?
        ) {
            let run = run
                .and_then(|r| u32::try_from(r).ok())
                .ok_or_else(|| structural(format!("invalid run id {run:?}")))?;
            let index = store
                .cell_index(&solver, &instance, Some(&objective), Some(run))
                .map_err(|e| structural(e.to_string()))?;
            store.cells[index] = Cell {
                value,
                seed,
                configuration,
            };
        }
        Ok(store)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut df = self.to_dataframe()?;
        csv_parser::encode_store(
            &Dimensions {
                objectives: self.objectives.iter().map(|o| o.name.clone()).collect(),
                instances: self.instances.clone(),
                runs: self.runs.clone(),
                solvers: self.solvers.clone(),
            },
            &mut df,
        )
        .with_context(|| format!("encoding performance data {:?}", self.path))
    }
}

/// Order contributions by value, descending for minimised objectives.
pub fn sort_contributions(contributions: &mut [Contribution], minimise: bool) {
    contributions.sort_by(|a, b| {
        if minimise {
            b.contribution.total_cmp(&a.contribution)
        } else {
            a.contribution.total_cmp(&b.contribution)
        }
    });
}

fn search(sorted: &[String], name: &str) -> Result<usize, usize> {
    sorted.binary_search_by(|x| x.as_str().cmp(name))
}

fn sorted_unique(names: &[&str]) -> Vec<String> {
    names
        .iter()
        .map(|n| n.to_string())
        .sorted()
        .dedup()
        .collect()
}

#[cfg(test)]
mod tests;
