use core::fmt;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use ndarray::{Array, ArrayView, Axis, RemoveAxis};
use serde::{Deserialize, Serialize};

use crate::objective::Objective;

pub type Solver = String;
pub type Instance = String;
pub type Extractor = String;

/// Sentinel for a value that has not been computed yet.
pub const MISSING: f64 = f64::NAN;

pub fn is_missing(value: f64) -> bool {
    value.is_nan()
}

/// Serde adapter writing missing values as json `null`.
pub mod missing_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        (!super::is_missing(*value)).then_some(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(super::MISSING))
    }
}

/// One entry of the performance cube.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub value: f64,
    pub seed: Option<i64>,
    pub configuration: Option<String>,
}

impl Cell {
    pub fn with_value(value: f64) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        is_missing(self.value)
            && self.seed.is_none()
            && self.configuration.is_none()
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            value: MISSING,
            seed: None,
            configuration: None,
        }
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        let same_value = (is_missing(self.value) && is_missing(other.value))
            || self.value == other.value;
        same_value
            && self.seed == other.seed
            && self.configuration == other.configuration
    }
}

/// An outstanding solver run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PerformanceJob {
    pub instance: Instance,
    pub run: u32,
    pub solver: Solver,
}

impl fmt::Display for PerformanceJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} (run {})", self.solver, self.instance, self.run)
    }
}

/// An outstanding feature extraction, optionally restricted to one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FeatureJob {
    pub instance: Instance,
    pub extractor: Extractor,
    pub feature_group: Option<String>,
}

impl fmt::Display for FeatureJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.feature_group {
            Some(group) => {
                write!(f, "{} [{}] on {}", self.extractor, group, self.instance)
            }
            None => write!(f, "{} on {}", self.extractor, self.instance),
        }
    }
}

/// Row key of the feature store. The owning extractor is part of the key so
/// features with equal names from different extractors never collide.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FeatureKey {
    pub extractor: Extractor,
    pub group: String,
    pub name: String,
}

impl FeatureKey {
    pub fn new(extractor: &str, group: &str, name: &str) -> Self {
        Self {
            extractor: extractor.to_string(),
            group: group.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.extractor, self.group, self.name)
    }
}

/// One attempt of a solver schedule. `cutoff` is the time the solver may use;
/// `None` lets it run to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStep {
    pub solver: Solver,
    pub cutoff: Option<f64>,
}

impl ScheduleStep {
    pub fn new(solver: &str, cutoff: Option<f64>) -> Self {
        Self {
            solver: solver.to_string(),
            cutoff,
        }
    }
}

/// Marginal contribution of a solver to a portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub solver: Solver,
    #[serde(with = "missing_as_null")]
    pub contribution: f64,
    /// Portfolio performance once the solver is removed.
    #[serde(with = "missing_as_null")]
    pub performance_without: f64,
}

impl fmt::Display for Contribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (without: {})",
            self.solver, self.contribution, self.performance_without
        )
    }
}

/// Explicit platform configuration, handed to every store and engine that
/// needs it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default = "default_objectives")]
    pub objectives: String,
    #[serde(default = "default_cutoff_time")]
    pub cutoff_time: f64,
    #[serde(default = "default_penalty_multiplier")]
    pub penalty_multiplier: f64,
    #[serde(default)]
    pub cap_value: Option<f64>,
    #[serde(default = "default_n_runs")]
    pub n_runs: u32,
    /// Seconds a worker waits for a store lock before giving up.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
    #[serde(default)]
    pub selector_time_budget: Option<u64>,
    #[serde(default)]
    pub selector_command: Vec<String>,
    #[serde(default = "default_performance_data")]
    pub performance_data: PathBuf,
    #[serde(default = "default_feature_data")]
    pub feature_data: PathBuf,
    #[serde(default = "default_solver_registry")]
    pub solver_registry: PathBuf,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            objectives: default_objectives(),
            cutoff_time: default_cutoff_time(),
            penalty_multiplier: default_penalty_multiplier(),
            cap_value: None,
            n_runs: default_n_runs(),
            lock_timeout: default_lock_timeout(),
            selector_time_budget: None,
            selector_command: vec![],
            performance_data: default_performance_data(),
            feature_data: default_feature_data(),
            solver_registry: default_solver_registry(),
            out_dir: default_out_dir(),
        }
    }
}

/// Command line overrides for [`Settings`].
#[derive(clap::Args, Debug, Default, Clone)]
pub struct SettingsArgs {
    /// Path to a json settings file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Comma separated objectives, e.g. "PAR10,quality:max"
    #[arg(long)]
    pub objectives: Option<String>,
    #[arg(long)]
    pub cutoff_time: Option<f64>,
    #[arg(long)]
    pub penalty_multiplier: Option<f64>,
    #[arg(long)]
    pub cap_value: Option<f64>,
    #[arg(long)]
    pub runs: Option<u32>,
    /// Seconds to wait for a store lock
    #[arg(long)]
    pub lock_timeout: Option<u64>,
    #[arg(long)]
    pub performance_data: Option<PathBuf>,
    #[arg(long)]
    pub feature_data: Option<PathBuf>,
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Settings> {
        let settings_str = fs::read_to_string(path)
            .with_context(|| format!("reading settings {path:?}"))?;
        let settings: Settings = serde_json::from_str(&settings_str)
            .with_context(|| format!("parsing settings {path:?}"))?;
        Ok(settings)
    }

    pub fn from_cli(args: &SettingsArgs) -> Result<Settings> {
        let mut settings = match &args.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        if let Some(objectives) = &args.objectives {
            settings.objectives = objectives.clone();
        }
        if let Some(cutoff_time) = args.cutoff_time {
            settings.cutoff_time = cutoff_time;
        }
        if let Some(penalty_multiplier) = args.penalty_multiplier {
            settings.penalty_multiplier = penalty_multiplier;
        }
        if let Some(cap_value) = args.cap_value {
            settings.cap_value = Some(cap_value);
        }
        if let Some(runs) = args.runs {
            settings.n_runs = runs;
        }
        if let Some(lock_timeout) = args.lock_timeout {
            settings.lock_timeout = lock_timeout;
        }
        if let Some(performance_data) = &args.performance_data {
            settings.performance_data = performance_data.to_path_buf();
        }
        if let Some(feature_data) = &args.feature_data {
            settings.feature_data = feature_data.to_path_buf();
        }
        if let Some(out_dir) = &args.out_dir {
            settings.out_dir = out_dir.to_path_buf();
        }
        settings.objectives()?;
        Ok(settings)
    }

    pub fn objectives(&self) -> Result<Vec<Objective>> {
        Objective::parse_list(&self.objectives)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }
}

fn default_objectives() -> String {
    "PAR10".to_string()
}

fn default_cutoff_time() -> f64 {
    60.0
}

fn default_penalty_multiplier() -> f64 {
    10.0
}

fn default_n_runs() -> u32 {
    1
}

fn default_lock_timeout() -> u64 {
    60
}

fn default_performance_data() -> PathBuf {
    PathBuf::from("performance_data.csv")
}

fn default_feature_data() -> PathBuf {
    PathBuf::from("feature_data.csv")
}

fn default_solver_registry() -> PathBuf {
    PathBuf::from("solver_registry.csv")
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("output")
}

/// Copy of `array` with a new slice filled with `fill` at `index` along `axis`.
pub(crate) fn insert_index<A: Clone, D: RemoveAxis>(
    array: &Array<A, D>,
    axis: Axis,
    index: usize,
    fill: A,
) -> Result<Array<A, D>> {
    let mut shape = array.raw_dim();
    shape[axis.index()] = 1;
    let slot = Array::from_elem(shape, fill);
    let (head, tail) = array.view().split_at(axis, index);
    Ok(ndarray::concatenate(axis, &[head, slot.view(), tail])?)
}

/// Copy of `array` without the slice at `index` along `axis`.
pub(crate) fn remove_index<A: Clone, D: RemoveAxis>(
    array: &Array<A, D>,
    axis: Axis,
    index: usize,
) -> Result<Array<A, D>> {
    let (head, rest) = array.view().split_at(axis, index);
    let (_, tail) = rest.split_at(axis, 1);
    let parts: [ArrayView<A, D>; 2] = [head, tail];
    Ok(ndarray::concatenate(axis, &parts)?)
}

#[cfg(test)]
mod tests {
    use ndarray::{arr2, Axis};

    use super::*;

    #[test]
    fn test_insert_and_remove_index() {
        let array = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let inserted = insert_index(&array, Axis(1), 1, 0.0).unwrap();
        assert_eq!(inserted, arr2(&[[1.0, 0.0, 2.0], [3.0, 0.0, 4.0]]));
        let removed = remove_index(&inserted, Axis(0), 0).unwrap();
        assert_eq!(removed, arr2(&[[3.0, 0.0, 4.0]]));
        let emptied = remove_index(&removed, Axis(0), 0).unwrap();
        assert_eq!(emptied.shape(), &[0, 3]);
        let refilled = insert_index(&emptied, Axis(0), 0, 7.0).unwrap();
        assert_eq!(refilled, arr2(&[[7.0, 7.0, 7.0]]));
    }

    #[test]
    fn test_settings_defaults_from_partial_json() {
        let settings: Settings =
            serde_json::from_str(r#"{"objectives": "quality:max", "cutoff_time": 5.0}"#)
                .unwrap();
        assert_eq!(settings.cutoff_time, 5.0);
        assert_eq!(settings.penalty_multiplier, 10.0);
        assert_eq!(settings.objectives().unwrap()[0].name, "quality:max");
    }

    #[test]
    fn test_cell_equality_treats_missing_as_equal() {
        assert_eq!(Cell::default(), Cell::default());
        assert_ne!(Cell::with_value(1.0), Cell::default());
        assert!(Cell::default().is_empty());
    }
}
