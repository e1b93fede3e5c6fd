use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    datastructures::{missing_as_null, Cell, FeatureJob, PerformanceJob, MISSING},
    feature_data::FeatureDataStore,
    lock::Persisted,
    objective::{Objective, SolverStatus, UseTime},
    performance_data::PerformanceDataStore,
};

/// Result record written by a solver wrapper after one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverResult {
    pub status: SolverStatus,
    pub cpu_time: f64,
    pub wall_time: f64,
    pub cutoff_time: f64,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub configuration: Option<String>,
    /// Quality measurements keyed by objective name.
    #[serde(default)]
    pub objective_values: BTreeMap<String, f64>,
}

impl SolverResult {
    pub fn from_file(path: &Path) -> Result<SolverResult> {
        let bytes =
            fs::read(path).with_context(|| format!("reading solver result {path:?}"))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("decoding solver result {path:?}"))
    }

    /// Value of `objective` for this run, post-processed with the run's
    /// cutoff.
    pub fn value(&self, objective: &Objective) -> f64 {
        let raw = match objective.use_time {
            UseTime::CpuTime => self.cpu_time,
            UseTime::WallTime => self.wall_time,
            UseTime::No => self
                .objective_values
                .get(&objective.name)
                .copied()
                .unwrap_or(MISSING),
        };
        objective.post_process(raw, self.cutoff_time, self.status)
    }
}

/// Write one solver run into every objective of the store at `path`.
pub fn record_solver_result(
    path: &Path,
    job: &PerformanceJob,
    result: &SolverResult,
    timeout: Duration,
) -> Result<()> {
    PerformanceDataStore::update(path, timeout, |store| {
        for objective in store.objectives().to_vec() {
            let cell = Cell {
                value: result.value(&objective),
                seed: result.seed,
                configuration: result.configuration.clone(),
            };
            debug!("{job} {objective}: {}", cell.value);
            store.set_cell(
                cell,
                &job.solver,
                &job.instance,
                Some(&objective.name),
                Some(job.run),
            )?;
        }
        Ok(())
    })?;
    info!("Recorded {job} ({}) in {path:?}", result.status);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureValue {
    pub group: String,
    pub name: String,
    /// `null` when the extractor could not compute the feature.
    #[serde(with = "missing_as_null")]
    pub value: f64,
}

/// Result record written by a feature extractor wrapper for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureResult {
    pub instance: String,
    pub extractor: String,
    pub features: Vec<FeatureValue>,
}

impl FeatureResult {
    pub fn from_file(path: &Path) -> Result<FeatureResult> {
        let bytes =
            fs::read(path).with_context(|| format!("reading feature result {path:?}"))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("decoding feature result {path:?}"))
    }

    pub fn job(&self) -> FeatureJob {
        let groups = self
            .features
            .iter()
            .map(|f| f.group.as_str())
            .collect::<std::collections::BTreeSet<_>>();
        FeatureJob {
            instance: self.instance.clone(),
            extractor: self.extractor.clone(),
            feature_group: match groups.len() {
                1 => groups.into_iter().next().map(str::to_string),
                _ => None,
            },
        }
    }
}

/// Write one extractor result into the store at `path`, all features or
/// none.
pub fn record_feature_result(
    path: &Path,
    result: &FeatureResult,
    timeout: Duration,
) -> Result<()> {
    let values = result
        .features
        .iter()
        .map(|f| (f.group.clone(), f.name.clone(), f.value))
        .collect::<Vec<_>>();
    FeatureDataStore::update(path, timeout, |store| {
        store.set_values(&result.instance, &result.extractor, &values)
    })?;
    info!("Recorded {} in {path:?}", result.job());
    Ok(())
}
