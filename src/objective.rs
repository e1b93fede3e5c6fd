use core::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use log::warn;
use serde::{Deserialize, Serialize};

/// Reduction applied to a sequence of performance values.
///
/// Missing values (NaN) are not skipped: a single NaN makes the reduction NaN so
/// that incomplete data stays visible downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
    Mean,
    Median,
    Sum,
    Min,
    Max,
    GMean,
}

impl Aggregator {
    /// Reduce `values`. Empty input yields NaN, except for `Sum` which yields 0.
    pub fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return match self {
                Aggregator::Sum => 0.0,
                _ => f64::NAN,
            };
        }
        if values.iter().any(|v| v.is_nan()) {
            return f64::NAN;
        }
        let n = values.len() as f64;
        match self {
            Aggregator::Mean => values.iter().sum::<f64>() / n,
            Aggregator::Sum => values.iter().sum(),
            Aggregator::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregator::Max => {
                values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            }
            Aggregator::Median => {
                let sorted =
                    values.iter().copied().sorted_by(f64::total_cmp).collect_vec();
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            Aggregator::GMean => {
                (values.iter().map(|v| v.ln()).sum::<f64>() / n).exp()
            }
        }
    }
}

/// Which resource measurement a runtime objective reads from a solver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseTime {
    No,
    CpuTime,
    WallTime,
}

/// Outcome tag reported by a solver wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SolverStatus {
    Success,
    Crashed,
    Timeout,
    Wrong,
    Unknown,
    Error,
    Killed,
    Sat,
    Unsat,
}

impl SolverStatus {
    /// Whether the run produced a usable answer.
    pub fn is_positive(&self) -> bool {
        matches!(
            self,
            SolverStatus::Success | SolverStatus::Sat | SolverStatus::Unsat
        )
    }
}

impl FromStr for SolverStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(
            s.trim().to_uppercase(),
        ))
        .with_context(|| format!("unknown solver status: {s}"))
    }
}

impl fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolverStatus::Success => "SUCCESS",
            SolverStatus::Crashed => "CRASHED",
            SolverStatus::Timeout => "TIMEOUT",
            SolverStatus::Wrong => "WRONG",
            SolverStatus::Unknown => "UNKNOWN",
            SolverStatus::Error => "ERROR",
            SolverStatus::Killed => "KILLED",
            SolverStatus::Sat => "SAT",
            SolverStatus::Unsat => "UNSAT",
        };
        write!(f, "{name}")
    }
}

/// A named performance objective and the way its values are reduced.
///
/// Objectives are parsed once from their textual specification and never
/// mutated afterwards:
///
/// * `PAR<k>`: penalized average runtime, CPU time, failed runs score `k * cutoff`
/// * `cpu_time`, `wall_time`: raw runtime without penalty
/// * `<name>:min`, `<name>:max`: quality objective with explicit direction
/// * `<name>`: quality objective, minimised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    pub minimise: bool,
    pub run_aggregator: Aggregator,
    pub instance_aggregator: Aggregator,
    pub solver_aggregator: Aggregator,
    pub use_time: UseTime,
    /// Factor `k` of a PAR-k objective.
    pub penalty_factor: Option<u32>,
}

impl Objective {
    fn new(name: &str, minimise: bool, use_time: UseTime) -> Self {
        Self {
            name: name.to_string(),
            minimise,
            run_aggregator: Aggregator::Mean,
            instance_aggregator: Aggregator::Mean,
            solver_aggregator: if minimise {
                Aggregator::Min
            } else {
                Aggregator::Max
            },
            use_time,
            penalty_factor: None,
        }
    }

    /// Parse a comma separated list of objective specifications.
    pub fn parse_list(specification: &str) -> Result<Vec<Objective>> {
        specification
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Objective::from_str)
            .collect()
    }

    pub fn is_runtime(&self) -> bool {
        self.use_time != UseTime::No
    }

    pub fn has_post_process(&self) -> bool {
        self.penalty_factor.is_some()
    }

    /// Adjust a raw measurement, penalizing unsuccessful or overlong runs.
    pub fn post_process(
        &self,
        value: f64,
        cutoff: f64,
        status: SolverStatus,
    ) -> f64 {
        match self.penalty_factor {
            Some(k) if !status.is_positive() || value.is_nan() || value > cutoff => {
                cutoff * k as f64
            }
            _ => value,
        }
    }

    /// Whether `a` is strictly better than `b` under this objective.
    pub fn is_better(&self, a: f64, b: f64) -> bool {
        if self.minimise {
            a < b
        } else {
            a > b
        }
    }
}

impl FromStr for Objective {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty objective specification");
        }
        if let Some(k) = s.strip_prefix("PAR") {
            if let Ok(k) = k.parse::<u32>() {
                return Ok(Objective {
                    penalty_factor: Some(k),
                    ..Objective::new(s, true, UseTime::CpuTime)
                });
            }
        }
        match s {
            "cpu_time" => return Ok(Objective::new(s, true, UseTime::CpuTime)),
            "wall_time" => return Ok(Objective::new(s, true, UseTime::WallTime)),
            _ => {}
        }
        match s.rsplit_once(':') {
            Some((metric, direction)) if !metric.is_empty() => {
                let minimise = match direction {
                    "min" | "minimise" | "minimize" => true,
                    "max" | "maximise" | "maximize" => false,
                    _ => bail!("unknown optimisation direction in objective {s}"),
                };
                Ok(Objective::new(s, minimise, UseTime::No))
            }
            Some(_) => bail!("objective {s} has no metric name"),
            None => {
                warn!("Objective {s} does not specify a direction, minimising");
                Ok(Objective::new(s, true, UseTime::No))
            }
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests;
