use std::ops::Range;

use clap::Parser;
use itertools::Itertools;
use log::info;
use std::{fs, path::PathBuf};

use anyhow::Result;
use portfolio_data::{
    lock::DEFAULT_LOCK_TIMEOUT,
    objective::{Objective, SolverStatus},
    performance_data::PerformanceDataStore,
    Persisted,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
struct InstanceRangeConfig {
    mean: f64,
    /// Standard deviation relative to the mean.
    std: f64,
    range: Range<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct SolverConfig {
    name: String,
    instance_range_configs: Vec<InstanceRangeConfig>,
}

fn default_objective() -> String {
    "PAR10".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct DataGeneratorConfig {
    solver_configs: Vec<SolverConfig>,
    num_instances: usize,
    runs_per_instance: u32,
    #[serde(default = "default_objective")]
    objective: String,
    /// Samples above the cutoff count as timeouts of runtime objectives.
    cutoff_time: Option<f64>,
    seed: u64,
    out_path: PathBuf,
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to the json config
    #[arg(short, long)]
    pub config: PathBuf,
    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.verbosity.log_level_filter())
        .init();
    let config: DataGeneratorConfig =
        serde_json::from_str(&fs::read_to_string(args.config)?)?;
    let store = generate_data(&config)?;
    store.save(DEFAULT_LOCK_TIMEOUT)?;
    info!("Generated {:?}", config.out_path);
    Ok(())
}

fn instance_name(i: usize) -> String {
    format!("instance{i}")
}

fn generate_data(config: &DataGeneratorConfig) -> Result<PerformanceDataStore> {
    let objective: Objective = config.objective.parse()?;
    let instances = (0..config.num_instances).map(instance_name).collect_vec();
    let mut store = PerformanceDataStore::new(
        &config.out_path,
        &config.solver_configs.iter().map(|s| s.name.as_str()).collect_vec(),
        &[objective.clone()],
        &instances.iter().map(String::as_str).collect_vec(),
        config.runs_per_instance,
    )?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    for SolverConfig {
        name,
        instance_range_configs,
    } in &config.solver_configs
    {
        for InstanceRangeConfig { mean, std, range } in instance_range_configs {
            let distrib = Normal::new(*mean, (*mean * *std).abs())?;
            for i in range.clone().filter(|i| *i < config.num_instances) {
                for run in store.runs().to_vec() {
                    let mut sample = distrib.sample(&mut rng);
                    if objective.is_runtime() {
                        sample = sample.max(0.0);
                        if let Some(cutoff) = config.cutoff_time {
                            let status = if sample > cutoff {
                                SolverStatus::Timeout
                            } else {
                                SolverStatus::Success
                            };
                            sample = objective.post_process(sample, cutoff, status);
                        }
                    }
                    store.set_value(sample, name, &instance_name(i), None, Some(run))?;
                }
            }
        }
    }
    Ok(store)
}
