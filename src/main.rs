use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use log::{info, warn};
use std::{fs, path::PathBuf};

use portfolio_data::datastructures::*;
use portfolio_data::feature_data::{ExtractorFeatures, FeatureDataStore};
use portfolio_data::marginal_contribution::ContributionContext;
use portfolio_data::performance_data::PerformanceDataStore;
use portfolio_data::runner::{LocalRunner, RunHandle, Runner};
use portfolio_data::selector::CommandSelector;
use portfolio_data::table::Table;
use portfolio_data::worker::{self, FeatureResult, SolverResult};
use portfolio_data::Persisted;

const REGISTRY_COLUMNS: [&str; 1] = ["nickname"];

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[command(flatten)]
    settings: SettingsArgs,
    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty performance store
    InitPerformance {
        #[arg(long, value_delimiter = ',')]
        solvers: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        instances: Vec<String>,
    },
    /// Create an empty feature store
    InitFeatures {
        /// Json object mapping each extractor to its [group, feature] pairs
        #[arg(long)]
        extractor_features: PathBuf,
        #[arg(long, value_delimiter = ',')]
        instances: Vec<String>,
    },
    /// Register a solver and add it to the performance store
    AddSolver {
        solver: String,
        #[arg(long)]
        nickname: Option<String>,
    },
    RemoveSolver {
        solver: String,
    },
    /// Add an instance to both stores
    AddInstance {
        instance: String,
    },
    RemoveInstance {
        instance: String,
    },
    /// List outstanding solver runs
    Jobs {
        #[arg(long)]
        rerun: bool,
    },
    /// List outstanding feature computations
    FeatureJobs {
        /// One job per feature group instead of per extractor
        #[arg(long)]
        groups: bool,
    },
    /// Run every outstanding solver job with a command template containing
    /// {solver}, {instance} and {run}
    Run {
        #[arg(long, num_args = 1.., required = true)]
        command: Vec<String>,
        #[arg(long, default_value_t = 1)]
        parallelism: usize,
        #[arg(long)]
        rerun: bool,
    },
    /// Record a solver result file
    Record {
        #[arg(long)]
        solver: String,
        #[arg(long)]
        instance: String,
        #[arg(long, default_value_t = 1)]
        run: u32,
        result: PathBuf,
    },
    /// Record a feature extractor result file
    RecordFeatures {
        result: PathBuf,
    },
    /// Virtual best solver performance
    Best {
        #[arg(long)]
        objective: Option<String>,
    },
    Ranking {
        #[arg(long)]
        objective: Option<String>,
    },
    /// Marginal contribution per solver
    Contribution {
        #[arg(long)]
        objective: Option<String>,
        /// Train actual selectors instead of using the oracle
        #[arg(long)]
        actual: bool,
        #[arg(long)]
        recompute: bool,
    },
    /// Flattened performance data for external tools
    Export {
        #[arg(long)]
        objective: Option<String>,
        target: PathBuf,
    },
    ExportFeatures {
        target: PathBuf,
    },
    /// Fill missing feature values with the mean of their row
    Impute,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.verbosity.log_level_filter())
        .init();
    let settings = match Settings::from_cli(&args.settings) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration: {e:#}");
            std::process::exit(exitcode::CONFIG);
        }
    };
    run(&settings, args.command)
}

fn resolve_solver(settings: &Settings, name: &str) -> Result<String> {
    if !settings.solver_registry.exists() {
        return Ok(name.to_string());
    }
    let registry = Table::load(&settings.solver_registry)?;
    Ok(registry
        .find(REGISTRY_COLUMNS[0], name)
        .first()
        .map(|s| s.to_string())
        .unwrap_or_else(|| name.to_string()))
}

fn run(settings: &Settings, command: Commands) -> Result<()> {
    let timeout = settings.lock_timeout();
    match command {
        Commands::InitPerformance { solvers, instances } => {
            PerformanceDataStore::create(
                &settings.performance_data,
                &solvers.iter().map(String::as_str).collect_vec(),
                &settings.objectives()?,
                &instances.iter().map(String::as_str).collect_vec(),
                settings.n_runs,
            )?;
        }
        Commands::InitFeatures {
            extractor_features,
            instances,
        } => {
            let features: ExtractorFeatures = serde_json::from_str(
                &fs::read_to_string(&extractor_features)
                    .with_context(|| format!("reading {extractor_features:?}"))?,
            )?;
            FeatureDataStore::create(
                &settings.feature_data,
                &features.keys().map(String::as_str).collect_vec(),
                &instances.iter().map(String::as_str).collect_vec(),
                &features,
            )?;
        }
        Commands::AddSolver { solver, nickname } => {
            Table::open(&settings.solver_registry, &REGISTRY_COLUMNS)?;
            Table::update(&settings.solver_registry, timeout, |registry| {
                registry.add_row(&solver, None)?;
                registry.set(&solver, REGISTRY_COLUMNS[0], nickname.clone())
            })?;
            PerformanceDataStore::update(&settings.performance_data, timeout, |s| {
                s.add_solver(&solver, None)
            })?;
        }
        Commands::RemoveSolver { solver } => {
            let solver = resolve_solver(settings, &solver)?;
            PerformanceDataStore::update(&settings.performance_data, timeout, |s| {
                s.remove_solver(&solver)
            })?;
            if settings.solver_registry.exists() {
                Table::update(&settings.solver_registry, timeout, |registry| {
                    registry.remove_row(&solver)
                })?;
            }
        }
        Commands::AddInstance { instance } => {
            PerformanceDataStore::update(&settings.performance_data, timeout, |s| {
                s.add_instance(&instance, None)
            })?;
            if settings.feature_data.exists() {
                FeatureDataStore::update(&settings.feature_data, timeout, |s| {
                    s.add_instance(&instance, None)
                })?;
            }
        }
        Commands::RemoveInstance { instance } => {
            PerformanceDataStore::update(&settings.performance_data, timeout, |s| {
                s.remove_instance(&instance)
            })?;
            if settings.feature_data.exists() {
                FeatureDataStore::update(&settings.feature_data, timeout, |s| {
                    s.remove_instance(&instance)
                })?;
            }
        }
        Commands::Jobs { rerun } => {
            let store = PerformanceDataStore::load(&settings.performance_data)?;
            for job in store.get_job_list(rerun) {
                println!("{}\t{}\t{}", job.instance, job.run, job.solver);
            }
        }
        Commands::FeatureJobs { groups } => {
            let store = FeatureDataStore::load(&settings.feature_data)?;
            if groups {
                for job in store.remaining_group_jobs() {
                    println!("{job}");
                }
            } else {
                for (instance, extractors) in store.remaining_jobs() {
                    println!("{instance}\t{}", extractors.iter().join(","));
                }
            }
        }
        Commands::Run {
            command,
            parallelism,
            rerun,
        } => {
            let store = PerformanceDataStore::load(&settings.performance_data)?;
            let commands = store
                .get_job_list(rerun)
                .into_iter()
                .map(|job| {
                    command
                        .iter()
                        .map(|part| {
                            part.replace("{solver}", &job.solver)
                                .replace("{instance}", &job.instance)
                                .replace("{run}", &job.run.to_string())
                        })
                        .collect_vec()
                })
                .collect_vec();
            info!("Dispatching {} jobs", commands.len());
            LocalRunner::new().submit(commands, &[], parallelism)?.wait()?;
            let remaining = PerformanceDataStore::load(&settings.performance_data)?
                .get_job_list(false)
                .len();
            if remaining > 0 {
                warn!("{remaining} jobs still outstanding");
            }
        }
        Commands::Record {
            solver,
            instance,
            run,
            result,
        } => {
            let job = PerformanceJob {
                instance,
                run,
                solver: resolve_solver(settings, &solver)?,
            };
            let result = SolverResult::from_file(&result)?;
            worker::record_solver_result(&settings.performance_data, &job, &result, timeout)?;
        }
        Commands::RecordFeatures { result } => {
            let result = FeatureResult::from_file(&result)?;
            worker::record_feature_result(&settings.feature_data, &result, timeout)?;
        }
        Commands::Best { objective } => {
            let store = PerformanceDataStore::load(&settings.performance_data)?;
            for (instance, best) in
                store.best_instance_performance(objective.as_deref(), None, &[])?
            {
                println!("{instance}\t{best}");
            }
            println!("VBS\t{}", store.best_performance(objective.as_deref(), &[])?);
        }
        Commands::Ranking { objective } => {
            let store = PerformanceDataStore::load(&settings.performance_data)?;
            for (solver, score) in store.get_solver_ranking(objective.as_deref())? {
                println!("{solver}\t{score}");
            }
        }
        Commands::Contribution {
            objective,
            actual,
            recompute,
        } => {
            let context = ContributionContext::from_settings(settings);
            let contributions = if actual {
                let selector = CommandSelector::from_command(&settings.selector_command)?;
                context.actual(&selector, objective.as_deref(), recompute)?
            } else {
                context.perfect(objective.as_deref(), recompute)?
            };
            for contribution in contributions {
                println!("{contribution}");
            }
        }
        Commands::Export { objective, target } => {
            PerformanceDataStore::load(&settings.performance_data)?
                .to_external_format(objective.as_deref(), &target)?;
        }
        Commands::ExportFeatures { target } => {
            FeatureDataStore::load(&settings.feature_data)?.to_external_format(&target)?;
        }
        Commands::Impute => {
            let complete = FeatureDataStore::update(&settings.feature_data, timeout, |s| {
                Ok(s.impute_missing_values())
            })?;
            if !complete {
                warn!("Some features have no value on any instance and stay missing");
            }
        }
    }
    Ok(())
}
