use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info};

use crate::{
    datastructures::ScheduleStep,
    error::StoreError,
    feature_data::FeatureDataStore,
    objective::Objective,
    performance_data::PerformanceDataStore,
};

/// Inputs and outputs of one selector construction, all inside `directory`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorScenario {
    pub directory: PathBuf,
    pub objective: Objective,
    pub cutoff_time: f64,
    /// Seconds the selector tool may spend on tuning.
    pub time_budget: Option<u64>,
}

impl SelectorScenario {
    pub fn new(
        directory: &Path,
        objective: Objective,
        cutoff_time: f64,
        time_budget: Option<u64>,
    ) -> Self {
        Self {
            directory: directory.to_path_buf(),
            objective,
            cutoff_time,
            time_budget,
        }
    }

    pub fn performance_csv(&self) -> PathBuf {
        self.directory.join("performance_data.csv")
    }

    pub fn feature_csv(&self) -> PathBuf {
        self.directory.join("feature_data.csv")
    }

    pub fn model_path(&self) -> PathBuf {
        self.directory.join("portfolio_selector")
    }

    /// Scenario for the portfolio without `solver`.
    ///
    /// Solvers given as paths are named after their last component plus a
    /// crc32 of the full path, so `a/minisat` and `b/minisat` do not share a
    /// directory.
    pub fn ablate(&self, solver: &str) -> SelectorScenario {
        let directory = match Path::new(solver).file_name() {
            Some(name) if name != solver => format!(
                "ablate_{}_{:08x}",
                name.to_string_lossy(),
                crc32fast::hash(solver.as_bytes())
            ),
            _ => format!("ablate_{solver}"),
        };
        SelectorScenario {
            directory: self.directory.join(directory),
            ..self.clone()
        }
    }

    /// Export the training data the selector tool reads.
    pub fn write_inputs(
        &self,
        performance: &PerformanceDataStore,
        features: &FeatureDataStore,
    ) -> Result<()> {
        fs::create_dir_all(&self.directory)
            .with_context(|| format!("creating {:?}", self.directory))?;
        performance
            .to_external_format(Some(&self.objective.name), &self.performance_csv())?;
        features.to_external_format(&self.feature_csv())
    }
}

/// An algorithm selector built and queried through an external tool.
pub trait Selector {
    /// Train a model on the scenario inputs and return the model path.
    fn construct(&self, scenario: &SelectorScenario) -> Result<PathBuf>;

    /// Predicted schedule for one instance.
    fn predict(
        &self,
        model: &Path,
        instance: &str,
        features: &[f64],
    ) -> Result<Vec<ScheduleStep>>;
}

/// Selector tool invoked as a subprocess.
///
/// The tool reads `--performance_csv`/`--feature_csv` and writes the model to
/// `--save`. Prediction passes `--load` and `--feature_vec`; the last line of
/// standard output is the schedule as json: `[["solver", cutoff or null], ..]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSelector {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSelector {
    pub fn new(program: &Path, args: &[String]) -> Self {
        Self {
            program: program.to_path_buf(),
            args: args.to_vec(),
        }
    }

    /// Build from a command line: the program followed by its fixed arguments.
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            StoreError::Invalid("empty selector command".to_string())
        })?;
        Ok(Self::new(Path::new(program), args))
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }

    fn tool_name(&self) -> String {
        self.program.display().to_string()
    }
}

impl Selector for CommandSelector {
    fn construct(&self, scenario: &SelectorScenario) -> Result<PathBuf> {
        fs::create_dir_all(&scenario.directory)?;
        let model = scenario.model_path();
        let stdout_path = scenario.directory.join("construct.out");
        let stderr_path = scenario.directory.join("construct.err");
        let mut command = self.command();
        command
            .arg("--performance_csv")
            .arg(scenario.performance_csv())
            .arg("--feature_csv")
            .arg(scenario.feature_csv())
            .arg("--objective")
            .arg(if scenario.objective.is_runtime() {
                "runtime"
            } else {
                "solution_quality"
            });
        if !scenario.objective.minimise {
            command.arg("--maximize");
        }
        if scenario.objective.is_runtime() {
            command
                .arg("--runtime_cutoff")
                .arg(scenario.cutoff_time.to_string());
        }
        if let Some(budget) = scenario.time_budget {
            command
                .arg("--tune")
                .arg("--wallclock_limit")
                .arg(budget.to_string());
        }
        command.arg("--save").arg(&model);
        debug!("Running {command:?}");
        let status = command
            .stdin(Stdio::null())
            .stdout(File::create(&stdout_path)?)
            .stderr(File::create(&stderr_path)?)
            .status()
            .with_context(|| format!("starting {}", self.tool_name()))?;
        if !status.success() || !model.exists() {
            return Err(StoreError::ExternalTool {
                tool: self.tool_name(),
                stdout: stdout_path,
                stderr: stderr_path,
            }
            .into());
        }
        info!("Constructed selector {model:?}");
        Ok(model)
    }

    fn predict(
        &self,
        model: &Path,
        instance: &str,
        features: &[f64],
    ) -> Result<Vec<ScheduleStep>> {
        let output = self
            .command()
            .arg("--load")
            .arg(model)
            .arg("--feature_vec")
            .arg(features.iter().join(" "))
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("starting {}", self.tool_name()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let schedule = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| l.find('[').map(|start| &l[start..]))
            .and_then(|l| serde_json::from_str::<Vec<(String, Option<f64>)>>(l).ok());
        match schedule {
            Some(steps) if output.status.success() => Ok(steps
                .into_iter()
                .map(|(solver, cutoff)| ScheduleStep { solver, cutoff })
                .collect()),
            _ => {
                let stem = model.with_extension("predict");
                let stdout_path = stem.with_extension("predict.out");
                let stderr_path = stem.with_extension("predict.err");
                fs::write(&stdout_path, &output.stdout)?;
                fs::write(&stderr_path, &output.stderr)?;
                debug!("Prediction for {instance} failed");
                Err(StoreError::ExternalTool {
                    tool: self.tool_name(),
                    stdout: stdout_path,
                    stderr: stderr_path,
                }
                .into())
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandSelector {
        CommandSelector::from_command(&[
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "selector".to_string(),
        ])
        .unwrap()
    }

    const SAVE_MODEL: &str = r#"
        while [ $# -gt 0 ]; do
            if [ "$1" = "--save" ]; then echo model > "$2"; fi
            shift
        done
    "#;

    #[test]
    fn test_construct_and_predict() {
        let dir = tempfile::tempdir().unwrap();
        let scenario = SelectorScenario::new(
            dir.path(),
            "PAR10".parse().unwrap(),
            60.0,
            Some(10),
        );
        let model = shell(SAVE_MODEL).construct(&scenario).unwrap();
        assert_eq!(model, scenario.model_path());

        let predictor = shell(r#"echo "Selected schedule: [[\"A\", 30.0], [\"B\", null]]""#);
        let schedule = predictor.predict(&model, "i1", &[1.0, 2.0]).unwrap();
        assert_eq!(
            schedule,
            vec![ScheduleStep::new("A", Some(30.0)), ScheduleStep::new("B", None)]
        );
    }

    #[test]
    fn test_failures_surface_log_paths() {
        let dir = tempfile::tempdir().unwrap();
        let scenario =
            SelectorScenario::new(dir.path(), "quality:max".parse().unwrap(), 60.0, None);
        let err = shell("echo broken >&2; exit 3").construct(&scenario).unwrap_err();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::ExternalTool { stderr, .. }) => {
                assert_eq!(fs::read_to_string(stderr).unwrap().trim(), "broken");
            }
            other => panic!("unexpected error {other:?}"),
        }
        let err = shell("echo nothing useful")
            .predict(&scenario.model_path(), "i1", &[])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ExternalTool { .. })
        ));
    }

    #[test]
    fn test_ablated_scenario_directory() {
        let scenario = SelectorScenario::new(
            Path::new("out/selector"),
            "PAR10".parse().unwrap(),
            60.0,
            None,
        );
        assert_eq!(
            scenario.ablate("minisat").directory,
            PathBuf::from("out/selector/ablate_minisat")
        );
        let first = scenario.ablate("a/minisat").directory;
        let second = scenario.ablate("b/minisat").directory;
        assert_ne!(first, second);
        for directory in [&first, &second] {
            assert_eq!(directory.parent(), Some(Path::new("out/selector")));
            let name = directory.file_name().unwrap().to_string_lossy();
            assert!(name.starts_with("ablate_minisat_"), "{name}");
        }
        assert_eq!(scenario.ablate("a/minisat").directory, first);
    }
}
