use std::{
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Running,
    Completed,
}

/// Handle on a batch of submitted commands.
pub trait RunHandle {
    fn status(&self) -> JobStatus;

    /// Block until every command finished; fails if any of them failed.
    fn wait(&self) -> Result<()>;
}

/// Dispatches batches of worker commands.
pub trait Runner {
    type Handle: RunHandle;

    /// Run `commands` (program followed by its arguments) with at most
    /// `parallelism` at a time, once every handle in `dependencies` completed.
    fn submit(
        &self,
        commands: Vec<Vec<String>>,
        dependencies: &[Self::Handle],
        parallelism: usize,
    ) -> Result<Self::Handle>;
}

#[derive(Debug, Default)]
struct BatchState {
    started: AtomicBool,
    finished_commands: AtomicUsize,
    failures: Mutex<Option<Vec<String>>>,
    done: Condvar,
}

#[derive(Debug, Clone)]
pub struct LocalRunHandle {
    name: String,
    total: usize,
    state: Arc<BatchState>,
}

impl LocalRunHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commands of the batch that already exited.
    pub fn progress(&self) -> (usize, usize) {
        (self.state.finished_commands.load(Ordering::SeqCst), self.total)
    }

    fn finish(&self, failures: Vec<String>) {
        let mut guard = self.state.failures.lock();
        *guard = Some(failures);
        self.state.done.notify_all();
    }
}

impl RunHandle for LocalRunHandle {
    fn status(&self) -> JobStatus {
        if self.state.failures.lock().is_some() {
            JobStatus::Completed
        } else if self.state.started.load(Ordering::SeqCst) {
            JobStatus::Running
        } else {
            JobStatus::Waiting
        }
    }

    fn wait(&self) -> Result<()> {
        let mut guard = self.state.failures.lock();
        while guard.is_none() {
            self.state.done.wait(&mut guard);
        }
        match guard.as_deref() {
            Some([]) | None => Ok(()),
            Some(failed) => Err(anyhow!(
                "{} of {} commands in {} failed: {}",
                failed.len(),
                self.total,
                self.name,
                failed.join("; ")
            )),
        }
    }
}

/// Runs every command as a child process of this one.
#[derive(Debug, Default)]
pub struct LocalRunner {
    submitted: AtomicUsize,
}

impl LocalRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Runner for LocalRunner {
    type Handle = LocalRunHandle;

    fn submit(
        &self,
        commands: Vec<Vec<String>>,
        dependencies: &[LocalRunHandle],
        parallelism: usize,
    ) -> Result<LocalRunHandle> {
        let id = self.submitted.fetch_add(1, Ordering::SeqCst);
        let handle = LocalRunHandle {
            name: format!("batch-{id}"),
            total: commands.len(),
            state: Arc::default(),
        };
        let dependencies = dependencies.to_vec();
        let batch = handle.clone();
        thread::Builder::new()
            .name(handle.name.clone())
            .spawn(move || {
                for dependency in &dependencies {
                    if let Err(e) = dependency.wait() {
                        warn!("{} continues after failed dependency: {e}", batch.name);
                    }
                }
                batch.state.started.store(true, Ordering::SeqCst);
                info!("Starting {} with {} commands", batch.name, batch.total);
                let failures = run_all(&batch, commands, parallelism);
                batch.finish(failures);
            })
            .with_context(|| format!("spawning coordinator for {}", handle.name))?;
        Ok(handle)
    }
}

fn run_all(
    batch: &LocalRunHandle,
    commands: Vec<Vec<String>>,
    parallelism: usize,
) -> Vec<String> {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let workers = parallelism.clamp(1, commands.len().max(1));
    for command in commands {
        // The receiver outlives every send.
        let _ = sender.send(command);
    }
    drop(sender);
    let failures = Mutex::new(Vec::new());
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                while let Ok(command) = receiver.recv() {
                    if let Err(e) = run_command(&command) {
                        warn!("{e:#}");
                        failures.lock().push(command.join(" "));
                    }
                    batch.state.finished_commands.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });
    failures.into_inner()
}

fn run_command(command: &[String]) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("empty command");
    };
    debug!("Running {}", command.join(" "));
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .with_context(|| format!("starting {program}"))?;
    if !status.success() {
        bail!("{} exited with {status}", command.join(" "));
    }
    Ok(())
}
