mod batch;
mod local;

pub use batch::{BatchExecutor, BatchSystem, CompletionHook};
pub use local::{LocalExecutor, LocalSummary};

use crate::{
    config::{ConfigErrors, ExecutorConfig, SweepConfig},
    request::JobRequest,
    tracking::CompletionTracker,
};
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("Scheduler command '{command}' could not be started: {source}")]
    Unavailable { command: String, source: io::Error },
    #[error("Scheduler rejected job {job} (exit code {code:?}): {stderr}")]
    Rejected {
        job: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Failed to hand the job script to the scheduler: {0}")]
    Io(#[from] io::Error),
}

impl SubmissionError {
    /// no later submission can succeed either
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Asynchronous job sink: accepting a job says nothing about its outcome.
/// Completion is recorded by the job itself once the executable exits with 0.
pub trait Scheduler {
    /// hand over a job, returns the scheduler's job id
    fn submit(&mut self, job: &JobRequest) -> Result<String, SubmissionError>;

    /// called once after the submission loop
    fn finish(&mut self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

#[derive(Debug)]
pub enum Executors {
    Batch(BatchExecutor),
    Local(LocalExecutor),
    /// log what would be submitted
    DryRun,
}

impl Executors {
    pub fn load(
        config: &SweepConfig,
        config_path: PathBuf,
        tracker: &CompletionTracker,
    ) -> Result<Self, ConfigErrors> {
        let workdir = std::env::current_dir().map_err(ConfigErrors::WorkingDirectory)?;

        match &config.executor {
            ExecutorConfig::Pbs {
                account,
                walltime,
                queue,
                ..
            } => Ok(Self::Batch(BatchExecutor::new(
                BatchSystem::Pbs,
                account.clone().unwrap_or_default(),
                walltime.clone(),
                queue.clone(),
                config,
                workdir,
                CompletionHook::current(config_path)?,
            ))),
            ExecutorConfig::Slurm {
                account,
                walltime,
                partition,
                ..
            } => Ok(Self::Batch(BatchExecutor::new(
                BatchSystem::Slurm,
                account.clone().unwrap_or_default(),
                walltime.clone(),
                partition.clone(),
                config,
                workdir,
                CompletionHook::current(config_path)?,
            ))),
            ExecutorConfig::Local { threads, timeout } => Ok(Self::Local(LocalExecutor::new(
                config.executable.clone(),
                *threads,
                timeout.map(Duration::from_secs),
                tracker.clone(),
            ))),
        }
    }
}

impl Scheduler for Executors {
    fn submit(&mut self, job: &JobRequest) -> Result<String, SubmissionError> {
        match self {
            Self::Batch(executor) => executor.submit(job),
            Self::Local(executor) => executor.submit(job),
            Self::DryRun => {
                info!(
                    job = %job.name,
                    range = %job.range(),
                    output = ?job.output(),
                    "Dry run, not submitting"
                );

                Ok(format!("dry-run:{}", job.name))
            }
        }
    }

    fn finish(&mut self) -> Result<(), ExecutorError> {
        match self {
            Self::Batch(executor) => executor.finish(),
            Self::Local(executor) => executor.finish(),
            Self::DryRun => Ok(()),
        }
    }
}
