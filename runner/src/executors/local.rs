use super::{ExecutorError, Scheduler, SubmissionError};
use crate::{request::JobRequest, tracking::CompletionTracker};
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    mem,
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

#[derive(Debug)]
enum Outcome {
    Completed,
    Failed,
    TimedOut,
}

/// Counters for one pass over the local pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalSummary {
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

/// Executor that works on a local thread pool.
/// Submitted jobs are queued and only run by `finish`, after all submission decisions were made.
#[derive(Debug)]
pub struct LocalExecutor {
    executable: PathBuf,
    threads: Option<usize>,
    timeout: Option<Duration>,
    tracker: CompletionTracker,
    queue: Vec<JobRequest>,
}

impl LocalExecutor {
    pub fn new(
        executable: PathBuf,
        threads: Option<usize>,
        timeout: Option<Duration>,
        tracker: CompletionTracker,
    ) -> Self {
        Self {
            executable,
            threads,
            timeout,
            tracker,
            queue: Vec::new(),
        }
    }

    /// execute jobs concurrently with a thread pool
    #[instrument(skip_all, fields(jobs = jobs.len()), level = "info")]
    pub fn run_all(&self, jobs: &[JobRequest]) -> Result<LocalSummary, ExecutorError> {
        let mut builder = ThreadPoolBuilder::new();
        if let Some(threads) = self.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build()?;
        debug!("Starting thread pool with {} threads", pool.current_num_threads());

        // general counters to provide progress
        let total = jobs.len() as u64;
        let processed = AtomicU64::new(0);

        let outcomes: Vec<Outcome> = pool.install(|| {
            jobs.par_iter()
                .map(|job| {
                    let outcome = self.run_one(job);
                    info!(
                        "Done with {}/{total}",
                        processed.fetch_add(1, Ordering::SeqCst) + 1
                    );

                    outcome
                })
                .collect()
        });

        Ok(outcomes
            .into_iter()
            .fold(LocalSummary::default(), |mut summary, outcome| {
                match outcome {
                    Outcome::Completed => summary.completed += 1,
                    Outcome::Failed => summary.failed += 1,
                    Outcome::TimedOut => summary.timed_out += 1,
                }

                summary
            }))
    }

    fn run_one(&self, job: &JobRequest) -> Outcome {
        let range = job.range();
        debug!(job = %job.name, range = %range, "Processing {:?}", job.request_path);

        let start = Instant::now();
        let mut child = match Command::new(&self.executable)
            .arg("-G")
            .arg(&job.request_path)
            .env("OMP_NUM_THREADS", "1")
            .stdout(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(job = %job.name, "Failed to start {:?}: {e}", self.executable);

                return Outcome::Failed;
            }
        };

        let status: Option<ExitStatus> = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => Some(status),
                Ok(None) => {
                    // child hasn't exited yet
                    if let Err(e) = child.kill().and_then(|_| child.wait()) {
                        warn!(job = %job.name, "Failed to stop timed out job: {e}");
                    }
                    warn!(job = %job.name, "Timed out after {timeout:?}, range stays incomplete");

                    return Outcome::TimedOut;
                }
                Err(e) => {
                    error!(job = %job.name, "Failed to wait for job: {e}");
                    None
                }
            },
            None => child
                .wait()
                .map_err(|e| error!(job = %job.name, "Failed to wait for job: {e}"))
                .ok(),
        };

        debug!(
            "Finished in {} ms | status: {status:?}",
            start.elapsed().as_millis()
        );

        match status {
            Some(status) if status.success() => match self.tracker.mark_completed(range.ids()) {
                Ok(added) => {
                    info!(job = %job.name, added, "Marked range {range} as completed");

                    Outcome::Completed
                }
                Err(e) => {
                    error!(job = %job.name, "Job succeeded but completion was not recorded: {e}");

                    Outcome::Failed
                }
            },
            Some(status) => {
                warn!(
                    job = %job.name,
                    code = ?status.code(),
                    "Job failed, not marking range {range} as completed"
                );

                Outcome::Failed
            }
            None => Outcome::Failed,
        }
    }
}

impl Scheduler for LocalExecutor {
    fn submit(&mut self, job: &JobRequest) -> Result<String, SubmissionError> {
        self.queue.push(job.clone());

        Ok(format!("local-{}", self.queue.len()))
    }

    fn finish(&mut self) -> Result<(), ExecutorError> {
        let jobs = mem::take(&mut self.queue);

        if jobs.is_empty() {
            return Ok(());
        }

        let summary = self.run_all(&jobs)?;
        info!(
            completed = summary.completed,
            failed = summary.failed,
            timed_out = summary.timed_out,
            "Local execution finished"
        );

        Ok(())
    }
}
