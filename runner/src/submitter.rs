use crate::{
    config::SweepConfig,
    executors::Scheduler,
    request::{GateBounds, JobRequest},
    tracking::CompletionTracker,
    work::Range,
};
use std::{path::PathBuf, thread, time::Duration};
use tracing::{error, info, instrument, warn};

/// Run level counters of one submission pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReport {
    pub submitted: usize,
    /// ranges with at least one started id
    pub skipped: usize,
    pub errors: usize,
    pub cap_reached: bool,
    /// stopped early because the scheduler is unusable
    pub aborted: bool,
}

#[derive(Debug, Clone)]
pub struct JobSubmitter {
    job_cap: usize,
    gates: GateBounds,
    single: bool,
    requests: PathBuf,
    output: PathBuf,
    delay: Duration,
    write_requests: bool,
}

impl JobSubmitter {
    pub fn new(job_cap: usize, gates: GateBounds, single: bool, requests: PathBuf, output: PathBuf) -> Self {
        Self {
            job_cap,
            gates,
            single,
            requests,
            output,
            delay: Duration::ZERO,
            write_requests: true,
        }
    }

    pub fn from_config(config: &SweepConfig) -> Self {
        Self::new(
            config.sweep.job_cap,
            config.gates,
            config.is_single(),
            config.paths.requests.clone(),
            config.paths.output.clone(),
        )
        .with_delay(config.executor.submit_delay())
    }

    /// pause between two submissions, keeps the scheduler responsive
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// skip writing request files, for dry runs
    pub fn without_requests(mut self) -> Self {
        self.write_requests = false;
        self
    }

    /// Walk `ranges` in order and submit every range none of whose ids was started,
    /// until `job_cap` submissions were accepted.
    /// Ids are marked started before the scheduler sees the job and stay started on rejection.
    #[instrument(skip_all, fields(job_cap = self.job_cap), level = "info")]
    pub fn run<S, I>(&self, ranges: I, tracker: &CompletionTracker, scheduler: &mut S) -> SubmitReport
    where
        S: Scheduler,
        I: IntoIterator<Item = Range>,
    {
        let mut report = SubmitReport::default();

        for range in ranges {
            if report.submitted >= self.job_cap {
                info!("Reached job cap ({}), stopping submission", self.job_cap);
                report.cap_reached = true;
                break;
            }

            if range.is_empty() {
                warn!(range = %range, "Range holds no ids, skipping");
                report.skipped += 1;
                continue;
            }

            // all-or-nothing: a single started id claims the whole range
            if let Some(id) = tracker.first_started(&range) {
                info!(range = %range, id = %id, "Skipping range, id was already started");
                report.skipped += 1;
                continue;
            }

            match tracker.mark_started(range.ids()) {
                Ok(added) => info!(range = %range, ids = added, "Marked range as started"),
                Err(e) => {
                    error!(range = %range, "Failed to mark range as started, skipping: {e}");
                    report.errors += 1;
                    continue;
                }
            }

            let job = JobRequest::new(range, self.gates, self.single, &self.requests, &self.output);

            if self.write_requests {
                if let Err(e) = job.write() {
                    error!(range = %range, "Failed to write request file {:?}: {e}", job.request_path);
                    warn!(range = %range, "Ids were marked as started but no job was submitted");
                    report.errors += 1;
                    continue;
                }
            }

            match scheduler.submit(&job) {
                Ok(id) => {
                    report.submitted += 1;
                    info!(
                        range = %range,
                        ids = range.len(),
                        "Submitted job {}/{} as {id}",
                        report.submitted,
                        self.job_cap
                    );

                    if report.submitted >= self.job_cap {
                        info!("Reached job cap ({}), stopping submission", self.job_cap);
                        report.cap_reached = true;
                        break;
                    }
                }
                Err(e) => {
                    error!(range = %range, "Submission failed: {e}");
                    warn!(range = %range, "Ids were marked as started but submission failed");
                    report.errors += 1;

                    if e.is_fatal() {
                        report.aborted = true;
                        break;
                    }
                }
            }

            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
        }

        info!(
            submitted = report.submitted,
            skipped = report.skipped,
            errors = report.errors,
            cap_reached = report.cap_reached,
            aborted = report.aborted,
            "Submission process finished"
        );

        report
    }
}
