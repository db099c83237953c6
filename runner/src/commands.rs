use crate::{
    archive::{ArchiveConsolidator, ArchiveReport},
    config::{check_executable, ConfigErrors, SweepConfig},
    executors::{ExecutorError, Executors, LocalExecutor, LocalSummary, Scheduler},
    partition::RangePartitioner,
    request::{JobRequest, RequestError},
    submitter::{JobSubmitter, SubmitReport},
    tracking::{CompletionTracker, IdStore, TrackingError, TrackingSummary},
    work::Range,
};
use globset::Glob;
use ignore::WalkBuilder;
use itertools::Itertools;
use std::{env, fs, io, ops::RangeInclusive, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum FatalError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Tracking(#[from] TrackingError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("Failed to prepare directories: {0}")]
    Directories(io::Error),
}

/// Submit every unclaimed range of the sweep, up to the job cap.
/// A dry run reads the tracking files but neither appends, writes requests nor submits.
pub fn submit(
    config: &SweepConfig,
    config_path: PathBuf,
    dry_run: bool,
) -> Result<SubmitReport, FatalError> {
    if config.preflight_checks() | (!dry_run && config.execution_checks()) {
        return Err(ConfigErrors::Preflight.into());
    }

    let partitioner = config.partitioner();
    info!(
        m = config.sweep.m,
        n = partitioner.n(),
        max_k = partitioner.n() / 2,
        range_size = config.sweep.range_size,
        job_cap = config.sweep.job_cap,
        ranges = partitioner.len(),
        executable = ?config.executable,
        "Starting submission"
    );

    let started = IdStore::open(&config.paths.started)?;
    let completed = IdStore::open(&config.paths.completed)?;
    let submitter = JobSubmitter::from_config(config);

    let (tracker, submitter, mut scheduler) = if dry_run {
        info!("Dry run, tracking files and requests stay untouched");
        let tracker = CompletionTracker::new(started.detach(), completed.detach());

        (tracker, submitter.without_requests(), Executors::DryRun)
    } else {
        config.prepare_directories().map_err(FatalError::Directories)?;

        let tracker = CompletionTracker::new(started, completed);
        let config_path = env::current_dir()
            .map_err(ConfigErrors::WorkingDirectory)?
            .join(config_path);
        // local jobs record completions through the same tracker
        let scheduler = Executors::load(config, config_path, &tracker)?;

        (tracker, submitter, scheduler)
    };

    let report = submitter.run(partitioner, &tracker, &mut scheduler);
    scheduler.finish()?;

    if report.errors > 0 {
        warn!(
            "{} range(s) were marked as started without a running job, see `status`",
            report.errors
        );
    }

    Ok(report)
}

/// Record every id of `range` as completed, returns how many were new
pub fn complete(config: &SweepConfig, range: Range) -> Result<usize, FatalError> {
    if range.is_empty() {
        warn!(range = %range, "Range holds no ids, nothing to record");
        return Ok(0);
    }

    let tracker = CompletionTracker::completed_only(&config.paths.completed)?;
    let added = tracker.mark_completed(range.ids())?;
    info!(range = %range, added, "Marked range as completed");

    Ok(added)
}

pub fn archive(config: &SweepConfig) -> Result<ArchiveReport, FatalError> {
    let consolidator = ArchiveConsolidator::from_config(config)?;
    let tracker = CompletionTracker::completed_only(&config.paths.completed)?;

    let report = consolidator.run(&tracker);
    if let Some(e) = &report.archive_error {
        warn!("Archive was not updated, rerun once the problem is fixed: {e}");
    }
    if report.removal_failures > 0 {
        warn!(
            "Some archived files could not be removed ({})",
            report.removal_failures
        );
    }

    Ok(report)
}

pub fn status(config: &SweepConfig) -> Result<TrackingSummary, FatalError> {
    let tracker = CompletionTracker::open(&config.paths.started, &config.paths.completed)?;
    let summary = tracker.summary();

    info!(
        started = summary.started,
        completed = summary.completed,
        incomplete = summary.incomplete.len(),
        unclaimed = summary.unclaimed.len(),
        "Tracking status"
    );
    if !summary.incomplete.is_empty() {
        info!(
            "{} id(s) are started but not completed, either still running or stuck after a failed job",
            summary.incomplete.len()
        );
        debug!("Incomplete: {}", summary.incomplete.iter().join(" "));
    }
    if !summary.unclaimed.is_empty() {
        warn!(
            "{} id(s) are completed without being started",
            summary.unclaimed.len()
        );
        debug!("Unclaimed: {}", summary.unclaimed.iter().join(" "));
    }

    Ok(summary)
}

/// Write request files for every range of every exponent, returns how many were written
pub fn generate(
    config: &SweepConfig,
    exponents: RangeInclusive<u32>,
    dir: Option<PathBuf>,
) -> Result<usize, FatalError> {
    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let requests = dir.unwrap_or_else(|| config.paths.requests.clone());
    fs::create_dir_all(&requests).map_err(FatalError::Directories)?;

    let mut written = 0usize;
    for m in exponents {
        for range in RangePartitioner::for_exponent(m, config.sweep.range_size, config.sweep.step) {
            let job = JobRequest::new(
                range,
                config.gates,
                config.is_single(),
                &requests,
                &config.paths.output,
            );

            match job.write() {
                Ok(()) => {
                    debug!("Generated request file {:?}", job.request_path);
                    written += 1;
                }
                Err(e) => error!("Failed to write {:?}: {e}", job.request_path),
            }
        }
    }

    info!(written, dir = ?requests, "Generated request files");

    Ok(written)
}

/// Run the request files of `dir` on the local pool.
/// Requests whose output already exists or that do not parse are skipped.
pub fn run_local(
    config: &SweepConfig,
    dir: Option<PathBuf>,
    threads: Option<usize>,
    timeout: Option<Duration>,
) -> Result<LocalSummary, FatalError> {
    if !matches!(check_executable(&config.executable), Ok(true)) {
        error!("Executable {:?} not found or not executable", config.executable);
        return Err(ConfigErrors::Preflight.into());
    }

    let dir = dir.unwrap_or_else(|| config.paths.requests.clone());
    let matcher = Glob::new("config_*.txt")
        .map_err(ConfigErrors::from)?
        .compile_matcher();
    let tracker = CompletionTracker::open(&config.paths.started, &config.paths.completed)?;

    let mut jobs = Vec::new();
    for path in WalkBuilder::new(&dir)
        .max_depth(Some(1))
        .standard_filters(false)
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
        .filter(|entry| matcher.is_match(entry.file_name()))
        .map(|entry| entry.into_path())
        .sorted()
    {
        let job = match JobRequest::from_file(&path) {
            Ok(job) => job,
            Err(RequestError::Read(e)) => {
                error!("Failed to read {path:?}: {e}");
                continue;
            }
            Err(RequestError::Parse(e)) => {
                warn!("Skipping {path:?}: {e}");
                continue;
            }
        };

        if job.output().exists() {
            info!("Skipping {path:?}, output {:?} already exists", job.output());
            continue;
        }

        tracker.mark_started(job.range().ids())?;
        jobs.push(job);
    }

    info!("Found {} request file(s) to process", jobs.len());

    let executor = LocalExecutor::new(config.executable.clone(), threads, timeout, tracker);
    let summary = executor.run_all(&jobs)?;
    info!(
        completed = summary.completed,
        failed = summary.failed,
        timed_out = summary.timed_out,
        "All request files processed"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ExecutorConfig, PathConfig},
        request::GateBounds,
        work::WorkId,
    };
    use std::{os::unix::fs::PermissionsExt, path::Path};

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("sqct");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        path
    }

    /// n = 16 in ranges of two ids: [1, 5) and [5, 8)
    fn config(dir: &Path, executable: PathBuf) -> SweepConfig {
        let mut config: SweepConfig = serde_yaml::from_str(
            "
sweep: { m: 4, range_size: 2 }
executor: { name: local }
",
        )
        .unwrap();
        config.executable = executable;
        config.executor = ExecutorConfig::Local {
            threads: Some(2),
            timeout: None,
        };
        config.paths = PathConfig {
            requests: dir.join("configs"),
            output: dir.join("out"),
            logs: dir.join("logs"),
            started: dir.join("started_ids.txt"),
            completed: dir.join("completed_ids.txt"),
            archive: dir.join("out/archive_ranges.tar"),
        };

        config
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .sorted()
            .collect()
    }

    #[test]
    fn submit_runs_local_jobs_and_records_completion() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), script(dir.path(), "test \"$1\" = -G"));

        let report = submit(&config, dir.path().join("sweep.yaml"), false).unwrap();

        assert_eq!(report.submitted, 2);
        assert!(config.paths.requests.join("config_16_1_5.txt").is_file());
        assert!(config.paths.requests.join("config_16_5_8.txt").is_file());
        assert!(config.paths.logs.is_dir());
        let ids = vec!["16_1", "16_3", "16_5", "16_7"];
        assert_eq!(lines(&config.paths.started), ids);
        assert_eq!(lines(&config.paths.completed), ids);

        // a second pass finds everything claimed
        let report = submit(&config, dir.path().join("sweep.yaml"), false).unwrap();
        assert_eq!(report.submitted, 0);
        assert_eq!(report.skipped, 2);
    }

    #[test]
    fn dry_run_leaves_tracking_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        // no executable needed for a dry run
        let config = config(dir.path(), dir.path().join("absent"));
        fs::write(&config.paths.started, "16_1\n").unwrap();
        fs::write(&config.paths.completed, "16_1\n").unwrap();

        let report = submit(&config, dir.path().join("sweep.yaml"), true).unwrap();

        assert_eq!(report.submitted, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(fs::read_to_string(&config.paths.started).unwrap(), "16_1\n");
        assert_eq!(fs::read_to_string(&config.paths.completed).unwrap(), "16_1\n");
        assert!(!config.paths.requests.exists());
    }

    #[test]
    fn invalid_config_stops_before_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), script(dir.path(), "exit 0"));
        config.sweep.range_size = 0;

        let result = submit(&config, dir.path().join("sweep.yaml"), false);

        assert!(matches!(
            result,
            Err(FatalError::Config(ConfigErrors::Preflight))
        ));
        assert!(!config.paths.started.exists());
    }

    #[test]
    fn complete_only_touches_completed_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), dir.path().join("absent"));

        assert_eq!(complete(&config, Range::new(8, 1, 8, 2)).unwrap(), 4);
        assert_eq!(complete(&config, Range::new(8, 1, 8, 2)).unwrap(), 0);

        assert_eq!(lines(&config.paths.completed), vec!["8_1", "8_3", "8_5", "8_7"]);
        assert!(!config.paths.started.exists());
    }

    #[test]
    fn complete_ignores_empty_range() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), dir.path().join("absent"));

        assert_eq!(complete(&config, Range::new(8, 9, 9, 2)).unwrap(), 0);
        assert!(!config.paths.completed.exists());
    }

    #[test]
    fn status_reports_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), dir.path().join("absent"));
        fs::write(&config.paths.started, "8_1\n8_3\n").unwrap();
        fs::write(&config.paths.completed, "8_1\n16_9\n").unwrap();

        let summary = status(&config).unwrap();

        assert_eq!(summary.started, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.incomplete, vec![WorkId::new(8, 3)]);
        assert_eq!(summary.unclaimed, vec![WorkId::new(16, 9)]);
        assert_eq!(fs::read_to_string(&config.paths.started).unwrap(), "8_1\n8_3\n");
    }

    #[test]
    fn generate_covers_every_exponent() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), dir.path().join("absent"));
        let requests = dir.path().join("generated");

        let written = generate(&config, 2..=4, Some(requests.clone())).unwrap();

        assert_eq!(written, 4);
        let names = fs::read_dir(&requests)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .sorted()
            .collect_vec();
        assert_eq!(
            names,
            vec![
                "config_16_1_5.txt",
                "config_16_5_8.txt",
                "config_4_1_2.txt",
                "config_8_1_4.txt"
            ]
        );
        assert!(!config.paths.started.exists());
    }

    #[test]
    fn run_local_skips_finished_and_malformed_requests() {
        let dir = tempfile::tempdir().unwrap();
        let started = dir.path().join("started_ids.txt");
        // succeeds only if the ids were claimed before the run
        let executable = script(
            dir.path(),
            &format!("grep -qx 8_5 \"{}\"", started.display()),
        );
        let config = config(dir.path(), executable);
        fs::create_dir_all(&config.paths.requests).unwrap();
        fs::create_dir_all(&config.paths.output).unwrap();

        let finished = JobRequest::new(
            Range::new(8, 1, 5, 2),
            GateBounds::default(),
            false,
            &config.paths.requests,
            &config.paths.output,
        );
        finished.write().unwrap();
        fs::write(finished.output(), "done").unwrap();
        let pending = JobRequest::new(
            Range::new(8, 5, 8, 2),
            GateBounds::default(),
            false,
            &config.paths.requests,
            &config.paths.output,
        );
        pending.write().unwrap();
        fs::write(config.paths.requests.join("config_broken.txt"), "garbage\n").unwrap();

        let summary = run_local(&config, None, Some(1), None).unwrap();

        assert_eq!(
            summary,
            LocalSummary {
                completed: 1,
                failed: 0,
                timed_out: 0
            }
        );
        assert_eq!(lines(&started), vec!["8_5", "8_7"]);
        assert_eq!(lines(&config.paths.completed), vec!["8_5", "8_7"]);
    }

    #[test]
    fn run_local_requires_executable() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), dir.path().join("absent"));

        assert!(matches!(
            run_local(&config, None, None, None),
            Err(FatalError::Config(ConfigErrors::Preflight))
        ));
    }
}
