use crate::{partition::RangePartitioner, request::GateBounds};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

/// resolve a bare command name through `PATH`
pub fn find_in_path(command: &str) -> Option<PathBuf> {
    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(command))
            .find(|candidate| matches!(check_executable(candidate), Ok(true)))
    })
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to read config {path:?}: {source}")]
    Read { path: PathBuf, source: Error },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Failed to determine the working directory: {0}")]
    WorkingDirectory(Error),
    #[error("Failed to locate the running executable: {0}")]
    CurrentExecutable(Error),
    #[error("Preflight checks failed, see the errors above")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    pub sweep: SweepParameters,
    #[serde(default)]
    pub gates: GateBounds,
    #[serde(default)]
    pub paths: PathConfig,
    // the approximation executable, invoked as `<executable> -G <request>`
    #[serde(default = "default_executable")]
    pub executable: PathBuf,
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SweepParameters {
    // n = 2^m, k runs over [1, 2^(m-1))
    pub m: u32,
    // number of k values per job, 1 switches to single-id jobs
    #[serde(default = "default_range_size")]
    pub range_size: u64,
    #[serde(default = "default_job_cap")]
    pub job_cap: usize,
    #[serde(default = "default_step")]
    pub step: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PathConfig {
    #[serde(default = "default_requests")]
    pub requests: PathBuf,
    #[serde(default = "default_output")]
    pub output: PathBuf,
    #[serde(default = "default_logs")]
    pub logs: PathBuf,
    #[serde(default = "default_started")]
    pub started: PathBuf,
    #[serde(default = "default_completed")]
    pub completed: PathBuf,
    #[serde(default = "default_archive")]
    pub archive: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            requests: default_requests(),
            output: default_output(),
            logs: default_logs(),
            started: default_started(),
            completed: default_completed(),
            archive: default_archive(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    // auxiliary per-run files removed on every archive pass
    #[serde(default = "default_title_glob")]
    pub title_glob: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            title_glob: default_title_glob(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum ExecutorConfig {
    Pbs {
        account: Option<String>,
        #[serde(default = "default_walltime")]
        walltime: String,
        queue: Option<String>,
        #[serde(default = "default_submit_delay")]
        submit_delay_ms: u64,
    },
    Slurm {
        account: Option<String>,
        #[serde(default = "default_walltime")]
        walltime: String,
        partition: Option<String>,
        #[serde(default = "default_submit_delay")]
        submit_delay_ms: u64,
    },
    Local {
        threads: Option<usize>,
        // seconds per job
        timeout: Option<u64>,
    },
}

impl ExecutorConfig {
    /// command used to hand scripts to the batch system, if any
    pub fn scheduler_command(&self) -> Option<&'static str> {
        match self {
            Self::Pbs { .. } => Some("qsub"),
            Self::Slurm { .. } => Some("sbatch"),
            Self::Local { .. } => None,
        }
    }

    pub fn submit_delay(&self) -> Duration {
        match self {
            Self::Pbs {
                submit_delay_ms, ..
            }
            | Self::Slurm {
                submit_delay_ms, ..
            } => Duration::from_millis(*submit_delay_ms),
            Self::Local { .. } => Duration::ZERO,
        }
    }
}

impl SweepConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn n(&self) -> u64 {
        self.partitioner().n()
    }

    pub fn is_single(&self) -> bool {
        self.sweep.range_size == 1
    }

    pub fn partitioner(&self) -> RangePartitioner {
        RangePartitioner::for_exponent(self.sweep.m, self.sweep.range_size, self.sweep.step)
    }

    pub fn title_matcher(&self) -> Result<GlobMatcher, ConfigErrors> {
        Ok(Glob::new(&self.archive.title_glob)?.compile_matcher())
    }

    /// create request, log and output directories
    pub fn prepare_directories(&self) -> Result<(), Error> {
        for dir in [&self.paths.requests, &self.paths.logs, &self.paths.output] {
            fs::create_dir_all(dir)?;
        }

        Ok(())
    }

    /// Validate sweep parameters, returns true if any error was found
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if !(1..=63).contains(&self.sweep.m) {
            error!("sweep.m must be within 1..=63, got {}", self.sweep.m);
            contains_error = true;
        }

        if self.sweep.range_size == 0 {
            error!("sweep.range_size must be a positive integer");
            contains_error = true;
        }

        if self.sweep.step == 0 {
            error!("sweep.step must be a positive integer");
            contains_error = true;
        } else if self.sweep.step % 2 == 1 {
            warn!(
                "sweep.step is odd ({}), even k values will be part of the sweep",
                self.sweep.step
            );
        }

        if self.sweep.job_cap == 0 {
            warn!("sweep.job_cap is 0, nothing will be submitted");
        }

        if self.gates.min > self.gates.max {
            error!(
                "gates.min ({}) must not exceed gates.max ({})",
                self.gates.min, self.gates.max
            );
            contains_error = true;
        }

        if let Err(e) = self.title_matcher() {
            error!("archive.title_glob is invalid: {e}");
            contains_error = true;
        }

        contains_error
    }

    /// Validate everything needed to actually run jobs, returns true if any error was found
    pub fn execution_checks(&self) -> bool {
        let mut contains_error = false;

        match check_executable(&self.executable) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "Executable {} is not executable",
                    self.executable.to_string_lossy()
                );
                contains_error = true;
            }
            Err(e) => {
                error!(
                    "Failed to find executable at {}: {e}",
                    self.executable.to_string_lossy()
                );
                contains_error = true;
            }
        }

        match &self.executor {
            ExecutorConfig::Pbs { account, .. } | ExecutorConfig::Slurm { account, .. } => {
                match account.as_deref().map(str::trim) {
                    None | Some("") => {
                        error!("executor.account is required to submit batch jobs");
                        contains_error = true;
                    }
                    Some("sqct") => warn!(
                        "executor.account is set to 'sqct', please ensure this is your correct project/account string"
                    ),
                    Some(_) => {}
                }
            }
            ExecutorConfig::Local { threads, .. } => {
                if *threads == Some(0) {
                    error!("executor.threads cannot be 0");
                    contains_error = true;
                }
            }
        }

        if let Some(command) = self.executor.scheduler_command() {
            if find_in_path(command).is_none() {
                error!("Scheduler command '{command}' was not found in PATH, is the batch system installed?");
                contains_error = true;
            }
        }

        contains_error
    }
}

fn default_executable() -> PathBuf {
    PathBuf::from("./sqct")
}

fn default_range_size() -> u64 {
    512
}

fn default_job_cap() -> usize {
    128
}

fn default_step() -> u64 {
    2
}

fn default_requests() -> PathBuf {
    PathBuf::from("configs")
}

fn default_output() -> PathBuf {
    PathBuf::from("out")
}

fn default_logs() -> PathBuf {
    PathBuf::from("logs")
}

fn default_started() -> PathBuf {
    PathBuf::from("started_ids.txt")
}

fn default_completed() -> PathBuf {
    PathBuf::from("completed_ids.txt")
}

fn default_archive() -> PathBuf {
    PathBuf::from("out/archive_ranges.tar")
}

fn default_title_glob() -> String {
    "*.title".to_owned()
}

fn default_walltime() -> String {
    "4800:00:00".to_owned()
}

fn default_submit_delay() -> u64 {
    500
}
