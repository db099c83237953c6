use super::{Scheduler, SubmissionError};
use crate::{
    config::{ConfigErrors, SweepConfig},
    request::JobRequest,
    work::Range,
};
use itertools::Itertools;
use std::{
    io::{self, Write},
    iter,
    path::PathBuf,
    process::{Command, Stdio},
};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSystem {
    Pbs,
    Slurm,
}

impl BatchSystem {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Pbs => "qsub",
            Self::Slurm => "sbatch",
        }
    }

    fn job_id_variable(&self) -> &'static str {
        match self {
            Self::Pbs => "PBS_JOBID",
            Self::Slurm => "SLURM_JOB_ID",
        }
    }
}

/// Invocation of this binary that records a range as completed
#[derive(Debug, Clone)]
pub struct CompletionHook {
    pub program: PathBuf,
    pub config: PathBuf,
}

impl CompletionHook {
    /// hook pointing back at the running binary
    pub fn current(config: PathBuf) -> Result<Self, ConfigErrors> {
        Ok(Self {
            program: std::env::current_exe().map_err(ConfigErrors::CurrentExecutable)?,
            config,
        })
    }

    pub fn command(&self, range: &Range) -> String {
        format!(
            "\"{}\" --config \"{}\" complete --n {} --kmin {} --kmax {} --step {}",
            self.program.display(),
            self.config.display(),
            range.n,
            range.kmin,
            range.kmax,
            range.step
        )
    }
}

/// Renders a job script per request and pipes it to `qsub` or `sbatch`
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    system: BatchSystem,
    account: String,
    walltime: String,
    queue: Option<String>,
    executable: PathBuf,
    logs: PathBuf,
    workdir: PathBuf,
    hook: CompletionHook,
}

impl BatchExecutor {
    pub fn new(
        system: BatchSystem,
        account: String,
        walltime: String,
        queue: Option<String>,
        config: &SweepConfig,
        workdir: PathBuf,
        hook: CompletionHook,
    ) -> Self {
        Self {
            system,
            account,
            walltime,
            queue,
            executable: workdir.join(&config.executable),
            logs: workdir.join(&config.paths.logs),
            workdir,
            hook,
        }
    }

    fn header(&self, job: &JobRequest) -> String {
        let name = &job.name;
        let out = self.logs.join(format!("{name}.out"));
        let err = self.logs.join(format!("{name}.err"));

        let directives = match self.system {
            BatchSystem::Pbs => [
                Some(format!("#PBS -N {name}")),
                Some("#PBS -l select=1:ncpus=1".to_owned()),
                Some(format!("#PBS -l walltime={}", self.walltime)),
                Some(format!("#PBS -A {}", self.account)),
                self.queue.as_ref().map(|queue| format!("#PBS -q {queue}")),
                Some(format!("#PBS -o {}", out.display())),
                Some(format!("#PBS -e {}", err.display())),
                Some("#PBS -j n".to_owned()),
            ],
            BatchSystem::Slurm => [
                Some(format!("#SBATCH --job-name={name}")),
                Some("#SBATCH --ntasks=1".to_owned()),
                Some("#SBATCH --cpus-per-task=1".to_owned()),
                Some(format!("#SBATCH --time={}", self.walltime)),
                Some(format!("#SBATCH --account={}", self.account)),
                self.queue
                    .as_ref()
                    .map(|partition| format!("#SBATCH --partition={partition}")),
                Some(format!("#SBATCH --output={}", out.display())),
                Some(format!("#SBATCH --error={}", err.display())),
            ],
        };

        iter::once("#!/bin/bash".to_owned())
            .chain(directives.into_iter().flatten())
            .join("\n")
    }

    /// Full job script: run the executable, record completion only on exit code 0
    pub fn render(&self, job: &JobRequest) -> String {
        let range = job.range();
        let workdir = self.workdir.display();
        let request = job.request_path.display();

        format!(
            r#"{header}
echo "Job ID: ${job_id}"
echo "Running on host: $(hostname)"
cd "{workdir}" || {{ echo "Failed to cd to {workdir}"; exit 1; }}
echo "Processing request file: {request}"
echo "Processing k range: [{kmin}, {kmax}) with step {step}"
echo "Expecting output file: {output}"

export OMP_NUM_THREADS=1
"{executable}" -G "{request}"
EXIT_CODE=$?

echo "Execution finished with exit code: $EXIT_CODE"

if [ $EXIT_CODE -eq 0 ]; then
    echo "Job successful. Marking {count} ids in range [{kmin}, {kmax}) as completed."
    {complete} || echo "Failed to record completion for range [{kmin}, {kmax})"
else
    echo "Job failed (exit code $EXIT_CODE). Not marking range [{kmin}, {kmax}) as completed."
fi

exit $EXIT_CODE
"#,
            header = self.header(job),
            job_id = self.system.job_id_variable(),
            kmin = range.kmin,
            kmax = range.kmax,
            step = range.step,
            count = range.len(),
            output = job.output().display(),
            executable = self.executable.display(),
            complete = self.hook.command(range),
        )
    }
}

impl Scheduler for BatchExecutor {
    #[instrument(skip_all, fields(job = %job.name), level = "debug")]
    fn submit(&mut self, job: &JobRequest) -> Result<String, SubmissionError> {
        let command = self.system.command();

        pipe_script(Command::new(command), command, &job.name, &self.render(job))
    }
}

/// Feed `script` to the scheduler's stdin and return the job id it prints.
/// The child is always waited for, so its exit status and stderr win over a broken pipe.
fn pipe_script(
    mut scheduler: Command,
    command: &str,
    job: &str,
    script: &str,
) -> Result<String, SubmissionError> {
    let mut child = scheduler
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| match source.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                SubmissionError::Unavailable {
                    command: command.to_owned(),
                    source,
                }
            }
            _ => SubmissionError::Io(source),
        })?;

    // dropping stdin closes the pipe so the scheduler sees the end of the script
    let written = child
        .stdin
        .take()
        .map_or(Ok(()), |mut stdin| stdin.write_all(script.as_bytes()));

    let output = child.wait_with_output()?;
    debug!(status = ?output.status, "{command} returned");

    if !output.status.success() {
        return Err(SubmissionError::Rejected {
            job: job.to_owned(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    written?;

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}
