mod archive;
mod commands;
mod config;
mod executors;
mod partition;
mod request;
mod submitter;
mod tracking;
mod work;


use crate::{
    commands::FatalError,
    config::SweepConfig,
    work::Range,
};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode, time::Duration};
use tracing::{error, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Partition, submit, track and archive sqct sweeps")]
struct Args {
    /// Sweep configuration file
    #[arg(short, long, env = "SQCT_SWEEP_CONFIG", default_value = "sweep.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit every range of the sweep that has no started id, up to the job cap
    Submit {
        /// override sweep.m
        #[arg(long)]
        m: Option<u32>,
        /// override sweep.range_size
        #[arg(long)]
        range_size: Option<u64>,
        /// override sweep.job_cap
        #[arg(long)]
        job_cap: Option<usize>,
        /// decide and log, but neither track, write requests nor submit
        #[arg(long)]
        dry_run: bool,
    },
    /// Record a range as completed, invoked by job scripts after a successful run
    Complete {
        #[arg(long)]
        n: u64,
        #[arg(long)]
        kmin: u64,
        #[arg(long)]
        kmax: u64,
        #[arg(long)]
        step: Option<u64>,
    },
    /// Move output files whose ids are all completed into the archive
    Archive,
    /// Summarize started and completed ids
    Status,
    /// Write request files for a span of exponents without submitting them
    Generate {
        #[arg(long)]
        m_min: u32,
        #[arg(long)]
        m_max: u32,
        /// directory for the request files, defaults to paths.requests
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Run request files from a directory on this machine
    RunLocal {
        /// defaults to paths.requests
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        threads: Option<usize>,
        /// seconds per job
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn setup_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_tracing();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), FatalError> {
    let mut config = SweepConfig::load(&args.config)?;

    match args.command {
        Command::Submit {
            m,
            range_size,
            job_cap,
            dry_run,
        } => {
            config.sweep.m = m.unwrap_or(config.sweep.m);
            config.sweep.range_size = range_size.unwrap_or(config.sweep.range_size);
            config.sweep.job_cap = job_cap.unwrap_or(config.sweep.job_cap);

            commands::submit(&config, args.config, dry_run).map(drop)
        }
        Command::Complete {
            n,
            kmin,
            kmax,
            step,
        } => {
            let range = Range::new(n, kmin, kmax, step.unwrap_or(config.sweep.step));

            commands::complete(&config, range).map(drop)
        }
        Command::Archive => commands::archive(&config).map(drop),
        Command::Status => commands::status(&config).map(drop),
        Command::Generate { m_min, m_max, dir } => {
            commands::generate(&config, m_min..=m_max, dir).map(drop)
        }
        Command::RunLocal {
            dir,
            threads,
            timeout,
        } => {
            let timeout = timeout.map(Duration::from_secs);

            commands::run_local(&config, dir, threads, timeout).map(drop)
        }
    }
}
