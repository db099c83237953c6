use crate::{
    config::{ConfigErrors, SweepConfig},
    tracking::CompletionTracker,
    work::Range,
};
use globset::{Glob, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

const BLOCK: u64 = 512;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to open archive {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("Failed to read existing archive {path:?}: {source}")]
    Scan { path: PathBuf, source: io::Error },
    #[error("Failed to add {member:?} to the archive: {source}")]
    Append { member: PathBuf, source: io::Error },
    #[error("Failed to finalize archive {path:?}: {source}")]
    Finish { path: PathBuf, source: io::Error },
}

/// Counters of one consolidation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub scanned: usize,
    pub parse_errors: usize,
    pub incomplete: usize,
    pub archived: usize,
    pub removed: usize,
    /// archived files that were already gone before removal
    pub vanished: usize,
    pub removal_failures: usize,
    pub titles_removed: usize,
    pub title_failures: usize,
    pub archive_error: Option<String>,
}

/// Folds output files whose ids are all completed into one tar archive
#[derive(Debug, Clone)]
pub struct ArchiveConsolidator {
    output: PathBuf,
    archive: PathBuf,
    step: u64,
    outputs: GlobMatcher,
    titles: GlobMatcher,
}

impl ArchiveConsolidator {
    pub fn new(
        output: PathBuf,
        archive: PathBuf,
        step: u64,
        titles: GlobMatcher,
    ) -> Result<Self, ConfigErrors> {
        Ok(Self {
            output,
            archive,
            step,
            outputs: Glob::new("uni_*.txt")?.compile_matcher(),
            titles,
        })
    }

    pub fn from_config(config: &SweepConfig) -> Result<Self, ConfigErrors> {
        Self::new(
            config.paths.output.clone(),
            config.paths.archive.clone(),
            config.sweep.step,
            config.title_matcher()?,
        )
    }

    /// Archive, then remove originals, then drop title files regardless of the archive outcome
    #[instrument(skip_all, fields(output = ?self.output), level = "info")]
    pub fn run(&self, tracker: &CompletionTracker) -> ArchiveReport {
        let mut report = ArchiveReport::default();
        let candidates = self.candidates(tracker, &mut report);

        if candidates.is_empty() {
            info!("No completed range files found meeting the criteria for archiving");
        } else {
            info!(
                archive = ?self.archive,
                "Found {} range file(s) ready for archiving",
                candidates.len()
            );

            match append_members(&self.archive, &candidates) {
                Ok(()) => {
                    info!("Archive operation successful");
                    report.archived = candidates.len();
                    self.remove_originals(&candidates, &mut report);
                }
                Err(e) => {
                    error!("Archive operation failed, original files were kept: {e}");
                    report.archive_error = Some(e.to_string());
                }
            }
        }

        self.remove_titles(&mut report);

        info!(
            scanned = report.scanned,
            archived = report.archived,
            removed = report.removed,
            incomplete = report.incomplete,
            parse_errors = report.parse_errors,
            titles_removed = report.titles_removed,
            "Archiving finished"
        );

        report
    }

    fn walk(&self, matcher: &GlobMatcher) -> Vec<PathBuf> {
        WalkBuilder::new(&self.output)
            .max_depth(Some(1))
            .standard_filters(false)
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Failed to scan output directory: {e}");
                    None
                }
            })
            .filter(|entry| entry.depth() == 1)
            .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
            .filter(|entry| matcher.is_match(entry.file_name()))
            .map(DirEntry::into_path)
            .sorted()
            .collect()
    }

    /// files whose every id is completed
    fn candidates(&self, tracker: &CompletionTracker, report: &mut ArchiveReport) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        for path in self.walk(&self.outputs) {
            report.scanned += 1;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy())
                .unwrap_or_default();

            let range = match Range::parse_output_name(&name, self.step) {
                Ok(range) => range,
                Err(e) => {
                    warn!("Skipping {name}: {e}");
                    report.parse_errors += 1;
                    continue;
                }
            };

            if range.is_empty() {
                info!("Skipping {name}: range {range} is empty");
                report.incomplete += 1;
                continue;
            }

            if let Some(id) = tracker.first_incomplete(&range) {
                info!("Skipping {name}: not all ids are completed, {id} is missing");
                report.incomplete += 1;
            } else if !path.is_file() {
                debug!("Skipping {name}: removed while scanning");
            } else {
                info!(
                    "OK: {name} and all {} ids are completed, adding to the archive",
                    range.len()
                );
                candidates.push(path);
            }
        }

        candidates
    }

    fn remove_originals(&self, files: &[PathBuf], report: &mut ArchiveReport) {
        for path in files {
            // check again, another process may have removed it in between
            if !path.exists() {
                warn!("File already removed or missing: {path:?}");
                report.vanished += 1;
                continue;
            }

            match fs::remove_file(path) {
                Ok(()) => {
                    debug!("Removed {path:?}");
                    report.removed += 1;
                }
                Err(e) => {
                    error!("Failed to remove {path:?}: {e}");
                    report.removal_failures += 1;
                }
            }
        }
    }

    fn remove_titles(&self, report: &mut ArchiveReport) {
        for path in self.walk(&self.titles) {
            match fs::remove_file(&path) {
                Ok(()) => report.titles_removed += 1,
                Err(e) => {
                    error!("Failed to remove {path:?}: {e}");
                    report.title_failures += 1;
                }
            }
        }

        if report.titles_removed > 0 {
            info!("{} title files removed", report.titles_removed);
        }
    }
}

/// Append `files` to the tar archive at `path`, creating it if absent.
/// On failure the archive is cut back to the entries it held before.
pub fn append_members(path: &Path, files: &[PathBuf]) -> Result<(), ArchiveError> {
    let existed = path.exists();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| ArchiveError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    let end = if existed {
        end_of_entries(&file).map_err(|source| ArchiveError::Scan {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        0
    };

    write_members(&file, path, end, files).map_err(|error| {
        let restored = if existed {
            restore(&file, end)
        } else {
            fs::remove_file(path)
        };

        if let Err(e) = restored {
            error!("Failed to roll back archive {path:?}: {e}");
        }

        error
    })
}

/// offset right after the last member, where the end-of-archive blocks start
fn end_of_entries(file: &File) -> io::Result<u64> {
    let mut archive = tar::Archive::new(file);
    let mut end = 0;

    for entry in archive.entries()? {
        let entry = entry?;
        end = entry.raw_file_position() + entry.header().entry_size()?.div_ceil(BLOCK) * BLOCK;
    }

    Ok(end)
}

fn write_members(mut file: &File, path: &Path, end: u64, files: &[PathBuf]) -> Result<(), ArchiveError> {
    let finish = |source| ArchiveError::Finish {
        path: path.to_path_buf(),
        source,
    };

    file.set_len(end).map_err(finish)?;
    file.seek(SeekFrom::Start(end)).map_err(finish)?;

    let mut builder = tar::Builder::new(file);
    for member in files {
        // store bare file names, e.g. "uni_8_1_9.txt" instead of "out/uni_8_1_9.txt"
        let name = member.file_name().map(PathBuf::from).unwrap_or_else(|| member.clone());
        debug!("Adding {name:?}");

        builder
            .append_path_with_name(member, &name)
            .map_err(|source| ArchiveError::Append {
                member: member.clone(),
                source,
            })?;
    }

    builder.into_inner().and_then(File::sync_all).map_err(finish)
}

fn restore(mut file: &File, end: u64) -> io::Result<()> {
    file.set_len(end)?;
    file.seek(SeekFrom::Start(end))?;
    file.write_all(&[0; 2 * BLOCK as usize])?;
    file.sync_all()
}
