use crate::work::{Range, WorkId};
use itertools::Itertools;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("Failed to read tracking file {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to append to tracking file {path:?}: {source}")]
    Append { path: PathBuf, source: io::Error },
}

/// Append-only set of work ids.
/// The file variant keeps an index hydrated once on open, so membership never rescans the file.
#[derive(Debug)]
pub enum IdStore {
    File { path: PathBuf, index: HashSet<WorkId> },
    /// detached copy, appends are only kept in memory
    Memory { index: HashSet<WorkId> },
}

impl IdStore {
    /// hydrate the index from `path`, a missing file is an empty store
    pub fn open(path: &Path) -> Result<Self, TrackingError> {
        let read_error = |source| TrackingError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut index = HashSet::new();

        match File::open(path) {
            Ok(file) => {
                let mut malformed = 0usize;

                for (number, line) in BufReader::new(file).lines().enumerate() {
                    let line = line.map_err(read_error)?;
                    let token = line.trim();

                    if token.is_empty() {
                        continue;
                    }

                    match token.parse::<WorkId>() {
                        Ok(id) => {
                            index.insert(id);
                        }
                        Err(error) => {
                            malformed += 1;
                            warn!(path = ?path, line = number + 1, "Skipping tracking entry: {error}");
                        }
                    }
                }

                info!(path = ?path, ids = index.len(), malformed, "Loaded tracking file");
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "Tracking file does not exist yet, starting empty");
            }
            Err(error) => return Err(read_error(error)),
        }

        Ok(Self::File {
            path: path.to_path_buf(),
            index,
        })
    }

    pub fn memory() -> Self {
        Self::Memory {
            index: HashSet::new(),
        }
    }

    /// keep the current contents but stop writing through to disk
    pub fn detach(self) -> Self {
        match self {
            Self::File { index, .. } | Self::Memory { index } => Self::Memory { index },
        }
    }

    fn index(&self) -> &HashSet<WorkId> {
        match self {
            Self::File { index, .. } | Self::Memory { index } => index,
        }
    }

    pub fn contains(&self, id: &WorkId) -> bool {
        self.index().contains(id)
    }

    pub fn len(&self) -> usize {
        self.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index().is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkId> {
        self.index().iter()
    }

    /// Append all ids not yet present, returns how many were new.
    /// The index is only updated once the write went through.
    pub fn append<I: IntoIterator<Item = WorkId>>(&mut self, ids: I) -> Result<usize, TrackingError> {
        let fresh = ids
            .into_iter()
            .filter(|id| !self.contains(id))
            .unique()
            .collect_vec();

        if fresh.is_empty() {
            return Ok(0);
        }

        match self {
            Self::File { path, index } => {
                let lines = fresh.iter().map(|id| format!("{id}\n")).collect::<String>();

                OpenOptions::new()
                    .create(true)
                    .read(true)
                    .append(true)
                    .open(&*path)
                    .and_then(|mut file| {
                        // a torn or hand edited last line would swallow the first new id
                        let lines = if ends_mid_line(&mut file)? {
                            format!("\n{lines}")
                        } else {
                            lines
                        };

                        file.write_all(lines.as_bytes())?;
                        file.flush()
                    })
                    .map_err(|source| TrackingError::Append {
                        path: path.clone(),
                        source,
                    })?;

                index.extend(fresh.iter().copied());
            }
            Self::Memory { index } => index.extend(fresh.iter().copied()),
        }

        Ok(fresh.len())
    }
}

fn ends_mid_line(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;

    Ok(last[0] != b'\n')
}

#[derive(Debug)]
pub struct TrackingStores {
    started: IdStore,
    completed: IdStore,
}

/// Counts derived from both stores, see `CompletionTracker::summary`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingSummary {
    pub started: usize,
    pub completed: usize,
    /// started but never completed, either in flight or stuck
    pub incomplete: Vec<WorkId>,
    /// completed without a started entry
    pub unclaimed: Vec<WorkId>,
}

/// Transparent, thread safe wrapper over the started and completed stores
#[derive(Debug, Clone)]
pub struct CompletionTracker(Arc<FairMutex<TrackingStores>>);

impl CompletionTracker {
    pub fn new(started: IdStore, completed: IdStore) -> Self {
        Self(Arc::new(FairMutex::new(TrackingStores { started, completed })))
    }

    pub fn open(started: &Path, completed: &Path) -> Result<Self, TrackingError> {
        Ok(Self::new(IdStore::open(started)?, IdStore::open(completed)?))
    }

    /// Only hydrate the completed store, for passes that never look at started ids
    pub fn completed_only(completed: &Path) -> Result<Self, TrackingError> {
        Ok(Self::new(IdStore::memory(), IdStore::open(completed)?))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, TrackingStores> {
        self.0.lock_arc()
    }

    pub fn is_started(&self, id: &WorkId) -> bool {
        self.lock().started.contains(id)
    }

    pub fn is_completed(&self, id: &WorkId) -> bool {
        self.lock().completed.contains(id)
    }

    /// first id of the range that was already started, if any
    pub fn first_started(&self, range: &Range) -> Option<WorkId> {
        let stores = self.lock();

        range.ids().find(|id| stores.started.contains(id))
    }

    /// first id of the range that is not completed yet, if any
    pub fn first_incomplete(&self, range: &Range) -> Option<WorkId> {
        let stores = self.lock();

        range.ids().find(|id| !stores.completed.contains(id))
    }

    pub fn mark_started<I: IntoIterator<Item = WorkId>>(&self, ids: I) -> Result<usize, TrackingError> {
        self.lock().started.append(ids)
    }

    pub fn mark_completed<I: IntoIterator<Item = WorkId>>(&self, ids: I) -> Result<usize, TrackingError> {
        self.lock().completed.append(ids)
    }

    pub fn summary(&self) -> TrackingSummary {
        let stores = self.lock();

        TrackingSummary {
            started: stores.started.len(),
            completed: stores.completed.len(),
            incomplete: stores
                .started
                .iter()
                .filter(|id| !stores.completed.contains(id))
                .copied()
                .sorted()
                .collect(),
            unclaimed: stores
                .completed
                .iter()
                .filter(|id| !stores.started.contains(id))
                .copied()
                .sorted()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hydrates_and_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("started_ids.txt");
        fs::write(&path, "8_1\n\n  8_3  \ngarbage\n8_1\n").unwrap();

        let store = IdStore::open(&path).unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.contains(&WorkId::new(8, 1)));
        assert!(store.contains(&WorkId::new(8, 3)));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdStore::open(&dir.path().join("absent.txt")).unwrap();

        assert_eq!(store.len(), 0);
    }

    #[test]
    fn appends_only_new_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("completed_ids.txt");
        let mut store = IdStore::open(&path).unwrap();

        let ids = [WorkId::new(8, 1), WorkId::new(8, 3), WorkId::new(8, 1)];
        assert_eq!(store.append(ids).unwrap(), 2);
        assert_eq!(store.append(ids).unwrap(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "8_1\n8_3\n");

        let reopened = IdStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn append_after_unterminated_line_keeps_both_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("started_ids.txt");
        fs::write(&path, "8_1").unwrap();

        let mut store = IdStore::open(&path).unwrap();
        assert!(!store.is_empty());
        store.append([WorkId::new(8, 3)]).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "8_1\n8_3\n");
        let reopened = IdStore::open(&path).unwrap();
        assert!(reopened.contains(&WorkId::new(8, 1)));
        assert!(reopened.contains(&WorkId::new(8, 3)));
    }

    #[test]
    fn append_failure_leaves_index_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened for appending
        let mut store = IdStore::File {
            path: dir.path().to_path_buf(),
            index: HashSet::new(),
        };

        assert!(matches!(
            store.append([WorkId::new(8, 1)]),
            Err(TrackingError::Append { .. })
        ));
        assert!(!store.contains(&WorkId::new(8, 1)));
    }

    #[test]
    fn detached_store_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("started_ids.txt");
        fs::write(&path, "8_1\n").unwrap();

        let mut store = IdStore::open(&path).unwrap().detach();
        store.append([WorkId::new(8, 3)]).unwrap();

        assert!(store.contains(&WorkId::new(8, 1)));
        assert!(store.contains(&WorkId::new(8, 3)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "8_1\n");
    }

    #[test]
    fn summary_reports_both_differences() {
        let tracker = CompletionTracker::new(IdStore::memory(), IdStore::memory());
        tracker
            .mark_started(Range::new(8, 1, 8, 2).ids())
            .unwrap();
        tracker
            .mark_completed([WorkId::new(8, 1), WorkId::new(8, 3), WorkId::new(16, 9)])
            .unwrap();

        let summary = tracker.summary();
        assert_eq!(summary.started, 4);
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.incomplete, vec![WorkId::new(8, 5), WorkId::new(8, 7)]);
        assert_eq!(summary.unclaimed, vec![WorkId::new(16, 9)]);
    }

    #[test]
    fn range_queries() {
        let tracker = CompletionTracker::new(IdStore::memory(), IdStore::memory());
        let range = Range::new(8, 1, 8, 2);

        assert_eq!(tracker.first_started(&range), None);
        tracker.mark_started([WorkId::new(8, 5)]).unwrap();
        assert_eq!(tracker.first_started(&range), Some(WorkId::new(8, 5)));
        assert!(tracker.is_started(&WorkId::new(8, 5)));

        tracker.mark_completed([WorkId::new(8, 1), WorkId::new(8, 7)]).unwrap();
        assert_eq!(tracker.first_incomplete(&range), Some(WorkId::new(8, 3)));
        tracker.mark_completed([WorkId::new(8, 3), WorkId::new(8, 5)]).unwrap();
        assert_eq!(tracker.first_incomplete(&range), None);
        assert!(tracker.is_completed(&WorkId::new(8, 7)));
    }
}
