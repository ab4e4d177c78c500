use super::{RunState, Step};
use crate::error::IndexError;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Bounded, per-`(context, step)` log of run snapshots.
///
/// Past `capacity` entries the oldest snapshot of that key is evicted.
#[derive(Debug)]
pub struct RunHistory {
    capacity: usize,
    entries: BTreeMap<(String, Step), VecDeque<RunState>>,
    path: Option<PathBuf>,
}

impl RunHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: BTreeMap::new(),
            path: None,
        }
    }

    /// History persisted to `path`, reloading what a previous process saved.
    /// An unreadable file is logged and ignored.
    pub fn with_path(capacity: usize, path: impl Into<PathBuf>) -> Self {
        let mut history = Self::new(capacity);
        let path = path.into();
        if path.exists() {
            match Self::read_snapshots(&path) {
                Ok(snapshots) => {
                    info!("Loaded {} history snapshots from {}", snapshots.len(), path.display());
                    for state in snapshots {
                        history.append(state);
                    }
                }
                Err(e) => warn!("Ignoring history file {}: {e}", path.display()),
            }
        }
        history.path = Some(path);
        history
    }

    fn read_snapshots(path: &Path) -> Result<Vec<RunState>, IndexError> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| IndexError::Io(std::io::Error::other(e)))
    }

    pub fn append(&mut self, state: RunState) {
        let ring = self
            .entries
            .entry((state.context.clone(), state.step))
            .or_default();
        ring.push_back(state);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    /// The last `limit` snapshots of a key, oldest first.
    pub fn recent(&self, context: &str, step: Step, limit: usize) -> Vec<RunState> {
        let Some(ring) = self.entries.get(&(context.to_string(), step)) else {
            return Vec::new();
        };
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self, context: &str, step: Step) -> usize {
        self.entries
            .get(&(context.to_string(), step))
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(VecDeque::is_empty)
    }

    /// Writes every snapshot to the configured file; a no-op without one.
    pub fn save(&self) -> Result<(), IndexError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let all: Vec<&RunState> = self.entries.values().flatten().collect();
        let data = serde_json::to_string(&all).map_err(|e| IndexError::Io(std::io::Error::other(e)))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RunStatus;

    fn snapshot(context: &str, step: Step, processed: usize) -> RunState {
        let mut state = RunState::new(context, step);
        state.status = RunStatus::Running;
        state.items_processed = processed;
        state
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = RunHistory::new(3);
        for i in 0..5 {
            history.append(snapshot("ctx", Step::Extract, i));
        }
        history.append(snapshot("ctx", Step::FixLinks, 9));

        assert_eq!(history.len("ctx", Step::Extract), 3);
        let processed: Vec<usize> = history
            .recent("ctx", Step::Extract, 10)
            .iter()
            .map(|s| s.items_processed)
            .collect();
        assert_eq!(processed, vec![2, 3, 4]);
        assert_eq!(history.recent("ctx", Step::Extract, 1)[0].items_processed, 4);
        assert_eq!(history.len("ctx", Step::FixLinks), 1);
        assert!(history.recent("other", Step::Extract, 10).is_empty());
    }

    #[test]
    fn test_persisted_history_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("history.json");

        let mut history = RunHistory::with_path(10, &path);
        assert!(history.is_empty());
        history.append(snapshot("ctx", Step::Extract, 1));
        history.append(snapshot("ctx", Step::FixLinks, 2));
        history.save().unwrap();

        let reloaded = RunHistory::with_path(10, &path);
        assert_eq!(reloaded.len("ctx", Step::Extract), 1);
        assert_eq!(reloaded.recent("ctx", Step::FixLinks, 5)[0].items_processed, 2);
    }

    #[test]
    fn test_corrupt_history_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        fs::write(&path, "not json").unwrap();
        let history = RunHistory::with_path(10, &path);
        assert!(history.is_empty());
    }
}
