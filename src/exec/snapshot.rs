// src/exec/snapshot.rs

//! On-disk snapshots of undispatched work, one JSON file per pool.
//!
//! A file's presence at startup means the previous run did not get to
//! process everything; its tasks are resubmitted and the file removed.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::SnapshotError;
use crate::task::Task;

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, pool: &str) -> PathBuf {
        self.dir.join(format!("{pool}.json"))
    }

    /// Write `tasks` for `pool`. Nothing is written for an empty list.
    ///
    /// The file is written next to its final name and renamed into place so
    /// a crash mid-write never leaves a truncated snapshot behind.
    pub fn save(&self, pool: &str, tasks: &[Task]) -> Result<Option<PathBuf>, SnapshotError> {
        if tasks.is_empty() {
            return Ok(None);
        }
        let path = self.path_for(pool);
        let io_err = |source: std::io::Error| SnapshotError::Io {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let body = serde_json::to_vec_pretty(tasks).map_err(|source| SnapshotError::Encode {
            path: path.display().to_string(),
            source,
        })?;

        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&body).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;

        info!(pool, count = tasks.len(), path = %path.display(), "dumped pending tasks to disk");
        Ok(Some(path))
    }

    /// Read and remove the snapshot for `pool`; empty when there is none.
    ///
    /// The file is removed even when it cannot be decoded, so a corrupt
    /// snapshot is reported once instead of on every start.
    pub fn take(&self, pool: &str) -> Result<Vec<Task>, SnapshotError> {
        let path = self.path_for(pool);
        let display = path.display().to_string();

        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(pool, "no snapshot to restore");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: display,
                    source,
                });
            }
        };

        let decoded = serde_json::from_slice::<Vec<Task>>(&body);
        fs::remove_file(&path).map_err(|source| SnapshotError::Io {
            path: display.clone(),
            source,
        })?;

        let tasks = decoded.map_err(|source| SnapshotError::Decode {
            path: display,
            source,
        })?;
        info!(pool, count = tasks.len(), "restoring tasks from disk");
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Action, Origin, Params};

    #[test]
    fn save_take_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("te"));

        assert!(store.save("query_task_pool", &[]).unwrap().is_none());
        assert!(store.take("query_task_pool").unwrap().is_empty());

        let task = Task::new(
            Some("2024-01-01T00:00:00.unix-account.quota_report".into()),
            Origin::Scheduler,
            "LOCAL-SCHED",
            "unix-account.quota_report",
            "unix-account",
            Action::QuotaReport,
            Params::new(),
        );
        let path = store.save("query_task_pool", std::slice::from_ref(&task)).unwrap().unwrap();
        assert!(path.exists());

        let restored = store.take("query_task_pool").unwrap();
        assert_eq!(restored, vec![task]);
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_snapshot_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        fs::write(store.path_for("command_task_pool"), b"not json").unwrap();

        let err = store.take("command_task_pool").unwrap_err();
        assert!(matches!(err, SnapshotError::Decode { .. }));
        assert!(!store.path_for("command_task_pool").exists());
    }
}
