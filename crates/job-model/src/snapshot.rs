//! Persisted form of the queue.
//!
//! The snapshot is a JSON document that round-trips through this module;
//! callers treat it as opaque.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};
use crate::queue::JobQueue;

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Errors when reading or writing snapshots.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(String),
}

/// Serializable queue state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: String,
    pub saved_at: String,
    pub jobs: Vec<Job>,
}

impl QueueSnapshot {
    pub fn capture(queue: &JobQueue) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            saved_at: chrono::Utc::now().to_rfc3339(),
            jobs: queue.jobs().to_vec(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Read a snapshot file.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let text = std::fs::read_to_string(path).map_err(|e| SnapshotError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let snapshot = Self::from_json(&text).map_err(|e| SnapshotError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        if snapshot.version.split('.').next() != SNAPSHOT_VERSION.split('.').next() {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot)
    }

    /// Write the snapshot file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SnapshotError::IoError {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let json = self.to_json().map_err(|e| SnapshotError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        std::fs::write(path, json).map_err(|e| SnapshotError::IoError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

impl JobQueue {
    /// Append the jobs of a snapshot to this queue.
    ///
    /// Jobs whose identity is already queued are skipped. Jobs that were
    /// active when the snapshot was written come back as `Pending`.
    /// Returns the identities that were added.
    pub fn import(&mut self, snapshot: QueueSnapshot) -> Vec<JobId> {
        let mut seen: HashSet<JobId> = self.iter().map(|j| j.id).collect();
        let mut added = Vec::new();
        for mut job in snapshot.jobs {
            if !seen.insert(job.id) {
                tracing::debug!(job = %job.id, "Skipping duplicate job from snapshot");
                continue;
            }
            job.reset_interrupted();
            added.push(job.id);
            self.push_unchecked(job);
        }
        added
    }

    /// Build a queue from a snapshot.
    pub fn restore(snapshot: QueueSnapshot) -> Self {
        let mut queue = Self::new();
        queue.import(snapshot);
        queue
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot::capture(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, PublishMeta};

    #[test]
    fn test_restore_preserves_order_and_fields() {
        let mut queue = JobQueue::new();
        let ids = queue.add_files(["a.mjpg", "b.mjpg"]);
        queue
            .edit_metadata(ids[1], "Second half", "League")
            .unwrap();
        queue.set_status(ids[0], JobStatus::Running).unwrap();
        queue.set_status(ids[0], JobStatus::Done).unwrap();

        let json = queue.snapshot().to_json().unwrap();
        let restored = JobQueue::restore(QueueSnapshot::from_json(&json).unwrap());

        let restored_ids: Vec<_> = restored.iter().map(|j| j.id).collect();
        assert_eq!(restored_ids, ids);
        assert_eq!(restored.get(ids[0]).unwrap().status(), JobStatus::Done);
        assert_eq!(
            restored.get(ids[1]).unwrap().meta,
            PublishMeta::new("Second half", "League")
        );
    }

    #[test]
    fn test_active_job_restored_as_pending() {
        let mut queue = JobQueue::new();
        let ids = queue.add_files(["a.mjpg"]);
        queue.set_status(ids[0], JobStatus::Running).unwrap();
        queue.set_progress(ids[0], 0.4).unwrap();

        let restored = JobQueue::restore(queue.snapshot());
        let job = restored.get(ids[0]).unwrap();
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.progress(), 0.0);
        assert!(restored.active().is_none());
    }

    #[test]
    fn test_import_appends_and_skips_duplicates() {
        let mut queue = JobQueue::new();
        let ids = queue.add_files(["a.mjpg"]);
        let snapshot = queue.snapshot();

        let mut other = JobQueue::new();
        other.add_files(["z.mjpg"]);
        let added = other.import(snapshot.clone());
        assert_eq!(added, ids);
        assert!(other.import(snapshot).is_empty());
        assert_eq!(other.len(), 2);
        assert_eq!(other.jobs()[1].id, ids[0]);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = std::env::temp_dir().join(format!("camreel_snapshot_{}", JobId::new()));
        let path = dir.join("queue.json");

        let mut queue = JobQueue::new();
        queue.add_files(["a.mjpg", "b.mjpg"]);
        queue.snapshot().save(&path).unwrap();

        let loaded = QueueSnapshot::load(&path).unwrap();
        assert_eq!(loaded.jobs.len(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_rejects_foreign_major_version() {
        let dir = std::env::temp_dir().join(format!("camreel_snapshot_v_{}", JobId::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("queue.json");
        std::fs::write(
            &path,
            r#"{"version":"2.0","saved_at":"2026-01-01T00:00:00Z","jobs":[]}"#,
        )
        .unwrap();

        assert!(matches!(
            QueueSnapshot::load(&path),
            Err(SnapshotError::UnsupportedVersion(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
