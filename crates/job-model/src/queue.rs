//! The ordered job queue.
//!
//! Insertion order is preserved and identities are unique. The queue also
//! guards the single-flight rule: at most one job may be `Downloading` or
//! `Running` at any time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::job::{Job, JobId, JobKind, JobStatus, PublishMeta, TransitionError};

/// Raw recording extensions picked up by folder scans.
pub const RAW_EXTENSIONS: [&str; 2] = ["mjpg", "mjpeg"];

/// Errors raised by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {0} is already queued")]
    Duplicate(JobId),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {requested} cannot become active while job {active} is active")]
    SingleFlight { requested: JobId, active: JobId },

    #[error("Job {0} is active and cannot be modified from outside the worker")]
    JobActive(JobId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub downloading: usize,
    pub downloaded: usize,
    pub running: usize,
    pub done: usize,
    pub skipped: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending
            + self.downloading
            + self.downloaded
            + self.running
            + self.done
            + self.skipped
            + self.error
    }

    pub fn finished(&self) -> usize {
        self.done + self.skipped + self.error
    }
}

/// Ordered sequence of jobs.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    jobs: Vec<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.get(id).is_some()
    }

    /// The job currently holding the pipeline slot, if any.
    pub fn active(&self) -> Option<&Job> {
        self.jobs.iter().find(|j| j.status().is_active())
    }

    /// Append a job. Duplicate identities are rejected.
    pub fn enqueue(&mut self, job: Job) -> Result<JobId, QueueError> {
        if self.contains(job.id) {
            return Err(QueueError::Duplicate(job.id));
        }
        let id = job.id;
        tracing::debug!(job = %id, kind = ?job.kind, source = %job.source.label(), "Job enqueued");
        self.jobs.push(job);
        Ok(id)
    }

    /// Remove jobs by identity. Active jobs are kept; the removed jobs are
    /// returned in queue order.
    pub fn remove(&mut self, ids: &[JobId]) -> Vec<Job> {
        let wanted: HashSet<JobId> = ids.iter().copied().collect();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.jobs.len());
        for job in self.jobs.drain(..) {
            if wanted.contains(&job.id) && !job.status().is_active() {
                removed.push(job);
            } else {
                if wanted.contains(&job.id) {
                    tracing::warn!(job = %job.id, "Refusing to remove active job");
                }
                kept.push(job);
            }
        }
        self.jobs = kept;
        removed
    }

    /// Remove every job except an active one. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.status().is_active());
        before - self.jobs.len()
    }

    /// Earliest-inserted job that may run next: `Pending`, or a `Downloaded`
    /// convert job spawned by a finished fetch.
    pub fn next_eligible(&self) -> Option<&Job> {
        self.jobs.iter().find(|j| is_eligible(j))
    }

    /// Apply a status change, enforcing the single-flight rule.
    pub fn set_status(&mut self, id: JobId, to: JobStatus) -> Result<(), QueueError> {
        if to.is_active() {
            if let Some(active) = self.active() {
                if active.id != id {
                    return Err(QueueError::SingleFlight {
                        requested: id,
                        active: active.id,
                    });
                }
            }
        }
        let job = self.get_mut(id).ok_or(QueueError::NotFound(id))?;
        job.transition(to)?;
        Ok(())
    }

    /// Mark a job failed with a cause.
    pub fn fail(&mut self, id: JobId, cause: impl Into<String>) -> Result<(), QueueError> {
        let job = self.get_mut(id).ok_or(QueueError::NotFound(id))?;
        job.fail(cause)?;
        Ok(())
    }

    /// Record stage progress for a job.
    pub fn set_progress(&mut self, id: JobId, fraction: f64) -> Result<(), QueueError> {
        let job = self.get_mut(id).ok_or(QueueError::NotFound(id))?;
        job.set_progress(fraction);
        Ok(())
    }

    /// Explicit user action: reset finished or failed jobs to `Pending`.
    /// Returns the identities that were reset.
    pub fn retry(&mut self, ids: &[JobId]) -> Vec<JobId> {
        let wanted: HashSet<JobId> = ids.iter().copied().collect();
        self.jobs
            .iter_mut()
            .filter(|j| wanted.contains(&j.id))
            .filter_map(|j| j.reset_for_retry().then_some(j.id))
            .collect()
    }

    /// Edit publish metadata of a job that is not active.
    pub fn edit_metadata(
        &mut self,
        id: JobId,
        title: impl Into<String>,
        playlist: impl Into<String>,
    ) -> Result<(), QueueError> {
        let job = self.get_mut(id).ok_or(QueueError::NotFound(id))?;
        if job.status().is_active() {
            return Err(QueueError::JobActive(id));
        }
        job.meta = PublishMeta::new(title, playlist);
        Ok(())
    }

    /// Queue a convert job per file. Returns the new identities.
    pub fn add_files<I, P>(&mut self, paths: I) -> Vec<JobId>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        paths
            .into_iter()
            .filter_map(|p| self.enqueue(Job::convert(p)).ok())
            .collect()
    }

    /// Queue every raw recording directly inside `dir`, sorted by name.
    pub fn scan_folder(&mut self, dir: &Path) -> Result<Vec<JobId>, QueueError> {
        let files = list_raw_recordings(dir)?;
        Ok(self.add_files(files))
    }

    /// Queue one download job per camera, skipping cameras that already
    /// have a pending download job.
    pub fn add_download_jobs<'a, I>(
        &mut self,
        devices: I,
        remote_path: &str,
        destination: &Path,
        meta: &PublishMeta,
    ) -> Vec<JobId>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut pending: HashSet<String> = self
            .jobs
            .iter()
            .filter(|j| j.kind == JobKind::Download && j.status() == JobStatus::Pending)
            .filter_map(|j| j.device_name().map(str::to_string))
            .collect();

        let mut added = Vec::new();
        for device in devices {
            if !pending.insert(device.to_string()) {
                continue;
            }
            let job = Job::download(device, remote_path, destination.join(device))
                .with_meta(meta.clone());
            if let Ok(id) = self.enqueue(job) {
                added.push(id);
            }
        }
        added
    }

    /// Fan out: queue a convert child of `parent` per fetched file.
    ///
    /// Files that are already the source of a queued convert job are
    /// skipped. Children are inserted in the given order at the end of
    /// the queue.
    pub fn spawn_children(
        &mut self,
        parent: JobId,
        files: &[PathBuf],
    ) -> Result<Vec<JobId>, QueueError> {
        let queued: HashSet<PathBuf> = self
            .jobs
            .iter()
            .filter_map(|j| j.local_path().map(Path::to_path_buf))
            .collect();

        let parent_job = self.get_mut(parent).ok_or(QueueError::NotFound(parent))?;
        let children: Vec<Job> = files
            .iter()
            .filter(|f| !queued.contains(*f))
            .map(|f| parent_job.spawn_child(f.clone()))
            .collect();

        let ids = children.iter().map(|c| c.id).collect();
        self.jobs.extend(children);
        Ok(ids)
    }

    /// Counts per status.
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for job in &self.jobs {
            match job.status() {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Downloading => counts.downloading += 1,
                JobStatus::Downloaded => counts.downloaded += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Done => counts.done += 1,
                JobStatus::Skipped => counts.skipped += 1,
                JobStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    /// Crate-internal append used by snapshot import (no duplicate check
    /// needed, the caller filters).
    pub(crate) fn push_unchecked(&mut self, job: Job) {
        self.jobs.push(job);
    }
}

fn is_eligible(job: &Job) -> bool {
    match job.status() {
        JobStatus::Pending => true,
        JobStatus::Downloaded => job.kind == JobKind::Convert,
        _ => false,
    }
}

/// Raw recordings directly inside `dir`, sorted by file name.
pub fn list_raw_recordings(dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
    let entries = std::fs::read_dir(dir).map_err(|e| QueueError::IoError {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && has_raw_extension(p))
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// True for raw camera video files, compared case-insensitively.
pub fn has_raw_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| RAW_EXTENSIONS.iter().any(|r| r.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}
