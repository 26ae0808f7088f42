//! Jobs and the status state machine.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum title length accepted by the publish target.
pub const MAX_TITLE_CHARS: usize = 100;

/// Unique job identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell jobs apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Fetch all complete recordings from one camera, then fan out.
    Download,
    /// Transcode one raw recording.
    Convert,
}

/// Where a job's input comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobSource {
    /// A camera and the recording directory on it.
    Camera { device: String, remote_path: String },
    /// A raw recording on local disk.
    Local { path: PathBuf },
}

impl JobSource {
    /// Short human label for lists and logs.
    pub fn label(&self) -> String {
        match self {
            JobSource::Camera {
                device,
                remote_path,
            } => format!("{device}:{remote_path}"),
            JobSource::Local { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }
}

/// Job status. `Done`, `Skipped` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting; eligible to run.
    Pending,
    /// Fetch in progress (download jobs only).
    Downloading,
    /// Fetch finished. For a convert job spawned by a download this means
    /// "source is local and ready", and the job is eligible to run.
    Downloaded,
    /// Transcode in progress (convert jobs only).
    Running,
    Done,
    /// Output already existed and overwrite was disabled.
    Skipped,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Skipped | JobStatus::Error)
    }

    /// Statuses that hold the single pipeline slot.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Downloading | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Downloaded => "downloaded",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Skipped => "skipped",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} job cannot move from {from} to {to}")]
pub struct TransitionError {
    pub kind: JobKind,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Whether a `kind` job may move from `from` to `to`.
pub fn transition_allowed(kind: JobKind, from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    if from.is_terminal() || from == to {
        return false;
    }
    match (from, to) {
        // Failure and user cancellation are reachable from any live state.
        (_, Error) | (_, Pending) => true,
        (Pending, Downloading) => kind == JobKind::Download,
        (Downloading, Downloaded) => kind == JobKind::Download,
        // A download job completes once its children exist.
        (Downloaded, Done) => kind == JobKind::Download,
        (Pending, Running) | (Downloaded, Running) => kind == JobKind::Convert,
        (Running, Done) | (Running, Skipped) => kind == JobKind::Convert,
        _ => false,
    }
}

/// Metadata handed to the publish collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMeta {
    /// Video title (at most [`MAX_TITLE_CHARS`] characters).
    #[serde(default)]
    pub title: String,
    /// Playlist name; empty means no playlist.
    #[serde(default)]
    pub playlist: String,
}

impl PublishMeta {
    pub fn new(title: impl Into<String>, playlist: impl Into<String>) -> Self {
        let mut meta = Self {
            title: String::new(),
            playlist: playlist.into().trim().to_string(),
        };
        meta.set_title(title);
        meta
    }

    /// Set the title, truncated to [`MAX_TITLE_CHARS`] characters.
    pub fn set_title(&mut self, title: impl Into<String>) {
        let title = title.into();
        self.title = title.trim().chars().take(MAX_TITLE_CHARS).collect();
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub source: JobSource,

    /// Output directory; `None` means next to the source.
    #[serde(default)]
    pub destination: Option<PathBuf>,

    /// Output file, once derived.
    #[serde(default)]
    pub output_path: Option<PathBuf>,

    status: JobStatus,

    /// Progress of the current stage, `[0, 1]`.
    #[serde(default)]
    progress: f64,

    /// Failure cause, set with `Error`.
    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub meta: PublishMeta,

    /// Convert jobs spawned by this download job.
    #[serde(default)]
    pub children: Vec<JobId>,

    /// Remote id returned by the publish collaborator.
    #[serde(default)]
    pub remote_id: Option<String>,

    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

impl Job {
    fn new(kind: JobKind, source: JobSource) -> Self {
        Self {
            id: JobId::new(),
            kind,
            source,
            destination: None,
            output_path: None,
            status: JobStatus::Pending,
            progress: 0.0,
            error: None,
            meta: PublishMeta::default(),
            children: Vec::new(),
            remote_id: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// A convert job for a local raw recording.
    pub fn convert(path: impl Into<PathBuf>) -> Self {
        Self::new(JobKind::Convert, JobSource::Local { path: path.into() })
    }

    /// A download job for one camera; fetched files land in `destination`.
    pub fn download(
        device: impl Into<String>,
        remote_path: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        let mut job = Self::new(
            JobKind::Download,
            JobSource::Camera {
                device: device.into(),
                remote_path: remote_path.into(),
            },
        );
        job.destination = Some(destination.into());
        job
    }

    pub fn with_meta(mut self, meta: PublishMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Local source path for convert jobs.
    pub fn local_path(&self) -> Option<&Path> {
        match &self.source {
            JobSource::Local { path } => Some(path),
            JobSource::Camera { .. } => None,
        }
    }

    /// Camera name for download jobs.
    pub fn device_name(&self) -> Option<&str> {
        match &self.source {
            JobSource::Camera { device, .. } => Some(device),
            JobSource::Local { .. } => None,
        }
    }

    /// Move to `to`, validating against the state machine.
    ///
    /// Entering an active status resets progress; `Pending` clears the error.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !transition_allowed(self.kind, self.status, to) {
            return Err(TransitionError {
                kind: self.kind,
                from: self.status,
                to,
            });
        }
        tracing::debug!(job = %self.id, from = %self.status, to = %to, "Job status change");
        self.status = to;
        match to {
            JobStatus::Pending | JobStatus::Downloading | JobStatus::Running => {
                self.progress = 0.0;
                if to == JobStatus::Pending {
                    self.error = None;
                }
            }
            JobStatus::Done | JobStatus::Downloaded => self.progress = 1.0,
            _ => {}
        }
        Ok(())
    }

    /// Mark the job failed with a cause.
    pub fn fail(&mut self, cause: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Error)?;
        self.error = Some(cause.into());
        Ok(())
    }

    /// Explicit user action: make a finished or failed job runnable again.
    ///
    /// This is not an automatic transition; terminal states are otherwise
    /// final. Returns false if the job is live.
    pub fn reset_for_retry(&mut self) -> bool {
        if !self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Pending;
        self.progress = 0.0;
        self.error = None;
        true
    }

    /// Record progress. Values are clamped and never decrease within a run.
    pub fn set_progress(&mut self, fraction: f64) {
        if fraction.is_finite() {
            self.progress = self.progress.max(fraction.clamp(0.0, 1.0));
        }
    }

    /// Derive the output path for an output extension.
    pub fn derive_output_path(&self, extension: &str) -> Option<PathBuf> {
        let path = self.local_path()?;
        let stem = path.file_stem()?;
        let dir = match &self.destination {
            Some(dir) => dir.clone(),
            None => path.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        let mut file = stem.to_os_string();
        file.push(".");
        file.push(extension);
        Some(dir.join(file))
    }

    /// Spawn a convert job for a fetched file.
    ///
    /// The child starts in `Downloaded` and gets its own copy of the
    /// publish metadata; later edits to the parent do not reach it.
    pub fn spawn_child(&mut self, fetched: impl Into<PathBuf>) -> Job {
        let mut child = Job::convert(fetched);
        child.status = JobStatus::Downloaded;
        child.meta = self.meta.clone();
        self.children.push(child.id);
        child
    }

    /// Reset an active status to `Pending`, used when restoring a snapshot
    /// written while a job was running.
    pub(crate) fn reset_interrupted(&mut self) {
        if self.status.is_active() {
            self.status = JobStatus::Pending;
            self.progress = 0.0;
        }
    }
}
