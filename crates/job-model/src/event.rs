//! Observation-only progress events.
//!
//! Events are copies of job state at emission time. Nothing received through
//! this surface can change a job.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId, JobStatus};
use crate::queue::StatusCounts;

/// One job's state change or progress tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Stage progress `[0, 1]`.
    pub progress: f64,
    /// Human-readable detail (error cause, skip reason, stage name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Remaining seconds of the current stage, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
}

impl JobEvent {
    pub fn of(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status(),
            progress: job.progress(),
            message: job.error.clone(),
            eta_secs: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_eta(mut self, eta_secs: Option<f64>) -> Self {
        self.eta_secs = eta_secs;
        self
    }
}

/// Aggregate state of the current batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Jobs in a terminal status.
    pub completed: usize,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    /// Encoder used by the running transcode, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_encoder: Option<String>,
}

impl BatchSummary {
    pub fn from_counts(counts: &StatusCounts) -> Self {
        Self {
            completed: counts.finished(),
            total: counts.total(),
            eta_secs: None,
            active_encoder: None,
        }
    }
}

/// Everything the orchestrator reports outward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Job(JobEvent),
    Batch(BatchSummary),
    /// Non-fatal information worth surfacing, such as an encoder fallback.
    Notice { job_id: Option<JobId>, message: String },
    /// A merge group was concatenated.
    Merged { output: PathBuf, parts: usize },
    /// Merge group failed; the parts themselves are unaffected.
    MergeFailed { output: PathBuf, message: String },
    /// The queue has no eligible work left.
    Idle(BatchSummary),
}

impl PipelineEvent {
    /// Job this event concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            PipelineEvent::Job(e) => Some(e.job_id),
            PipelineEvent::Notice { job_id, .. } => *job_id,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobQueue;

    #[test]
    fn test_job_event_copies_state() {
        let mut queue = JobQueue::new();
        let ids = queue.add_files(["a.mjpg"]);
        queue.fail(ids[0], "exit code 1").unwrap();
        let event = JobEvent::of(queue.get(ids[0]).unwrap());
        assert_eq!(event.status, JobStatus::Error);
        assert_eq!(event.message.as_deref(), Some("exit code 1"));
    }

    #[test]
    fn test_summary_counts_terminal_jobs() {
        let mut queue = JobQueue::new();
        let ids = queue.add_files(["a.mjpg", "b.mjpg", "c.mjpg"]);
        queue.set_status(ids[0], JobStatus::Running).unwrap();
        queue.set_status(ids[0], JobStatus::Skipped).unwrap();
        queue.fail(ids[1], "x").unwrap();
        let summary = BatchSummary::from_counts(&queue.counts());
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.total, 3);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = PipelineEvent::Notice {
            job_id: None,
            message: "falling back to libx264".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"notice""#));
    }
}
