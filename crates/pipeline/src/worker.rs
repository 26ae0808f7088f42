//! The worker orchestrator.
//!
//! One task owns the [`JobQueue`]. Everything else talks to it through an
//! [`OrchestratorHandle`]: commands go in over an mpsc channel with a
//! oneshot reply, and state changes come out as [`PipelineEvent`]s on a
//! broadcast channel. Stage bodies run on the blocking pool and report back
//! through an unbounded channel that only this task reads, so the queue is
//! never shared and at most one job is active at a time.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use camreel_common::{linear_eta, CancelFlag, ProgressClock, ResolvedConfig};
use camreel_job_model::{
    BatchSummary, Job, JobEvent, JobId, JobKind, JobQueue, JobStatus, PipelineEvent, PublishMeta,
    QueueError, QueueSnapshot,
};
use camreel_processing_core::MergeCandidate;
use camreel_transcode::{CapabilityCache, CapabilityProber, MergeOutcome};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};

use crate::fetch::Fetcher;
use crate::publish::Publisher;
use crate::stages::{
    run_convert, run_download, run_merge, ConvertOutcome, DownloadOutcome, StageContext,
    StageUpdate,
};

/// Capacity of the event broadcast; slow observers see `Lagged`.
pub const EVENT_CAPACITY: usize = 256;

const COMMAND_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Orchestrator has stopped")]
    Stopped,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<PipelineError> for camreel_common::CamreelError {
    fn from(err: PipelineError) -> Self {
        camreel_common::CamreelError::queue(err.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Requests handled by the orchestrator task.
#[derive(Debug)]
enum Command {
    AddFiles {
        paths: Vec<PathBuf>,
        reply: oneshot::Sender<Vec<JobId>>,
    },
    ScanFolder {
        dir: PathBuf,
        reply: oneshot::Sender<Result<Vec<JobId>, QueueError>>,
    },
    AddDownloads {
        devices: Vec<String>,
        remote_path: String,
        destination: PathBuf,
        meta: PublishMeta,
        reply: oneshot::Sender<Vec<JobId>>,
    },
    Enqueue {
        job: Box<Job>,
        reply: oneshot::Sender<Result<JobId, QueueError>>,
    },
    Remove {
        ids: Vec<JobId>,
        reply: oneshot::Sender<Vec<JobId>>,
    },
    Clear {
        reply: oneshot::Sender<usize>,
    },
    Retry {
        ids: Vec<JobId>,
        reply: oneshot::Sender<Vec<JobId>>,
    },
    EditMetadata {
        id: JobId,
        title: String,
        playlist: String,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Import {
        snapshot: QueueSnapshot,
        reply: oneshot::Sender<Vec<JobId>>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    Jobs {
        reply: oneshot::Sender<Vec<Job>>,
    },
    Start {
        reply: oneshot::Sender<bool>,
    },
    CancelCurrent {
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<QueueSnapshot>,
    },
}

/// Cloneable front door to a running orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<PipelineEvent>,
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> PipelineResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| PipelineError::Stopped)?;
        rx.await.map_err(|_| PipelineError::Stopped)
    }

    /// Observe job and batch events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub async fn add_files(&self, paths: Vec<PathBuf>) -> PipelineResult<Vec<JobId>> {
        self.request(|reply| Command::AddFiles { paths, reply }).await
    }

    pub async fn scan_folder(&self, dir: PathBuf) -> PipelineResult<Vec<JobId>> {
        Ok(self
            .request(|reply| Command::ScanFolder { dir, reply })
            .await??)
    }

    /// Queue a download job per camera.
    pub async fn add_downloads(
        &self,
        devices: Vec<String>,
        remote_path: String,
        destination: PathBuf,
        meta: PublishMeta,
    ) -> PipelineResult<Vec<JobId>> {
        self.request(|reply| Command::AddDownloads {
            devices,
            remote_path,
            destination,
            meta,
            reply,
        })
        .await
    }

    pub async fn enqueue(&self, job: Job) -> PipelineResult<JobId> {
        Ok(self
            .request(|reply| Command::Enqueue {
                job: Box::new(job),
                reply,
            })
            .await??)
    }

    /// Remove jobs; active jobs are kept. Returns the removed identities.
    pub async fn remove(&self, ids: Vec<JobId>) -> PipelineResult<Vec<JobId>> {
        self.request(|reply| Command::Remove { ids, reply }).await
    }

    pub async fn clear(&self) -> PipelineResult<usize> {
        self.request(|reply| Command::Clear { reply }).await
    }

    pub async fn retry(&self, ids: Vec<JobId>) -> PipelineResult<Vec<JobId>> {
        self.request(|reply| Command::Retry { ids, reply }).await
    }

    pub async fn edit_metadata(
        &self,
        id: JobId,
        title: String,
        playlist: String,
    ) -> PipelineResult<()> {
        Ok(self
            .request(|reply| Command::EditMetadata {
                id,
                title,
                playlist,
                reply,
            })
            .await??)
    }

    /// Append a snapshot's jobs to the queue.
    pub async fn import(&self, snapshot: QueueSnapshot) -> PipelineResult<Vec<JobId>> {
        self.request(|reply| Command::Import { snapshot, reply })
            .await
    }

    pub async fn snapshot(&self) -> PipelineResult<QueueSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Copies of every job in queue order.
    pub async fn jobs(&self) -> PipelineResult<Vec<Job>> {
        self.request(|reply| Command::Jobs { reply }).await
    }

    /// Begin processing eligible jobs. Returns false if already processing.
    pub async fn start(&self) -> PipelineResult<bool> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Cancel the running stage and stop processing. The cancelled job
    /// returns to `Pending`. Returns false if nothing was running.
    pub async fn cancel_current(&self) -> PipelineResult<bool> {
        self.request(|reply| Command::CancelCurrent { reply }).await
    }

    /// Cancel any running stage, wait for it, and stop the orchestrator.
    /// Returns the final queue.
    pub async fn shutdown(&self) -> PipelineResult<QueueSnapshot> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Builder for an orchestrator.
pub struct OrchestratorBuilder {
    config: ResolvedConfig,
    queue: JobQueue,
    capabilities: Option<Arc<CapabilityCache>>,
    fetcher: Arc<dyn Fetcher>,
    publisher: Option<Arc<dyn Publisher>>,
}

impl OrchestratorBuilder {
    pub fn new(config: ResolvedConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            queue: JobQueue::new(),
            capabilities: None,
            fetcher,
            publisher: None,
        }
    }

    pub fn with_queue(mut self, queue: JobQueue) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_capabilities(mut self, cache: Arc<CapabilityCache>) -> Self {
        self.capabilities = Some(cache);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Spawn the orchestrator task on the current runtime.
    pub fn spawn(self) -> (OrchestratorHandle, JoinHandle<()>) {
        let capabilities = self.capabilities.unwrap_or_else(|| {
            Arc::new(CapabilityCache::new(CapabilityProber::new(
                self.config.tools.clone(),
            )))
        });
        let ctx = StageContext {
            config: self.config,
            capabilities,
            fetcher: self.fetcher,
            publisher: self.publisher,
        };
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        let orchestrator = Orchestrator {
            queue: self.queue,
            ctx,
            events: event_tx.clone(),
            commands: command_rx,
            updates_tx: update_tx,
            updates_rx: update_rx,
            active: None,
            batch: BatchState::Idle,
            active_encoder: None,
        };
        let task = tokio::spawn(orchestrator.run());
        (
            OrchestratorHandle {
                commands: command_tx,
                events: event_tx,
            },
            task,
        )
    }
}

/// What a finished stage produced.
#[derive(Debug)]
enum StageResult {
    Convert(ConvertOutcome),
    Download(DownloadOutcome),
    Merge(Vec<MergeOutcome>),
}

/// The stage currently on the blocking pool.
struct ActiveStage {
    /// `None` for the merge pass, which belongs to no job.
    job_id: Option<JobId>,
    cancel: CancelFlag,
    handle: JoinHandle<StageResult>,
}

#[derive(Debug)]
enum BatchState {
    Idle,
    /// Working through eligible jobs.
    Running {
        clock: ProgressClock,
        /// Convert jobs finished `Done` in this batch, in completion order.
        done: Vec<JobId>,
        /// Jobs finished in this batch, for the batch ETA.
        finished: usize,
    },
    Merging,
}

struct Orchestrator {
    queue: JobQueue,
    ctx: StageContext,
    events: broadcast::Sender<PipelineEvent>,
    commands: mpsc::Receiver<Command>,
    updates_tx: mpsc::UnboundedSender<StageUpdate>,
    updates_rx: mpsc::UnboundedReceiver<StageUpdate>,
    active: Option<ActiveStage>,
    batch: BatchState,
    active_encoder: Option<String>,
}

/// Resolves when the active stage finishes; pending forever without one.
async fn wait_active(
    active: &mut Option<ActiveStage>,
) -> Result<StageResult, JoinError> {
    match active {
        Some(stage) => (&mut stage.handle).await,
        None => std::future::pending().await,
    }
}

impl Orchestrator {
    async fn run(mut self) {
        tracing::info!(jobs = self.queue.len(), "Orchestrator started");
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.stop_active().await;
                        break;
                    };
                    if let ControlFlow::Break(reply) = self.handle_command(command) {
                        self.stop_active().await;
                        let _ = reply.send(self.queue.snapshot());
                        break;
                    }
                }
                Some(update) = self.updates_rx.recv() => self.apply_update(update),
                result = wait_active(&mut self.active) => self.finish_stage(result),
            }
            if self.active.is_none() {
                self.advance();
            }
        }
        tracing::info!("Orchestrator stopped");
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_job(&self, id: JobId, message: Option<String>) {
        if let Some(job) = self.queue.get(id) {
            let mut event = JobEvent::of(job);
            if let Some(message) = message {
                event = event.with_message(message);
            }
            self.emit(PipelineEvent::Job(event));
        }
    }

    fn summary(&self) -> BatchSummary {
        let counts = self.queue.counts();
        let mut summary = BatchSummary::from_counts(&counts);
        summary.active_encoder = self.active_encoder.clone();
        if let BatchState::Running {
            clock, finished, ..
        } = &self.batch
        {
            let active = self.queue.active();
            let remaining = counts.pending + counts.downloaded + usize::from(active.is_some());
            let planned = finished + remaining;
            if planned > 0 {
                let partial = active.map(Job::progress).unwrap_or(0.0);
                let fraction = (*finished as f64 + partial) / planned as f64;
                summary.eta_secs = linear_eta(clock.elapsed_secs(), fraction);
            }
        }
        summary
    }

    fn emit_batch(&self) {
        self.emit(PipelineEvent::Batch(self.summary()));
    }

    /// Apply one command. `Break` carries the reply of a shutdown request.
    fn handle_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<QueueSnapshot>> {
        match command {
            Command::AddFiles { paths, reply } => {
                let ids = self.queue.add_files(paths);
                self.announce(&ids);
                let _ = reply.send(ids);
            }
            Command::ScanFolder { dir, reply } => {
                let result = self.queue.scan_folder(&dir);
                if let Ok(ids) = &result {
                    tracing::info!(dir = %dir.display(), added = ids.len(), "Folder scanned");
                    self.announce(ids);
                }
                let _ = reply.send(result);
            }
            Command::AddDownloads {
                devices,
                remote_path,
                destination,
                meta,
                reply,
            } => {
                let ids = self.queue.add_download_jobs(
                    devices.iter().map(String::as_str),
                    &remote_path,
                    &destination,
                    &meta,
                );
                self.announce(&ids);
                let _ = reply.send(ids);
            }
            Command::Enqueue { job, reply } => {
                let result = self.queue.enqueue(*job);
                if let Ok(id) = &result {
                    self.announce(&[*id]);
                }
                let _ = reply.send(result);
            }
            Command::Remove { ids, reply } => {
                let removed: Vec<JobId> = self.queue.remove(&ids).into_iter().map(|j| j.id).collect();
                if !removed.is_empty() {
                    self.emit_batch();
                }
                let _ = reply.send(removed);
            }
            Command::Clear { reply } => {
                let removed = self.queue.clear();
                self.emit_batch();
                let _ = reply.send(removed);
            }
            Command::Retry { ids, reply } => {
                let reset = self.queue.retry(&ids);
                self.announce(&reset);
                let _ = reply.send(reset);
            }
            Command::EditMetadata {
                id,
                title,
                playlist,
                reply,
            } => {
                let _ = reply.send(self.queue.edit_metadata(id, title, playlist));
            }
            Command::Import { snapshot, reply } => {
                let ids = self.queue.import(snapshot);
                self.announce(&ids);
                let _ = reply.send(ids);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.queue.snapshot());
            }
            Command::Jobs { reply } => {
                let _ = reply.send(self.queue.jobs().to_vec());
            }
            Command::Start { reply } => {
                let started = matches!(self.batch, BatchState::Idle);
                if started {
                    tracing::info!(eligible = self.queue.counts().pending, "Processing started");
                    self.batch = BatchState::Running {
                        clock: ProgressClock::start(),
                        done: Vec::new(),
                        finished: 0,
                    };
                }
                let _ = reply.send(started);
            }
            Command::CancelCurrent { reply } => {
                let cancelled = match &self.active {
                    Some(stage) => {
                        tracing::info!(job = ?stage.job_id, "Cancelling current stage");
                        stage.cancel.cancel();
                        true
                    }
                    None => false,
                };
                // Stop after the cancelled stage; the user starts again.
                if !matches!(self.batch, BatchState::Idle) {
                    self.batch = BatchState::Idle;
                    if self.active.is_none() {
                        self.emit(PipelineEvent::Idle(self.summary()));
                    }
                }
                let _ = reply.send(cancelled);
            }
            Command::Shutdown { reply } => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    /// Event for each newly queued or reset job, then the batch totals.
    fn announce(&self, ids: &[JobId]) {
        for id in ids {
            self.emit_job(*id, None);
        }
        if !ids.is_empty() {
            self.emit_batch();
        }
    }

    fn apply_update(&mut self, update: StageUpdate) {
        match update {
            StageUpdate::Progress {
                job_id,
                fraction,
                eta_secs,
            } => {
                // Progress only counts while the job holds the slot.
                let Some(job) = self.queue.get_mut(job_id) else {
                    return;
                };
                if !job.status().is_active() {
                    return;
                }
                job.set_progress(fraction);
                let event = JobEvent::of(job).with_eta(eta_secs);
                self.emit(PipelineEvent::Job(event));
            }
            StageUpdate::Notice { job_id, message } => {
                tracing::info!(job = %job_id, notice = %message, "Stage notice");
                self.emit(PipelineEvent::Notice {
                    job_id: Some(job_id),
                    message,
                });
            }
            StageUpdate::Encoder { job_id, name } => {
                if self.queue.active().is_some_and(|j| j.id == job_id) {
                    self.active_encoder = Some(name);
                    self.emit_batch();
                }
            }
        }
    }

    /// Start the next stage if processing and nothing is active.
    fn advance(&mut self) {
        if !matches!(self.batch, BatchState::Running { .. }) {
            return;
        }
        let Some(next) = self.queue.next_eligible().map(|j| (j.id, j.kind)) else {
            self.finish_batch();
            return;
        };
        let (id, kind) = next;
        let to = match kind {
            JobKind::Download => JobStatus::Downloading,
            JobKind::Convert => JobStatus::Running,
        };
        if let Err(e) = self.queue.set_status(id, to) {
            tracing::error!(job = %id, error = %e, "Cannot start job");
            if self.queue.fail(id, e.to_string()).is_ok() {
                self.emit_job(id, None);
            }
            return;
        }
        self.emit_job(id, None);
        self.emit_batch();

        let Some(job) = self.queue.get(id).cloned() else {
            return;
        };
        tracing::info!(job = %id, kind = ?kind, source = %job.source.label(), "Job started");
        let ctx = self.ctx.clone();
        let cancel = CancelFlag::new();
        let stage_cancel = cancel.clone();
        let updates = self.updates_tx.clone();
        let handle = tokio::task::spawn_blocking(move || match job.kind {
            JobKind::Download => {
                StageResult::Download(run_download(&ctx, &job, &stage_cancel, &updates))
            }
            JobKind::Convert => {
                StageResult::Convert(run_convert(&ctx, &job, &stage_cancel, &updates))
            }
        });
        self.active = Some(ActiveStage {
            job_id: Some(id),
            cancel,
            handle,
        });
    }

    /// No eligible jobs left: merge if there is something to merge, then
    /// go idle.
    fn finish_batch(&mut self) {
        let done = match std::mem::replace(&mut self.batch, BatchState::Idle) {
            BatchState::Running { done, .. } => done,
            other => {
                self.batch = other;
                return;
            }
        };
        self.active_encoder = None;

        let candidates: Vec<MergeCandidate> = done
            .iter()
            .filter_map(|id| self.queue.get(*id))
            .filter_map(MergeCandidate::from_job)
            .collect();
        if self.ctx.config.merge.enabled && candidates.len() >= 2 {
            tracing::info!(candidates = candidates.len(), "Starting merge pass");
            let ctx = self.ctx.clone();
            let cancel = CancelFlag::new();
            let stage_cancel = cancel.clone();
            let handle = tokio::task::spawn_blocking(move || {
                StageResult::Merge(run_merge(&ctx, candidates, &stage_cancel))
            });
            self.active = Some(ActiveStage {
                job_id: None,
                cancel,
                handle,
            });
            self.batch = BatchState::Merging;
            return;
        }

        self.go_idle();
    }

    fn go_idle(&mut self) {
        self.batch = BatchState::Idle;
        self.active_encoder = None;
        let summary = self.summary();
        tracing::info!(
            completed = summary.completed,
            total = summary.total,
            "Queue idle"
        );
        self.emit(PipelineEvent::Idle(summary));
    }

    /// Apply the updates a stage sent before it finished.
    fn drain_updates(&mut self) {
        while let Ok(update) = self.updates_rx.try_recv() {
            self.apply_update(update);
        }
    }

    fn finish_stage(&mut self, result: Result<StageResult, JoinError>) {
        let Some(stage) = self.active.take() else {
            return;
        };
        self.drain_updates();

        match (stage.job_id, result) {
            (Some(id), Ok(StageResult::Convert(outcome))) => self.finish_convert(id, outcome),
            (Some(id), Ok(StageResult::Download(outcome))) => self.finish_download(id, outcome),
            (Some(id), Err(e)) => {
                tracing::error!(job = %id, error = %e, "Stage task failed");
                self.record_failure(id, None, format!("internal error: {e}"));
            }
            (_, Ok(StageResult::Merge(outcomes))) => {
                for outcome in outcomes {
                    self.report_merge(outcome);
                }
            }
            (None, Err(e)) => tracing::error!(error = %e, "Merge task failed"),
            (None, Ok(other)) => {
                tracing::error!(result = ?other, "Job stage finished without a job")
            }
        }

        if matches!(self.batch, BatchState::Merging) {
            self.batch = BatchState::Idle;
        }
        // Stopped by a cancel, or the merge pass is over.
        if matches!(self.batch, BatchState::Idle) {
            self.go_idle();
        }
    }

    fn record_done(&mut self, id: JobId, converted: bool) {
        if let BatchState::Running { done, finished, .. } = &mut self.batch {
            *finished += 1;
            if converted {
                done.push(id);
            }
        }
    }

    fn set_status(&mut self, id: JobId, to: JobStatus) -> bool {
        match self.queue.set_status(id, to) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(job = %id, to = %to, error = %e, "Status change rejected");
                false
            }
        }
    }

    fn record_failure(&mut self, id: JobId, output: Option<PathBuf>, cause: String) {
        if let Some(job) = self.queue.get_mut(id) {
            if output.is_some() {
                job.output_path = output;
            }
        }
        tracing::warn!(job = %id, cause = %cause, "Job failed");
        match self.queue.fail(id, cause) {
            Ok(()) => {
                self.record_done(id, false);
                self.emit_job(id, None);
            }
            Err(e) => tracing::error!(job = %id, error = %e, "Cannot mark job failed"),
        }
        self.emit_batch();
    }

    fn record_cancel(&mut self, id: JobId) {
        tracing::info!(job = %id, "Job cancelled, back to pending");
        if self.set_status(id, JobStatus::Pending) {
            self.emit_job(id, Some("Cancelled".to_string()));
        }
        self.emit_batch();
    }

    fn finish_convert(&mut self, id: JobId, outcome: ConvertOutcome) {
        match outcome {
            ConvertOutcome::Done { output, remote_id } => {
                if let Some(job) = self.queue.get_mut(id) {
                    job.output_path = Some(output.clone());
                    if remote_id.is_some() {
                        job.remote_id = remote_id;
                    }
                }
                if self.set_status(id, JobStatus::Done) {
                    tracing::info!(job = %id, output = %output.display(), "Job done");
                    self.record_done(id, true);
                    self.emit_job(id, None);
                }
                self.emit_batch();
            }
            ConvertOutcome::Skipped { output } => {
                if let Some(job) = self.queue.get_mut(id) {
                    job.output_path = Some(output.clone());
                }
                if self.set_status(id, JobStatus::Skipped) {
                    self.record_done(id, false);
                    self.emit_job(
                        id,
                        Some(format!("{} already exists", output.display())),
                    );
                }
                self.emit_batch();
            }
            ConvertOutcome::Cancelled => self.record_cancel(id),
            ConvertOutcome::Failed { output, cause } => self.record_failure(id, output, cause),
        }
    }

    fn finish_download(&mut self, id: JobId, outcome: DownloadOutcome) {
        match outcome {
            DownloadOutcome::Fetched(files) => {
                if !self.set_status(id, JobStatus::Downloaded) {
                    self.emit_batch();
                    return;
                }
                self.emit_job(id, None);
                let children = match self.queue.spawn_children(id, &files) {
                    Ok(children) => children,
                    Err(e) => {
                        self.record_failure(id, None, e.to_string());
                        return;
                    }
                };
                tracing::info!(job = %id, fetched = files.len(), spawned = children.len(), "Download finished");
                for child in &children {
                    self.emit_job(*child, None);
                }
                if self.set_status(id, JobStatus::Done) {
                    self.record_done(id, false);
                    let message = if files.is_empty() {
                        "No complete recordings found".to_string()
                    } else {
                        format!("{} recordings fetched", files.len())
                    };
                    self.emit_job(id, Some(message));
                }
                self.emit_batch();
            }
            DownloadOutcome::Cancelled => self.record_cancel(id),
            DownloadOutcome::Failed(cause) => self.record_failure(id, None, cause),
        }
    }

    fn report_merge(&self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Merged { output, parts } => {
                tracing::info!(output = %output.display(), parts, "Merged");
                self.emit(PipelineEvent::Merged { output, parts });
            }
            MergeOutcome::Skipped { output } => self.emit(PipelineEvent::Notice {
                job_id: None,
                message: format!("{} already exists, merge skipped", output.display()),
            }),
            MergeOutcome::Cancelled => self.emit(PipelineEvent::Notice {
                job_id: None,
                message: "Merge cancelled".to_string(),
            }),
            MergeOutcome::Failed { output, message } => {
                tracing::warn!(output = %output.display(), error = %message, "Merge failed");
                self.emit(PipelineEvent::MergeFailed { output, message });
            }
        }
    }

    /// Cancel the running stage, if any, and wait for it to settle.
    async fn stop_active(&mut self) {
        self.batch = BatchState::Idle;
        let Some(stage) = self.active.as_ref() else {
            return;
        };
        stage.cancel.cancel();
        let result = wait_active(&mut self.active).await;
        self.finish_stage(result);
    }
}
