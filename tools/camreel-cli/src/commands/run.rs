//! Queue recordings and run the pipeline until the queue is idle.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use camreel_common::{format_duration, AppConfig, EncoderSetting, Profile, ResolvedConfig};
use camreel_job_model::{
    BatchSummary, JobEvent, JobId, JobStatus, PipelineEvent, PublishMeta, QueueSnapshot,
};
use camreel_pipeline::{CommandPublisher, DirectoryFetcher, OrchestratorBuilder, OrchestratorHandle};
use tokio::sync::broadcast::error::RecvError;

/// Flags of `camreel run`.
pub struct RunOptions {
    pub inputs: Vec<PathBuf>,
    pub download: bool,
    pub queue: Option<PathBuf>,
    pub save_queue: Option<PathBuf>,
    pub profile: Option<String>,
    pub encoder: Option<String>,
    pub crf: Option<u8>,
    pub overwrite: bool,
    pub audio_sync: bool,
    pub merge: bool,
    pub upload: bool,
    pub title: String,
    pub playlist: String,
}

pub async fn run(mut config: AppConfig, options: RunOptions) -> anyhow::Result<()> {
    // Profile first, explicit flags after so they win.
    if let Some(name) = &options.profile {
        let profile = Profile::parse(name).ok_or_else(|| {
            anyhow::anyhow!("Unknown profile '{name}' (expected analysis, upload or custom)")
        })?;
        config.video.apply_profile(profile);
    }
    if let Some(encoder) = options.encoder.clone() {
        config.video.encoder = EncoderSetting::from(encoder);
    }
    if let Some(crf) = options.crf {
        config.video.crf = crf;
    }
    config.video.overwrite |= options.overwrite;
    config.video.audio_sync |= options.audio_sync;
    config.merge.enabled |= options.merge;
    config.publish.upload |= options.upload;

    let mut builder = OrchestratorBuilder::new(
        ResolvedConfig::new(config.clone()),
        Arc::new(DirectoryFetcher::new()),
    );
    if !config.publish.uploader_command.is_empty() {
        let publisher = CommandPublisher::new(config.publish.uploader_command.clone())?;
        builder = builder.with_publisher(Arc::new(publisher));
    } else if config.publish.upload {
        println!("[WARN] Upload requested but no uploader command is configured; files stay local.");
    }

    let (handle, worker) = builder.spawn();
    let mut events = handle.subscribe();

    let meta = PublishMeta::new(options.title.as_str(), options.playlist.as_str());
    let queued = queue_inputs(&handle, &config, &options, &meta).await?;

    println!("camreel run");
    println!("{}", "=".repeat(50));
    println!("  Jobs queued: {queued}");
    println!("  Encoder: {}", config.video.encoder);
    println!("  Profile: {}", config.video.profile);
    println!("  Output: {}", config.video.output_format.extension());
    println!("  Audio sync: {}", config.video.audio_sync);
    println!("  Merge: {}", config.merge.enabled);
    println!();

    let mut labels = Labels::default();
    labels.refresh(&handle).await?;

    if handle.start().await? {
        let mut cancelling = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PipelineEvent::Idle(summary)) => {
                        print_summary(&summary);
                        break;
                    }
                    Ok(event) => {
                        if event.job_id().is_some_and(|id| !labels.knows(id)) {
                            labels.refresh(&handle).await?;
                        }
                        render(&event, &mut labels);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed progress events");
                    }
                    Err(RecvError::Closed) => break,
                },
                signal = tokio::signal::ctrl_c(), if !cancelling => {
                    signal?;
                    cancelling = true;
                    println!();
                    println!("Cancelling current job...");
                    handle.cancel_current().await?;
                }
            }
        }
    }

    let snapshot = handle.shutdown().await?;
    worker.await?;

    if let Some(path) = &options.save_queue {
        snapshot.save(path)?;
        println!("Queue saved to: {}", path.display());
    }
    print_failures(&snapshot);

    Ok(())
}

/// Restore the saved queue, then add downloads and local inputs.
async fn queue_inputs(
    handle: &OrchestratorHandle,
    config: &AppConfig,
    options: &RunOptions,
    meta: &PublishMeta,
) -> anyhow::Result<usize> {
    let mut queued = 0;

    if let Some(path) = &options.queue {
        let snapshot = QueueSnapshot::load(path)?;
        queued += handle.import(snapshot).await?.len();
    }

    if options.download {
        let devices: Vec<String> = config
            .cameras
            .devices
            .iter()
            .map(|d| d.name.clone())
            .collect();
        if devices.is_empty() {
            println!("[WARN] --download given but no cameras are configured");
        } else {
            queued += handle
                .add_downloads(
                    devices,
                    config.cameras.source_dir.clone(),
                    config.cameras.destination.clone(),
                    meta.clone(),
                )
                .await?
                .len();
        }
    }

    let mut local = Vec::new();
    let mut files = Vec::new();
    for input in &options.inputs {
        if input.is_dir() {
            let ids = handle.scan_folder(input.clone()).await?;
            tracing::info!(dir = %input.display(), found = ids.len(), "Scanned folder");
            local.extend(ids);
        } else {
            files.push(input.clone());
        }
    }
    if !files.is_empty() {
        local.extend(handle.add_files(files).await?);
    }
    queued += local.len();

    if *meta != PublishMeta::default() {
        for id in local {
            handle
                .edit_metadata(id, meta.title.clone(), meta.playlist.clone())
                .await?;
        }
    }

    Ok(queued)
}

/// Display names and last printed status per job.
#[derive(Default)]
struct Labels {
    names: HashMap<JobId, String>,
    last_status: HashMap<JobId, JobStatus>,
    /// A `\r` progress line is on screen.
    progress_open: bool,
}

impl Labels {
    fn knows(&self, id: JobId) -> bool {
        self.names.contains_key(&id)
    }

    async fn refresh(&mut self, handle: &OrchestratorHandle) -> anyhow::Result<()> {
        for job in handle.jobs().await? {
            self.names.insert(job.id, job.source.label());
        }
        Ok(())
    }

    fn name(&self, id: JobId) -> String {
        self.names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    fn close_progress(&mut self) {
        if self.progress_open {
            println!();
            self.progress_open = false;
        }
    }
}

fn render(event: &PipelineEvent, labels: &mut Labels) {
    match event {
        PipelineEvent::Job(job) => render_job(job, labels),
        PipelineEvent::Batch(_) => {}
        PipelineEvent::Notice { job_id, message } => {
            labels.close_progress();
            match job_id {
                Some(id) => println!("  [NOTE] {}: {message}", labels.name(*id)),
                None => println!("  [NOTE] {message}"),
            }
        }
        PipelineEvent::Merged { output, parts } => {
            labels.close_progress();
            println!("  [OK] Merged {parts} parts into {}", output.display());
        }
        PipelineEvent::MergeFailed { output, message } => {
            labels.close_progress();
            println!("  [FAIL] Merge of {} failed: {message}", output.display());
        }
        PipelineEvent::Idle(_) => {}
    }
}

fn render_job(event: &JobEvent, labels: &mut Labels) {
    let name = labels.name(event.job_id);
    let previous = labels.last_status.insert(event.job_id, event.status);

    if previous == Some(event.status) && event.status.is_active() {
        let eta = event
            .eta_secs
            .map(|s| format!(", ETA: {}", format_duration(s)))
            .unwrap_or_default();
        print!(
            "\r  {name}: {} {:.1}%{eta}    ",
            event.status.as_str(),
            event.progress * 100.0
        );
        let _ = std::io::stdout().flush();
        labels.progress_open = true;
        return;
    }
    if previous == Some(event.status) {
        return;
    }

    labels.close_progress();
    let detail = event
        .message
        .as_deref()
        .map(|m| format!(" ({m})"))
        .unwrap_or_default();
    match event.status {
        JobStatus::Done => println!("  [OK] {name}{detail}"),
        JobStatus::Skipped => println!("  [SKIP] {name}{detail}"),
        JobStatus::Error => println!("  [FAIL] {name}{detail}"),
        status => println!("  {name}: {}{detail}", status.as_str()),
    }
}

fn print_summary(summary: &BatchSummary) {
    println!();
    println!("{}", "=".repeat(50));
    println!("Finished {}/{} jobs", summary.completed, summary.total);
}

fn print_failures(snapshot: &QueueSnapshot) {
    let failed: Vec<_> = snapshot
        .jobs
        .iter()
        .filter(|j| j.status() == JobStatus::Error)
        .collect();
    if failed.is_empty() {
        return;
    }
    println!();
    println!("Failed jobs:");
    for job in failed {
        println!(
            "  {}: {}",
            job.source.label(),
            job.error.as_deref().unwrap_or("unknown error")
        );
    }
}
