//! Blocking stage bodies run by the orchestrator for the active job.
//!
//! A stage works on a copy of the job and reports back through
//! [`StageUpdate`]s and its returned outcome; it never touches the queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use camreel_common::{
    linear_eta, CamreelError, CancelFlag, EncoderSetting, OutputFormat, ProgressClock,
    ResolvedConfig,
};
use camreel_job_model::{Job, JobId, JobSource};
use camreel_processing_core::{
    find_audio, plan, DriftScanner, DurationProbe, MergeCandidate, ScanError,
};
use camreel_transcode::supervisor::{prepare_output, OutputSlot};
use camreel_transcode::{
    expected_duration, publish_copy_request, resolve_with_rate, AudioSpec, CapabilityCache,
    CapabilityReport, FfprobeDurationProbe, InputSpec, MergeExecutor, MergeOutcome, Outcome,
    TranscodeProgress, TranscodeRequest, TranscodeSupervisor,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::fetch::{CameraSource, FetchError, FetchProgress, Fetcher};
use crate::publish::{effective_title, upload_target, Publisher};

/// Share of a convert job's progress spent on the drift scan.
const SCAN_SHARE: f64 = 0.15;
/// Share spent on the publish copy, when one is made.
const COPY_SHARE: f64 = 0.25;

/// What a stage reports while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum StageUpdate {
    Progress {
        job_id: JobId,
        fraction: f64,
        eta_secs: Option<f64>,
    },
    Notice {
        job_id: JobId,
        message: String,
    },
    /// Encoder chosen for the running transcode.
    Encoder { job_id: JobId, name: String },
}

/// Collaborators shared by every stage.
#[derive(Clone)]
pub struct StageContext {
    pub config: ResolvedConfig,
    pub capabilities: Arc<CapabilityCache>,
    pub fetcher: Arc<dyn Fetcher>,
    pub publisher: Option<Arc<dyn Publisher>>,
}

/// Result of a convert stage.
#[derive(Debug, Clone, PartialEq)]
pub enum ConvertOutcome {
    Done {
        output: PathBuf,
        remote_id: Option<String>,
    },
    Skipped {
        output: PathBuf,
    },
    /// Nothing of the job's output is kept; a restart redoes it all.
    Cancelled,
    Failed {
        output: Option<PathBuf>,
        cause: String,
    },
}

/// Result of a download stage.
#[derive(Debug)]
pub enum DownloadOutcome {
    Fetched(Vec<PathBuf>),
    Cancelled,
    Failed(String),
}

/// Sends updates for one job; a closed channel means nobody listens.
struct Reporter<'a> {
    job_id: JobId,
    tx: &'a UnboundedSender<StageUpdate>,
}

impl Reporter<'_> {
    fn progress(&self, fraction: f64, eta_secs: Option<f64>) {
        let _ = self.tx.send(StageUpdate::Progress {
            job_id: self.job_id,
            fraction,
            eta_secs,
        });
    }

    fn notice(&self, message: impl Into<String>) {
        let _ = self.tx.send(StageUpdate::Notice {
            job_id: self.job_id,
            message: message.into(),
        });
    }

    fn encoder(&self, name: &str) {
        let _ = self.tx.send(StageUpdate::Encoder {
            job_id: self.job_id,
            name: name.to_string(),
        });
    }
}

fn failure(output: Option<PathBuf>, err: impl std::fmt::Display) -> ConvertOutcome {
    ConvertOutcome::Failed {
        output,
        cause: err.to_string(),
    }
}

/// Cause text for an error, with its remediation hint when there is one.
fn describe(err: &CamreelError) -> String {
    match err.hint() {
        Some(hint) => format!("{err} ({hint})"),
        None => err.to_string(),
    }
}

/// Fetch every complete recording of a download job's camera.
pub fn run_download(
    ctx: &StageContext,
    job: &Job,
    cancel: &CancelFlag,
    updates: &UnboundedSender<StageUpdate>,
) -> DownloadOutcome {
    let reporter = Reporter {
        job_id: job.id,
        tx: updates,
    };
    let JobSource::Camera {
        device,
        remote_path,
    } = &job.source
    else {
        return DownloadOutcome::Failed("download job without a camera source".to_string());
    };
    let destination = match &job.destination {
        Some(dir) => dir.clone(),
        None => ctx.config.cameras.destination.join(device),
    };
    let source = CameraSource::resolve(&ctx.config.cameras, device, remote_path, &destination);
    tracing::info!(job = %job.id, source = %source.name, remote = %source.remote_dir.display(), "Fetching recordings");

    let clock = ProgressClock::start();
    let mut on_progress = |p: FetchProgress| {
        let fraction = p.fraction();
        reporter.progress(fraction, linear_eta(clock.elapsed_secs(), fraction));
    };
    match ctx.fetcher.fetch(&source, cancel, &mut on_progress) {
        Ok(files) => DownloadOutcome::Fetched(files),
        Err(FetchError::Cancelled) => DownloadOutcome::Cancelled,
        Err(e) => DownloadOutcome::Failed(e.to_string()),
    }
}

/// Capability report for this run. Only an automatic mp4 encode needs the
/// hardware probe.
fn capability_report(ctx: &StageContext) -> CapabilityReport {
    let video = &ctx.config.video;
    if video.encoder == EncoderSetting::Auto && video.output_format == OutputFormat::Mp4 {
        ctx.capabilities.get()
    } else {
        CapabilityReport::not_probed()
    }
}

/// Maps a stage's own `[0, 1]` progress into its slice of the job.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: f64,
    end: f64,
}

impl Span {
    fn map(self, fraction: f64) -> f64 {
        self.start + (self.end - self.start) * fraction.clamp(0.0, 1.0)
    }
}

/// Transcode one raw recording, then optionally make the publish copy and
/// upload.
pub fn run_convert(
    ctx: &StageContext,
    job: &Job,
    cancel: &CancelFlag,
    updates: &UnboundedSender<StageUpdate>,
) -> ConvertOutcome {
    let reporter = Reporter {
        job_id: job.id,
        tx: updates,
    };
    let config = &ctx.config;
    let video = &config.video;

    let Some(source) = job.local_path().map(Path::to_path_buf) else {
        return failure(None, "convert job without a local source");
    };
    if !source.is_file() {
        return failure(None, CamreelError::FileNotFound { path: source });
    }
    let Some(target) = job.derive_output_path(video.output_format.extension()) else {
        return failure(None, format!("cannot derive an output name for {}", source.display()));
    };
    if let Some(dir) = target.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(dir) {
            return failure(Some(target), e);
        }
    }

    // Settle the output slot before any expensive work.
    let output = match prepare_output(&target, video.overwrite) {
        Ok(OutputSlot::Exists(output)) => {
            tracing::info!(job = %job.id, output = %output.display(), "Output exists, skipping");
            return ConvertOutcome::Skipped { output };
        }
        Ok(OutputSlot::Ready(output)) => output,
        Err(e) => return failure(Some(target), describe(&e)),
    };

    let audio = if config.audio.include_audio {
        find_audio(&source, &config.audio.audio_suffix)
    } else {
        None
    };
    if config.audio.include_audio && audio.is_none() {
        tracing::info!(job = %job.id, source = %source.display(), "No paired audio found");
    }
    let probe = FfprobeDurationProbe::new(&config.tools.ffprobe);
    let audio_secs = audio.as_deref().and_then(|a| probe.duration_secs(a));
    let nominal_fps = video.fps as f64;

    let drift_applies = video.audio_sync && audio.is_some();
    let transcode_start = if drift_applies { SCAN_SHARE } else { 0.0 };
    let wants_copy = config.publish.create_copy && video.output_format == OutputFormat::Mp4;
    let transcode_end = if wants_copy { 1.0 - COPY_SHARE } else { 1.0 };

    let input_fps = if drift_applies {
        let span = Span {
            start: 0.0,
            end: SCAN_SHARE,
        };
        let scan = DriftScanner::with_defaults().scan(
            &source,
            audio.as_deref(),
            nominal_fps,
            &probe,
            cancel,
            |p| reporter.progress(span.map(p.percent as f64 / 100.0), None),
        );
        match scan {
            Ok(report) => {
                if report.adjusted {
                    reporter.notice(format!(
                        "Frame rate corrected from {} to {:.3} fps",
                        report.nominal_fps, report.effective_fps
                    ));
                }
                report.effective_fps
            }
            Err(ScanError::Cancelled) => return ConvertOutcome::Cancelled,
            Err(e) => return failure(None, describe(&e.into())),
        }
    } else {
        nominal_fps
    };

    let expected = expected_duration(&config.tools.ffprobe, &source, audio_secs, input_fps);
    let report = capability_report(ctx);
    let choice = resolve_with_rate(video, &report, input_fps);
    if let Some(notice) = &choice.fallback_notice {
        tracing::warn!(job = %job.id, notice = %notice, "Encoder fallback");
        reporter.notice(notice.clone());
    }
    reporter.encoder(&choice.encoder);

    let request = TranscodeRequest::new(
        InputSpec::raw_mjpeg(&source, input_fps),
        choice.clone(),
        output.clone(),
    )
    .with_audio(audio.as_ref().map(|a| AudioSpec::from_config(a, &config.audio)))
    .with_overwrite(video.overwrite)
    .with_expected_duration(expected);

    let supervisor = TranscodeSupervisor::new(&config.tools.ffmpeg);
    let span = Span {
        start: transcode_start,
        end: transcode_end,
    };
    let outcome = supervisor.run(&request, cancel, &mut |p: TranscodeProgress| {
        reporter.progress(span.map(p.fraction), p.eta_secs)
    });
    let output = match outcome {
        Ok(Outcome::Completed { output }) => output,
        // The slot was free a moment ago; something else wrote it since.
        Ok(Outcome::Skipped { output }) => return ConvertOutcome::Skipped { output },
        Ok(Outcome::Cancelled) => return ConvertOutcome::Cancelled,
        Ok(failed @ Outcome::Failed { .. }) => {
            let err = failed
                .into_error()
                .unwrap_or_else(|| CamreelError::encode_process(None, "transcode failed"));
            return failure(Some(output), describe(&err));
        }
        Err(e) => return failure(Some(output), describe(&e)),
    };

    if wants_copy {
        let span = Span {
            start: transcode_end,
            end: 1.0,
        };
        let request = publish_copy_request(&output, &choice, video, &config.publish, expected);
        match supervisor.run(&request, cancel, &mut |p: TranscodeProgress| {
            reporter.progress(span.map(p.fraction), p.eta_secs)
        }) {
            Ok(Outcome::Completed { output: copy }) => {
                tracing::info!(job = %job.id, copy = %copy.display(), "Publish copy written")
            }
            Ok(Outcome::Skipped { .. }) => {}
            Ok(Outcome::Cancelled) => {
                // A restart must redo the copy and the upload, and a kept
                // primary output would make it skip instead.
                discard_output(job.id, &output);
                return ConvertOutcome::Cancelled;
            }
            Ok(Outcome::Failed { diagnostic, .. }) => {
                reporter.notice(format!("Publish copy failed: {diagnostic}"))
            }
            Err(e) => reporter.notice(format!("Publish copy failed: {e}")),
        }
    }

    let remote_id = if config.publish.upload {
        publish_output(ctx.publisher.as_deref(), job, &output, &reporter)
    } else {
        None
    };

    ConvertOutcome::Done { output, remote_id }
}

fn discard_output(job_id: JobId, output: &Path) {
    if let Err(e) = std::fs::remove_file(output) {
        tracing::warn!(job = %job_id, output = %output.display(), error = %e, "Failed to remove output of cancelled job");
    }
}

/// Upload a finished output. Failures become notices; the transcode itself
/// succeeded.
fn publish_output(
    publisher: Option<&dyn Publisher>,
    job: &Job,
    output: &Path,
    reporter: &Reporter<'_>,
) -> Option<String> {
    let Some(publisher) = publisher else {
        reporter.notice("Upload enabled but no uploader is configured");
        return None;
    };
    let file = upload_target(output);
    let title = effective_title(&job.meta.title, output);
    match publisher.publish(&file, &title, &job.meta.playlist) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(job = %job.id, error = %e, "Publish failed");
            reporter.notice(format!("Upload failed: {e}"));
            None
        }
    }
}

/// Merge every multi-part group among the batch's finished outputs.
///
/// Groups run one after another; a failed group does not stop the rest.
/// Cancellation ends the pass.
pub fn run_merge(
    ctx: &StageContext,
    candidates: Vec<MergeCandidate>,
    cancel: &CancelFlag,
) -> Vec<MergeOutcome> {
    let merge_plan = plan(candidates);
    if merge_plan.groups.is_empty() {
        tracing::debug!("No multi-part groups to merge");
        return Vec::new();
    }
    let executor = MergeExecutor::new(&ctx.config.tools, &ctx.config.video);
    let mut outcomes = Vec::with_capacity(merge_plan.groups.len());
    for group in &merge_plan.groups {
        let concat = group.concat_plan(&ctx.config.merge);
        let outcome = match executor.execute(&concat, cancel, &mut |_| {}) {
            Ok(outcome) => outcome,
            Err(e) => MergeOutcome::Failed {
                output: concat.output.clone(),
                message: describe(&e),
            },
        };
        let cancelled = outcome == MergeOutcome::Cancelled;
        outcomes.push(outcome);
        if cancelled {
            break;
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_maps_into_slice() {
        let span = Span {
            start: 0.15,
            end: 0.75,
        };
        assert_eq!(span.map(0.0), 0.15);
        assert!((span.map(0.5) - 0.45).abs() < 1e-12);
        assert_eq!(span.map(2.0), 0.75);
    }

    #[test]
    fn test_describe_appends_hint() {
        let err = CamreelError::probe(
            camreel_transcode::ProbeStep::Driver.label(),
            "driver 470.10 too old",
            Some("update the driver".to_string()),
        );
        let text = describe(&err);
        assert!(text.contains("driver 470.10 too old"));
        assert!(text.ends_with("(update the driver)"));
    }
}
