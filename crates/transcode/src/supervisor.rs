//! Transcoder process supervision.
//!
//! One [`TranscodeSupervisor::run`] call drives one ffmpeg invocation:
//! - the output slot is checked first (skip, overwrite, or alternative name)
//! - the structured `-progress pipe:1` stream becomes monotonic progress
//!   with a linear ETA
//! - stderr is drained concurrently and its tail kept for diagnostics
//! - a watcher thread polls the cancel flag and terminates the process group

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use camreel_common::{
    AudioConfig, CamreelError, CamreelResult, CancelFlag, ProgressClock, PublishConfig,
    VideoConfig, CANCEL_POLL_INTERVAL,
};
use serde::Serialize;

use crate::encoder::{build_encoder_args, EncoderChoice};

/// Number of diagnostic stderr lines kept for error reports.
pub const DIAGNOSTIC_TAIL_LINES: usize = 10;

/// Progress is held below this until the process exits successfully.
pub const MAX_RUNNING_FRACTION: f64 = 0.99;

/// Grace period between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Alternative output names tried when an existing output cannot be removed.
const MAX_ALTERNATIVE_NAMES: u32 = 99;

/// Suffix of the publish-optimised copy.
pub const PUBLISH_COPY_SUFFIX: &str = "_youtube";

/// Leading flags of every supervised invocation: quiet banner, forced
/// overwrite (the output slot is decided beforehand), and the structured
/// progress stream on stdout.
pub fn supervised_flags() -> Vec<String> {
    ["-hide_banner", "-y", "-nostats", "-progress", "pipe:1"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Input side of a transcode.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub path: PathBuf,
    /// Forced input rate (`-framerate`), used for raw streams.
    pub framerate: Option<f64>,
    /// Forced demuxer (`-f`).
    pub format: Option<String>,
}

impl InputSpec {
    /// A raw MJPEG stream read at `fps`.
    pub fn raw_mjpeg(path: impl Into<PathBuf>, fps: f64) -> Self {
        Self {
            path: path.into(),
            framerate: Some(fps),
            format: Some("mjpeg".to_string()),
        }
    }

    /// A regular container; ffmpeg detects the format.
    pub fn container(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            framerate: None,
            format: None,
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(fps) = self.framerate {
            args.extend(["-framerate".to_string(), format!("{fps:.6}")]);
        }
        if let Some(format) = &self.format {
            args.extend(["-f".to_string(), format.clone()]);
        }
        args.extend(["-i".to_string(), self.path.to_string_lossy().into_owned()]);
        args
    }
}

/// Paired audio track and how to encode it.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSpec {
    pub path: PathBuf,
    pub bitrate: String,
    /// Audio filter chain, present only when amplification is enabled.
    pub filter: Option<String>,
}

impl AudioSpec {
    pub fn from_config(path: impl Into<PathBuf>, audio: &AudioConfig) -> Self {
        let filter = audio.amplify_audio.then(|| {
            format!(
                "compand=attacks=0.3:decays=0.8:points={},loudnorm",
                audio.compand_points
            )
        });
        Self {
            path: path.into(),
            bitrate: audio.audio_bitrate.clone(),
            filter,
        }
    }

    fn input_args(&self) -> Vec<String> {
        vec!["-i".to_string(), self.path.to_string_lossy().into_owned()]
    }

    fn output_args(&self) -> Vec<String> {
        let mut args = vec![
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            self.bitrate.clone(),
        ];
        if let Some(filter) = &self.filter {
            args.extend(["-af".to_string(), filter.clone()]);
        }
        args.push("-shortest".to_string());
        args
    }
}

/// Everything needed for one transcoder invocation.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub input: InputSpec,
    pub encoder: EncoderChoice,
    pub audio: Option<AudioSpec>,
    /// Output arguments appended after the codec arguments.
    pub extra_args: Vec<String>,
    pub output: PathBuf,
    pub overwrite: bool,
    /// Total media duration, for the progress fraction.
    pub expected_duration_secs: Option<f64>,
}

impl TranscodeRequest {
    pub fn new(input: InputSpec, encoder: EncoderChoice, output: impl Into<PathBuf>) -> Self {
        Self {
            input,
            encoder,
            audio: None,
            extra_args: Vec::new(),
            output: output.into(),
            overwrite: false,
            expected_duration_secs: None,
        }
    }

    pub fn with_audio(mut self, audio: Option<AudioSpec>) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_expected_duration(mut self, secs: Option<f64>) -> Self {
        self.expected_duration_secs = secs;
        self
    }

    /// Full ffmpeg argument list writing to `output`.
    pub fn build_args(&self, output: &Path) -> Vec<String> {
        let mut args = supervised_flags();
        args.extend(self.input.args());
        if let Some(audio) = &self.audio {
            args.extend(audio.input_args());
        }
        args.extend(self.encoder.args.iter().cloned());
        if let Some(audio) = &self.audio {
            args.extend(audio.output_args());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

/// Path of the publish-optimised copy of `mp4`.
pub fn publish_copy_path(mp4: &Path) -> PathBuf {
    let stem = mp4
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    mp4.with_file_name(format!("{stem}{PUBLISH_COPY_SUFFIX}.mp4"))
}

/// Request re-encoding a finished mp4 into the publish-optimised copy.
///
/// Uses the `medium` preset at the publish CRF and the nominal frame rate.
pub fn publish_copy_request(
    mp4: &Path,
    encoder: &EncoderChoice,
    video: &VideoConfig,
    publish: &PublishConfig,
    expected_duration_secs: Option<f64>,
) -> TranscodeRequest {
    let args = build_encoder_args(
        &encoder.encoder,
        "medium",
        publish.crf,
        false,
        video.fps as f64,
    );
    let choice = EncoderChoice {
        args,
        fallback_notice: None,
        ..encoder.clone()
    };
    let mut request = TranscodeRequest::new(InputSpec::container(mp4), choice, publish_copy_path(mp4))
        .with_overwrite(video.overwrite)
        .with_expected_duration(expected_duration_secs);
    request.extra_args = vec![
        "-maxrate".to_string(),
        publish.maxrate.clone(),
        "-bufsize".to_string(),
        publish.bufsize.clone(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        publish.audio_bitrate.clone(),
        "-movflags".to_string(),
        "+faststart".to_string(),
    ];
    request
}

/// Where a transcode will write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSlot {
    /// Free to write here.
    Ready(PathBuf),
    /// Output exists and overwrite is disabled.
    Exists(PathBuf),
}

/// Decide the output path for `path`.
///
/// With overwrite enabled the existing file is removed first. If that
/// fails, `<stem>_<n>.<ext>` is used for the first free `n` in 1..100.
pub fn prepare_output(path: &Path, overwrite: bool) -> CamreelResult<OutputSlot> {
    if !path.exists() {
        return Ok(OutputSlot::Ready(path.to_path_buf()));
    }
    if !overwrite {
        return Ok(OutputSlot::Exists(path.to_path_buf()));
    }

    let err = match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(output = %path.display(), "Overwriting existing output");
            return Ok(OutputSlot::Ready(path.to_path_buf()));
        }
        Err(err) => err,
    };

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    for n in 1..=MAX_ALTERNATIVE_NAMES {
        let alt = path.with_file_name(format!("{stem}_{n}{ext}"));
        if !alt.exists() {
            tracing::warn!(
                output = %path.display(),
                alternative = %alt.display(),
                error = %err,
                "Existing output cannot be removed, writing alternative file"
            );
            return Ok(OutputSlot::Ready(alt));
        }
    }

    tracing::error!(output = %path.display(), error = %err, "No writable output name");
    Err(CamreelError::Io(err))
}

/// Result of one supervised run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Completed {
        output: PathBuf,
    },
    Skipped {
        output: PathBuf,
    },
    /// Cancelled; the partial output was removed.
    Cancelled,
    Failed {
        exit_code: Option<i32>,
        diagnostic: String,
    },
}

impl Outcome {
    /// Convert a failure into the shared error type.
    pub fn into_error(self) -> Option<CamreelError> {
        match self {
            Self::Failed {
                exit_code,
                diagnostic,
            } => Some(CamreelError::encode_process(exit_code, diagnostic)),
            Self::Cancelled => Some(CamreelError::Cancelled),
            _ => None,
        }
    }
}

/// A progress report from a running transcode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TranscodeProgress {
    /// Fraction in `[0, 1]`; never decreases.
    pub fraction: f64,
    pub out_time_secs: f64,
    pub eta_secs: Option<f64>,
}

/// A typed line from the `-progress` stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressLine {
    OutTime(f64),
    Continue,
    End,
}

/// Parse one `key=value` line of the progress stream.
///
/// Returns `None` for lines that carry nothing the supervisor tracks.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    let value = value.trim();
    match key.trim() {
        // ffmpeg reports `out_time_ms` in microseconds as well.
        "out_time_us" | "out_time_ms" => value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|us| ProgressLine::OutTime(us / 1_000_000.0)),
        "out_time" => parse_clock(value).map(ProgressLine::OutTime),
        "progress" => match value {
            "end" => Some(ProgressLine::End),
            _ => Some(ProgressLine::Continue),
        },
        _ => None,
    }
}

/// Parse `HH:MM:SS.frac` into seconds.
fn parse_clock(value: &str) -> Option<f64> {
    let mut parts = value.splitn(3, ':');
    let h = parts.next()?.parse::<u64>().ok()?;
    let m = parts.next()?.parse::<u64>().ok()?;
    let s = parts.next()?.parse::<f64>().ok()?;
    if !s.is_finite() || s < 0.0 {
        return None;
    }
    Some((h * 3600 + m * 60) as f64 + s)
}

/// Folds progress lines into monotonic reports.
#[derive(Debug)]
pub struct ProgressTracker {
    expected_secs: Option<f64>,
    clock: ProgressClock,
    out_time_secs: f64,
}

impl ProgressTracker {
    pub fn new(expected_secs: Option<f64>) -> Self {
        Self {
            expected_secs: expected_secs.filter(|d| d.is_finite() && *d > 0.0),
            clock: ProgressClock::start(),
            out_time_secs: 0.0,
        }
    }

    /// Feed one parsed line. A report is produced at each block boundary.
    pub fn observe(&mut self, line: ProgressLine) -> Option<TranscodeProgress> {
        match line {
            ProgressLine::OutTime(secs) => {
                self.out_time_secs = self.out_time_secs.max(secs);
                None
            }
            ProgressLine::Continue | ProgressLine::End => {
                if let Some(total) = self.expected_secs {
                    let raw = (self.out_time_secs / total).min(MAX_RUNNING_FRACTION);
                    self.clock.advance(raw);
                }
                Some(self.report())
            }
        }
    }

    /// Final report after a successful exit.
    pub fn complete(&mut self) -> TranscodeProgress {
        self.clock.advance(1.0);
        self.report()
    }

    fn report(&self) -> TranscodeProgress {
        TranscodeProgress {
            fraction: self.clock.fraction(),
            out_time_secs: self.out_time_secs,
            eta_secs: self.clock.eta_secs(),
        }
    }
}

/// Keeps the last few diagnostic lines of the transcoder's stderr.
#[derive(Debug, Default)]
struct DiagnosticTail {
    lines: VecDeque<String>,
}

impl DiagnosticTail {
    fn push(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.contains("time=") || line.contains("frame=") {
            return;
        }
        if self.lines.len() == DIAGNOSTIC_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn join(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

enum ProcessEnd {
    Exited(ExitStatus),
    Cancelled,
}

/// Launches and monitors the transcoder.
#[derive(Debug, Clone)]
pub struct TranscodeSupervisor {
    ffmpeg: PathBuf,
    terminate_grace: Duration,
}

impl TranscodeSupervisor {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            terminate_grace: TERMINATE_GRACE,
        }
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    /// Run one transcode to completion, failure, or cancellation.
    ///
    /// Launch and I/O failures are returned as errors; process failures are
    /// reported as [`Outcome::Failed`].
    pub fn run(
        &self,
        request: &TranscodeRequest,
        cancel: &CancelFlag,
        on_progress: &mut dyn FnMut(TranscodeProgress),
    ) -> CamreelResult<Outcome> {
        let output = match prepare_output(&request.output, request.overwrite)? {
            OutputSlot::Exists(output) => {
                tracing::info!(output = %output.display(), "Output exists, skipping");
                return Ok(Outcome::Skipped { output });
            }
            OutputSlot::Ready(output) => output,
        };

        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let args = request.build_args(&output);
        tracing::info!(
            input = %request.input.path.display(),
            output = %output.display(),
            encoder = %request.encoder.encoder,
            "Starting transcode"
        );
        self.run_args(&args, output, request.expected_duration_secs, cancel, on_progress)
    }

    /// Run ffmpeg with a complete argument list that writes `output`.
    ///
    /// `args` must include `-progress pipe:1` for progress to be reported.
    pub fn run_args(
        &self,
        args: &[String],
        output: PathBuf,
        expected_duration_secs: Option<f64>,
        cancel: &CancelFlag,
        on_progress: &mut dyn FnMut(TranscodeProgress),
    ) -> CamreelResult<Outcome> {
        tracing::debug!(args = ?args, "ffmpeg command");

        let mut tracker = ProgressTracker::new(expected_duration_secs);
        let (end, tail) = self.execute(args, cancel, |line| {
            if let Some(report) = tracker.observe(line) {
                on_progress(report);
            }
        })?;

        match end {
            ProcessEnd::Cancelled => {
                remove_partial(&output);
                tracing::info!(output = %output.display(), "Transcode cancelled");
                Ok(Outcome::Cancelled)
            }
            ProcessEnd::Exited(status) if status.success() => {
                if !output.exists() {
                    return Ok(Outcome::Failed {
                        exit_code: status.code(),
                        diagnostic: format!("output file was not created: {}", output.display()),
                    });
                }
                on_progress(tracker.complete());
                tracing::info!(output = %output.display(), "Transcode finished");
                Ok(Outcome::Completed { output })
            }
            ProcessEnd::Exited(status) => {
                let diagnostic = tail.join();
                tracing::warn!(
                    exit_code = ?status.code(),
                    diagnostic = %diagnostic,
                    "Transcoder failed"
                );
                Ok(Outcome::Failed {
                    exit_code: status.code(),
                    diagnostic,
                })
            }
        }
    }

    fn execute(
        &self,
        args: &[String],
        cancel: &CancelFlag,
        mut on_line: impl FnMut(ProgressLine),
    ) -> CamreelResult<(ProcessEnd, DiagnosticTail)> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| {
            CamreelError::encode_process(
                None,
                format!("failed to start {}: {e}", self.ffmpeg.display()),
            )
        })?;
        tracing::debug!(pid = child.id(), "ffmpeg process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));
        let finished = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));

        // Drain stderr concurrently so ffmpeg never blocks on a full pipe.
        let stderr_task = std::thread::spawn(move || {
            let mut tail = DiagnosticTail::default();
            if let Some(stderr) = stderr {
                for chunk in BufReader::new(stderr).split(b'\n') {
                    let Ok(chunk) = chunk else { break };
                    for line in String::from_utf8_lossy(&chunk).split('\r') {
                        tail.push(line);
                    }
                }
            }
            tail
        });

        let watcher = {
            let child = Arc::clone(&child);
            let finished = Arc::clone(&finished);
            let cancelled = Arc::clone(&cancelled);
            let cancel = cancel.clone();
            let grace = self.terminate_grace;
            std::thread::spawn(move || {
                watch_for_cancel(&child, &finished, &cancelled, &cancel, grace)
            })
        };

        if let Some(stdout) = stdout {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                match parse_progress_line(&line) {
                    Some(parsed) => on_line(parsed),
                    None if line.trim().is_empty() => {}
                    None => tracing::debug!(target: "camreel::ffmpeg", "{line}"),
                }
            }
        }

        let status = loop {
            if let Some(status) = lock(&child).try_wait()? {
                break status;
            }
            std::thread::sleep(Duration::from_millis(25));
        };
        finished.store(true, Ordering::SeqCst);
        let _ = watcher.join();

        let tail = stderr_task.join().unwrap_or_default();

        if cancelled.load(Ordering::SeqCst) {
            Ok((ProcessEnd::Cancelled, tail))
        } else {
            Ok((ProcessEnd::Exited(status), tail))
        }
    }
}

fn lock(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn watch_for_cancel(
    child: &Mutex<Child>,
    finished: &AtomicBool,
    cancelled: &AtomicBool,
    cancel: &CancelFlag,
    grace: Duration,
) {
    while !finished.load(Ordering::SeqCst) {
        if !cancel.wait_timeout(CANCEL_POLL_INTERVAL) {
            continue;
        }
        cancelled.store(true, Ordering::SeqCst);
        {
            let mut guard = lock(child);
            if matches!(guard.try_wait(), Ok(None)) {
                tracing::info!(pid = guard.id(), "Terminating transcoder");
                terminate(&mut guard);
            }
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !matches!(lock(child).try_wait(), Ok(None)) {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        let mut guard = lock(child);
        if matches!(guard.try_wait(), Ok(None)) {
            tracing::warn!(pid = guard.id(), "Transcoder ignored SIGTERM, killing");
            kill(&mut guard);
        }
        return;
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    let pgid = child.id() as libc::pid_t;
    // The child leads its own process group and has not been reaped.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        tracing::debug!(
            pgid,
            signal,
            error = %std::io::Error::last_os_error(),
            "Signalling process group failed"
        );
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    signal_group(child, libc::SIGTERM);
}

#[cfg(unix)]
fn kill(child: &mut Child) {
    signal_group(child, libc::SIGKILL);
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill(child: &mut Child) {
    let _ = child.kill();
}

fn remove_partial(output: &Path) {
    if output.exists() {
        if let Err(e) = std::fs::remove_file(output) {
            tracing::warn!(output = %output.display(), error = %e, "Failed to remove partial output");
        }
    }
}
