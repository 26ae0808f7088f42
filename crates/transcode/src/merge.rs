//! Execution of concatenation plans: title cards, concat list, stream copy.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use camreel_common::{CamreelResult, CancelFlag, ToolPaths, VideoConfig};
use camreel_processing_core::{ConcatPlan, Segment, TitleCard};
use serde::Serialize;

use crate::media::{probe_duration, probe_resolution};
use crate::supervisor::{
    prepare_output, supervised_flags, Outcome, OutputSlot, TranscodeProgress, TranscodeSupervisor,
};

/// Frame size used when the first part cannot be probed.
pub const FALLBACK_RESOLUTION: (u32, u32) = (1920, 1080);

/// Result of merging one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged { output: PathBuf, parts: usize },
    /// Merged output exists and overwrite is disabled.
    Skipped { output: PathBuf },
    Cancelled,
    Failed { output: PathBuf, message: String },
}

/// Title card font size: an eighth of the frame height, clamped to 48..=200.
pub fn title_font_size(height: u32) -> u32 {
    (height / 8).clamp(48, 200)
}

/// ffmpeg arguments rendering `card` into `output`.
///
/// The label is read from `label_file` so it needs no filter escaping.
pub fn title_card_args(
    card: &TitleCard,
    (width, height): (u32, u32),
    fps: u32,
    label_file: &Path,
    output: &Path,
) -> Vec<String> {
    let duration = card.duration_secs;
    let mut args = supervised_flags();
    args.extend([
        "-f".to_string(),
        "lavfi".to_string(),
        "-i".to_string(),
        format!(
            "color=c={}:size={width}x{height}:duration={duration}:rate={fps}",
            card.background
        ),
        "-f".to_string(),
        "lavfi".to_string(),
        "-i".to_string(),
        "anullsrc=channel_layout=stereo:sample_rate=48000".to_string(),
        "-t".to_string(),
        duration.to_string(),
        "-vf".to_string(),
        format!(
            "drawtext=textfile='{}':expansion=none:fontsize={}:fontcolor={}:x=(w-text_w)/2:y=(h-text_h)/2:font=Sans",
            label_file.display(),
            title_font_size(height),
            card.text_color
        ),
    ]);
    args.extend(
        [
            "-c:v", "libx264", "-preset", "ultrafast", "-crf", "18", "-pix_fmt", "yuv420p", "-c:a",
            "aac", "-b:a", "128k", "-shortest",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Concat demuxer list; single quotes in paths are escaped as `'\''`.
pub fn concat_list<'a>(paths: impl IntoIterator<Item = &'a Path>) -> String {
    paths
        .into_iter()
        .map(|p| {
            let escaped = p.to_string_lossy().replace('\'', r"'\''");
            format!("file '{escaped}'\n")
        })
        .collect()
}

/// Stream-copy concatenation arguments.
pub fn concat_args(list: &Path, output: &Path) -> Vec<String> {
    let mut args = supervised_flags();
    args.extend(
        ["-f", "concat", "-safe", "0", "-i"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(list.to_string_lossy().into_owned());
    args.extend(
        ["-c", "copy", "-movflags", "+faststart"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Scratch directory removed on drop.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn create() -> CamreelResult<Self> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let dir = std::env::temp_dir().join(format!(
            "camreel_merge_{}_{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir)?;
        Ok(Self(dir))
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            tracing::debug!(dir = %self.0.display(), error = %e, "Failed to remove merge scratch dir");
        }
    }
}

/// Runs [`ConcatPlan`]s through the transcoder.
#[derive(Debug, Clone)]
pub struct MergeExecutor {
    supervisor: TranscodeSupervisor,
    ffprobe: PathBuf,
    fps: u32,
    overwrite: bool,
}

impl MergeExecutor {
    pub fn new(tools: &ToolPaths, video: &VideoConfig) -> Self {
        Self {
            supervisor: TranscodeSupervisor::new(&tools.ffmpeg),
            ffprobe: tools.ffprobe.clone(),
            fps: video.fps,
            overwrite: video.overwrite,
        }
    }

    /// Render the title cards, then stream-copy all segments into the
    /// plan's output. A title card that fails to render is left out.
    pub fn execute(
        &self,
        plan: &ConcatPlan,
        cancel: &CancelFlag,
        on_progress: &mut dyn FnMut(TranscodeProgress),
    ) -> CamreelResult<MergeOutcome> {
        let output = match prepare_output(&plan.output, self.overwrite)? {
            OutputSlot::Exists(output) => {
                tracing::info!(output = %output.display(), "Merged output exists, skipping");
                return Ok(MergeOutcome::Skipped { output });
            }
            OutputSlot::Ready(output) => output,
        };

        let Some(first) = plan.recordings().next() else {
            return Ok(MergeOutcome::Failed {
                output,
                message: "no recordings to merge".to_string(),
            });
        };
        let resolution = probe_resolution(&self.ffprobe, first).unwrap_or(FALLBACK_RESOLUTION);
        let scratch = ScratchDir::create()?;

        tracing::info!(
            output = %output.display(),
            parts = plan.recordings().count(),
            width = resolution.0,
            height = resolution.1,
            "Merging recordings"
        );

        let mut parts: Vec<PathBuf> = Vec::with_capacity(plan.segments.len());
        for segment in &plan.segments {
            match segment {
                Segment::Recording { path, .. } => parts.push(path.clone()),
                Segment::TitleCard(card) => {
                    if cancel.is_cancelled() {
                        return Ok(MergeOutcome::Cancelled);
                    }
                    match self.render_card(card, resolution, &scratch.0, cancel)? {
                        Outcome::Completed { output } => parts.push(output),
                        Outcome::Cancelled => return Ok(MergeOutcome::Cancelled),
                        other => {
                            tracing::warn!(label = %card.label, outcome = ?other, "Title card failed, leaving it out");
                        }
                    }
                }
            }
        }

        let recordings = plan.recordings().count();
        if recordings < 2 {
            return Ok(MergeOutcome::Failed {
                output,
                message: format!("a merge needs at least 2 recordings, got {recordings}"),
            });
        }

        let list = scratch.0.join("concat.txt");
        std::fs::write(&list, concat_list(parts.iter().map(PathBuf::as_path)))?;

        let total: f64 = parts
            .iter()
            .filter_map(|p| probe_duration(&self.ffprobe, p))
            .sum();
        let expected = (total > 0.0).then_some(total);

        let args = concat_args(&list, &output);
        let outcome = self
            .supervisor
            .run_args(&args, output.clone(), expected, cancel, on_progress)?;

        Ok(match outcome {
            Outcome::Completed { output } => {
                tracing::info!(output = %output.display(), parts = recordings, "Merge finished");
                MergeOutcome::Merged {
                    output,
                    parts: recordings,
                }
            }
            Outcome::Skipped { output } => MergeOutcome::Skipped { output },
            Outcome::Cancelled => MergeOutcome::Cancelled,
            Outcome::Failed {
                exit_code,
                diagnostic,
            } => MergeOutcome::Failed {
                output,
                message: match exit_code {
                    Some(code) => format!("ffmpeg exit {code}: {diagnostic}"),
                    None => diagnostic,
                },
            },
        })
    }

    fn render_card(
        &self,
        card: &TitleCard,
        resolution: (u32, u32),
        scratch: &Path,
        cancel: &CancelFlag,
    ) -> CamreelResult<Outcome> {
        let label_file = scratch.join(format!("title_{:02}.txt", card.position));
        std::fs::write(&label_file, &card.label)?;
        let output = scratch.join(format!("title_{:02}.mp4", card.position));
        let args = title_card_args(card, resolution, self.fps, &label_file, &output);
        tracing::debug!(label = %card.label, "Rendering title card");
        self.supervisor.run_args(
            &args,
            output,
            Some(card.duration_secs as f64),
            cancel,
            &mut |_| {},
        )
    }
}
