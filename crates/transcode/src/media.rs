//! ffprobe helpers and duration estimation.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use camreel_processing_core::{DurationProbe, WavHeaderProbe};

/// Average encoded MJPEG frame size relative to pixel count.
const MJPEG_BYTES_PER_PIXEL: f64 = 0.3;

/// Frame size assumed when the resolution is unknown.
const FALLBACK_FRAME_BYTES: f64 = 120_000.0;

/// Container duration in seconds via ffprobe.
pub fn probe_duration(ffprobe: &Path, path: &Path) -> Option<f64> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-show_entries",
            "format=duration",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let raw = String::from_utf8(output.stdout).ok()?;
    parse_duration(raw.trim())
}

fn parse_duration(value: &str) -> Option<f64> {
    if value.is_empty() || value == "N/A" {
        return None;
    }
    value.parse::<f64>().ok().filter(|d| d.is_finite() && *d > 0.0)
}

/// First video stream's `(width, height)` via ffprobe.
pub fn probe_resolution(ffprobe: &Path, path: &Path) -> Option<(u32, u32)> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=p=0:s=x",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let raw = String::from_utf8(output.stdout).ok()?;
    parse_resolution(raw.lines().next()?.trim())
}

fn parse_resolution(line: &str) -> Option<(u32, u32)> {
    let (w, h) = line.split_once('x')?;
    let width = w.trim().parse::<u32>().ok()?;
    let height = h.trim().parse::<u32>().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

/// Rough duration of a raw MJPEG stream from its size.
pub fn estimate_duration_from_size(
    size_bytes: u64,
    resolution: Option<(u32, u32)>,
    fps: f64,
) -> Option<f64> {
    if size_bytes == 0 || fps <= 0.0 {
        return None;
    }
    let frame_bytes = match resolution {
        Some((w, h)) => (w as f64 * h as f64 * MJPEG_BYTES_PER_PIXEL).max(1.0),
        None => FALLBACK_FRAME_BYTES,
    };
    Some(size_bytes as f64 / frame_bytes / fps)
}

/// Durations from ffprobe, falling back to the WAV header for WAV files.
#[derive(Debug, Clone)]
pub struct FfprobeDurationProbe {
    ffprobe: PathBuf,
}

impl FfprobeDurationProbe {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }
}

impl DurationProbe for FfprobeDurationProbe {
    fn duration_secs(&self, path: &Path) -> Option<f64> {
        probe_duration(&self.ffprobe, path).or_else(|| WavHeaderProbe.duration_secs(path))
    }
}

/// Best known duration of the material a transcode will produce.
///
/// Preference: paired audio, then the source container, then the size
/// heuristic.
pub fn expected_duration(
    ffprobe: &Path,
    source: &Path,
    audio_secs: Option<f64>,
    fps: f64,
) -> Option<f64> {
    if let Some(secs) = audio_secs.filter(|d| *d > 0.0) {
        return Some(secs);
    }
    if let Some(secs) = probe_duration(ffprobe, source) {
        return Some(secs);
    }
    let size = std::fs::metadata(source).ok()?.len();
    let estimate = estimate_duration_from_size(size, probe_resolution(ffprobe, source), fps);
    if let Some(secs) = estimate {
        tracing::info!(source = %source.display(), secs, "Duration estimated from file size");
    }
    estimate
}
