//! Frame-drop drift correction.
//!
//! Raw MJPEG recordings lose frames under load, so the decoded video runs
//! shorter than the paired audio and the two drift apart over time. The
//! scanner counts the frames that actually exist and derives the input frame
//! rate that stretches them over the audio duration.
//!
//! # Algorithm
//!
//! 1. **Stream** the container in large chunks, without decoding or seeking.
//! 2. **Count** JPEG start-of-image markers (`FF D8`). Byte stuffing
//!    guarantees the pair never occurs inside entropy-coded data. A marker
//!    split across a chunk boundary is counted once.
//! 3. **Compare** `frames / nominal_fps` with the audio duration. Only a
//!    relative difference above the threshold changes the rate.
//! 4. **Correct**: `effective_fps = frames / audio_secs`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use camreel_common::{CamreelError, CancelFlag, StepNotifier};
use serde::Serialize;

/// JPEG start-of-image marker.
pub const SOI_MARKER: [u8; 2] = [0xFF, 0xD8];

/// Read size for the frame scan. Cancellation is polled once per chunk, so
/// this bounds how much is read after a cancel request.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Relative video/audio duration difference below which the nominal rate is kept.
pub const MATERIAL_DRIFT_RATIO: f64 = 0.001;

/// Errors from the frame scan.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is empty", path.display())]
    Empty { path: PathBuf },

    #[error("{} has no decodable content ({markers} frame markers found)", path.display())]
    NoDecodableContent { path: PathBuf, markers: u64 },

    #[error("Frame scan cancelled")]
    Cancelled,
}

impl From<ScanError> for CamreelError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::Cancelled => CamreelError::Cancelled,
            ScanError::Io { ref path, .. }
            | ScanError::Empty { ref path }
            | ScanError::NoDecodableContent { ref path, .. } => {
                CamreelError::scan(path.clone(), err.to_string())
            }
        }
    }
}

/// Source of media durations.
///
/// Production code asks ffprobe; [`WavHeaderProbe`] reads PCM WAV headers
/// directly and serves as fallback and test double.
pub trait DurationProbe {
    fn duration_secs(&self, path: &Path) -> Option<f64>;
}

/// Duration of a PCM WAV file from its `fmt ` and `data` chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavHeaderProbe;

impl DurationProbe for WavHeaderProbe {
    fn duration_secs(&self, path: &Path) -> Option<f64> {
        let mut file = File::open(path).ok()?;
        wav_duration(&mut file)
    }
}

fn wav_duration<R: Read + Seek>(reader: &mut R) -> Option<f64> {
    let mut riff = [0u8; 12];
    reader.read_exact(&mut riff).ok()?;
    if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
        return None;
    }

    let mut byte_rate: Option<u32> = None;
    loop {
        let mut header = [0u8; 8];
        reader.read_exact(&mut header).ok()?;
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        match &header[0..4] {
            b"fmt " => {
                let mut fmt = vec![0u8; size as usize];
                reader.read_exact(&mut fmt).ok()?;
                if fmt.len() < 12 {
                    return None;
                }
                byte_rate = Some(u32::from_le_bytes([fmt[8], fmt[9], fmt[10], fmt[11]]));
                if size % 2 == 1 {
                    reader.seek(SeekFrom::Current(1)).ok()?;
                }
            }
            b"data" => {
                let rate = byte_rate.filter(|r| *r > 0)?;
                return Some(size as f64 / rate as f64);
            }
            _ => {
                let skip = size as i64 + (size % 2) as i64;
                reader.seek(SeekFrom::Current(skip)).ok()?;
            }
        }
    }
}

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct DriftConfig {
    /// Bytes read per step.
    pub chunk_size: usize,
    /// Progress notification granularity in percent of bytes.
    pub notify_step_pct: u32,
    /// Relative duration difference that triggers a correction.
    pub threshold_ratio: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            notify_step_pct: 10,
            threshold_ratio: MATERIAL_DRIFT_RATIO,
        }
    }
}

/// Coarse progress of a frame scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanProgress {
    pub percent: u32,
    pub frames_so_far: u64,
    pub bytes_read: u64,
    pub total_bytes: u64,
}

/// Result of a drift scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftReport {
    pub nominal_fps: f64,
    /// Rate to feed the transcoder as input frame rate.
    pub effective_fps: f64,
    /// Counted frames; `None` when the scan was not needed.
    pub frame_count: Option<u64>,
    pub audio_secs: Option<f64>,
    /// True when `effective_fps` differs from `nominal_fps`.
    pub adjusted: bool,
}

impl DriftReport {
    fn passthrough(nominal_fps: f64) -> Self {
        Self {
            nominal_fps,
            effective_fps: nominal_fps,
            frame_count: None,
            audio_secs: None,
            adjusted: false,
        }
    }

    /// Video duration at the nominal rate, when frames were counted.
    pub fn video_secs(&self) -> Option<f64> {
        self.frame_count.map(|n| n as f64 / self.nominal_fps)
    }
}

/// Corrected input rate for `frames` spread over `audio_secs`, or `None`
/// when the nominal rate is already within `threshold_ratio`.
pub fn corrected_rate(
    frames: u64,
    audio_secs: f64,
    nominal_fps: f64,
    threshold_ratio: f64,
) -> Option<f64> {
    if frames == 0 || audio_secs <= 0.0 || nominal_fps <= 0.0 {
        return None;
    }
    let video_secs = frames as f64 / nominal_fps;
    let drift = (video_secs - audio_secs).abs() / audio_secs;
    (drift > threshold_ratio).then(|| frames as f64 / audio_secs)
}

/// The drift scanner.
#[derive(Debug, Clone, Default)]
pub struct DriftScanner {
    config: DriftConfig,
}

impl DriftScanner {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::default()
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Count frame-start markers in `path`.
    ///
    /// Fewer than two markers means the file holds no decodable video.
    pub fn count_frames(
        &self,
        path: &Path,
        cancel: &CancelFlag,
        mut on_progress: impl FnMut(ScanProgress),
    ) -> Result<u64, ScanError> {
        let io_err = |source| ScanError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(io_err)?;
        let total_bytes = file.metadata().map_err(io_err)?.len();
        if total_bytes == 0 {
            return Err(ScanError::Empty {
                path: path.to_path_buf(),
            });
        }

        tracing::info!(
            path = %path.display(),
            size_gb = total_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            "Counting frames for audio sync"
        );

        let mut buf = vec![0u8; self.config.chunk_size.max(2)];
        let mut notifier = StepNotifier::new(self.config.notify_step_pct);
        let mut markers: u64 = 0;
        let mut bytes_read: u64 = 0;
        let mut prev_last: Option<u8> = None;

        loop {
            if cancel.is_cancelled() {
                tracing::info!(path = %path.display(), "Frame scan cancelled");
                return Err(ScanError::Cancelled);
            }
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_err(e)),
            };
            let chunk = &buf[..n];

            if prev_last == Some(SOI_MARKER[0]) && chunk[0] == SOI_MARKER[1] {
                markers += 1;
            }
            markers += count_markers(chunk);
            prev_last = chunk.last().copied();
            bytes_read += n as u64;

            if let Some(percent) = notifier.should_notify(bytes_read, total_bytes) {
                tracing::debug!(percent, frames = markers, "Frame scan progress");
                on_progress(ScanProgress {
                    percent,
                    frames_so_far: markers,
                    bytes_read,
                    total_bytes,
                });
            }
        }

        if markers < 2 {
            return Err(ScanError::NoDecodableContent {
                path: path.to_path_buf(),
                markers,
            });
        }
        tracing::info!(frames = markers, "Frame scan complete");
        Ok(markers)
    }

    /// Derive the input frame rate for `video`.
    ///
    /// Without paired audio, or when the audio duration is unknown, the
    /// nominal rate passes through unchanged and the video is not read.
    pub fn scan(
        &self,
        video: &Path,
        audio: Option<&Path>,
        nominal_fps: f64,
        probe: &dyn DurationProbe,
        cancel: &CancelFlag,
        on_progress: impl FnMut(ScanProgress),
    ) -> Result<DriftReport, ScanError> {
        let Some(audio) = audio else {
            tracing::debug!(video = %video.display(), "No paired audio; keeping nominal rate");
            return Ok(DriftReport::passthrough(nominal_fps));
        };
        let Some(audio_secs) = probe.duration_secs(audio).filter(|d| *d > 0.0) else {
            tracing::warn!(audio = %audio.display(), "Audio duration unknown; keeping nominal rate");
            return Ok(DriftReport::passthrough(nominal_fps));
        };

        let frames = self.count_frames(video, cancel, on_progress)?;
        let corrected = corrected_rate(frames, audio_secs, nominal_fps, self.config.threshold_ratio);

        let report = DriftReport {
            nominal_fps,
            effective_fps: corrected.unwrap_or(nominal_fps),
            frame_count: Some(frames),
            audio_secs: Some(audio_secs),
            adjusted: corrected.is_some(),
        };

        if report.adjusted {
            tracing::info!(
                frames,
                audio_secs,
                video_secs = report.video_secs().unwrap_or_default(),
                nominal_fps,
                effective_fps = report.effective_fps,
                "Frame rate adjusted for audio sync"
            );
        } else {
            tracing::info!(frames, audio_secs, "Audio sync within tolerance");
        }
        Ok(report)
    }
}

fn count_markers(chunk: &[u8]) -> u64 {
    chunk.windows(2).filter(|w| *w == SOI_MARKER).count() as u64
}
