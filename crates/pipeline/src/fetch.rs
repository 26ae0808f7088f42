//! Fetch collaborator: bringing camera recordings onto local disk.
//!
//! Only complete recordings (video and audio both present) are fetched.
//! Files already present with the remote size are not copied again, and a
//! copy is written under a `.part` name until it is complete, so a
//! half-transferred file is never mistaken for a recording.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use camreel_common::{CamreelError, CameraConfig, CancelFlag};
use camreel_job_model::has_raw_extension;
use serde::Serialize;

/// Copy buffer size; cancellation is checked between buffers.
const COPY_CHUNK: usize = 8 * 1024 * 1024;

/// Suffix of in-flight copies.
pub const PARTIAL_SUFFIX: &str = ".part";

/// One remote recording source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraSource {
    pub name: String,
    /// Directory holding the camera's recordings (mounted locally).
    pub remote_dir: PathBuf,
    /// Local directory recordings are copied into.
    pub destination: PathBuf,
    /// Remove the remote pair once the local copy is complete.
    pub delete_after_download: bool,
}

impl CameraSource {
    /// Source for `device` as configured, reading from its mount path when
    /// one is set and from `remote_path` otherwise.
    pub fn resolve(
        cameras: &CameraConfig,
        device: &str,
        remote_path: &str,
        destination: &Path,
    ) -> Self {
        let mount = cameras
            .devices
            .iter()
            .find(|d| d.name == device)
            .and_then(|d| d.mount_path.clone());
        Self {
            name: device.to_string(),
            remote_dir: mount.unwrap_or_else(|| PathBuf::from(remote_path)),
            destination: destination.to_path_buf(),
            delete_after_download: cameras.delete_after_download,
        }
    }
}

/// Byte progress of the file being fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchProgress {
    pub file: String,
    /// Zero-based index of the recording being fetched.
    pub recording: usize,
    pub recordings: usize,
    pub transferred: u64,
    pub total: u64,
}

impl FetchProgress {
    /// Progress across the whole source, counting each recording equally.
    pub fn fraction(&self) -> f64 {
        if self.recordings == 0 {
            return 0.0;
        }
        let within = if self.total > 0 {
            self.transferred as f64 / self.total as f64
        } else {
            0.0
        };
        ((self.recording as f64 + within) / self.recordings as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{source_name} is unreachable: {message}")]
    Unreachable { source_name: String, message: String },

    #[error("Authentication to {source_name} failed: {message}")]
    Auth { source_name: String, message: String },

    #[error("Failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Fetch cancelled")]
    Cancelled,
}

impl From<FetchError> for CamreelError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => CamreelError::Cancelled,
            FetchError::Unreachable { ref source_name, .. }
            | FetchError::Auth { ref source_name, .. } => {
                CamreelError::fetch(source_name.clone(), err.to_string())
            }
            FetchError::Io { .. } => CamreelError::fetch("local disk", err.to_string()),
        }
    }
}

/// Retrieves recordings from one source.
pub trait Fetcher: Send + Sync {
    /// Fetch every complete recording of `source`; returns the local video
    /// files in name order.
    fn fetch(
        &self,
        source: &CameraSource,
        cancel: &CancelFlag,
        on_progress: &mut dyn FnMut(FetchProgress),
    ) -> Result<Vec<PathBuf>, FetchError>;
}

/// Copies recordings out of a locally mounted camera directory.
#[derive(Debug, Clone, Default)]
pub struct DirectoryFetcher;

impl DirectoryFetcher {
    pub fn new() -> Self {
        Self
    }
}

/// A remote recording with both halves present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecording {
    pub base: String,
    /// File names as they appear remotely; local copies keep them.
    pub video: String,
    pub audio: String,
}

/// Recordings in `dir` that have both a raw video file (`.mjpg` or `.mjpeg`)
/// and a `.wav` file, sorted by base name.
pub fn complete_recordings(dir: &Path) -> std::io::Result<Vec<RemoteRecording>> {
    let mut videos: BTreeMap<String, String> = BTreeMap::new();
    let mut audio: BTreeMap<String, String> = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let (Some(stem), Some(name)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.file_name().and_then(|n| n.to_str()),
        ) else {
            continue;
        };
        let wav = path.extension().and_then(|e| e.to_str()) == Some("wav");
        let slot = if has_raw_extension(&path) {
            &mut videos
        } else if wav {
            &mut audio
        } else {
            continue;
        };
        // `a.mjpg` and `a.mjpeg` side by side: the lower name wins.
        slot.entry(stem.to_string())
            .and_modify(|n: &mut String| {
                if name < n.as_str() {
                    *n = name.to_string();
                }
            })
            .or_insert_with(|| name.to_string());
    }
    Ok(videos
        .into_iter()
        .filter_map(|(base, video)| {
            let audio = audio.remove(&base)?;
            Some(RemoteRecording { base, video, audio })
        })
        .collect())
}

fn same_size(local: &Path, remote: &Path) -> bool {
    match (std::fs::metadata(local), std::fs::metadata(remote)) {
        (Ok(l), Ok(r)) => l.len() == r.len(),
        _ => false,
    }
}

fn partial_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    local.with_file_name(name)
}

/// Copy `remote` to `local` through a `.part` file.
fn copy_file(
    remote: &Path,
    local: &Path,
    (recording, recordings): (usize, usize),
    cancel: &CancelFlag,
    on_progress: &mut dyn FnMut(FetchProgress),
) -> Result<(), FetchError> {
    let part = partial_path(local);
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| FetchError::Io { path, source }
    };

    let result = (|| -> Result<(), FetchError> {
        let mut reader = File::open(remote).map_err(io_err(remote))?;
        let total = reader.metadata().map(|m| m.len()).unwrap_or(0);
        let mut writer = File::create(&part).map_err(io_err(&part))?;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut transferred = 0u64;
        let file = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let n = reader.read(&mut buf).map_err(io_err(remote))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).map_err(io_err(&part))?;
            transferred += n as u64;
            on_progress(FetchProgress {
                file: file.clone(),
                recording,
                recordings,
                transferred,
                total,
            });
        }
        writer.sync_all().map_err(io_err(&part))?;
        std::fs::rename(&part, local).map_err(io_err(local))
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&part);
    }
    result
}

impl Fetcher for DirectoryFetcher {
    fn fetch(
        &self,
        source: &CameraSource,
        cancel: &CancelFlag,
        on_progress: &mut dyn FnMut(FetchProgress),
    ) -> Result<Vec<PathBuf>, FetchError> {
        let found = complete_recordings(&source.remote_dir).map_err(|e| FetchError::Unreachable {
            source_name: source.name.clone(),
            message: format!("cannot list {}: {e}", source.remote_dir.display()),
        })?;
        std::fs::create_dir_all(&source.destination).map_err(|e| FetchError::Io {
            path: source.destination.clone(),
            source: e,
        })?;
        tracing::info!(source = %source.name, recordings = found.len(), "Complete recordings found");

        let recordings = found.len();
        let mut fetched = Vec::with_capacity(recordings);
        for (index, recording) in found.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let base = &recording.base;
            let remote_video = source.remote_dir.join(&recording.video);
            let remote_audio = source.remote_dir.join(&recording.audio);
            let local_video = source.destination.join(&recording.video);
            let local_audio = source.destination.join(&recording.audio);

            if same_size(&local_video, &remote_video) && same_size(&local_audio, &remote_audio) {
                tracing::debug!(source = %source.name, recording = %base, "Already present, skipping copy");
            } else {
                let position = (index, recordings);
                let copied =
                    copy_file(&remote_video, &local_video, position, cancel, on_progress).and_then(
                        |_| copy_file(&remote_audio, &local_audio, position, cancel, on_progress),
                    );
                match copied {
                    Ok(()) => tracing::info!(source = %source.name, recording = %base, "Recording fetched"),
                    Err(FetchError::Cancelled) => {
                        let _ = std::fs::remove_file(&local_video);
                        return Err(FetchError::Cancelled);
                    }
                    Err(e) => {
                        tracing::warn!(source = %source.name, recording = %base, error = %e, "Recording fetch failed");
                        let _ = std::fs::remove_file(&local_video);
                        let _ = std::fs::remove_file(&local_audio);
                        continue;
                    }
                }
            }

            if source.delete_after_download {
                for remote in [&remote_video, &remote_audio] {
                    if let Err(e) = std::fs::remove_file(remote) {
                        tracing::warn!(file = %remote.display(), error = %e, "Failed to delete remote file");
                    }
                }
            }
            fetched.push(local_video);
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("camreel_fetch_{}_{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn source(root: &Path, name: &str) -> CameraSource {
        CameraSource {
            name: name.to_string(),
            remote_dir: root.join("remote"),
            destination: root.join("local").join(name),
            delete_after_download: false,
        }
    }

    #[test]
    fn test_only_complete_pairs_are_fetched() {
        let root = temp_dir("pairs");
        let remote = root.join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(remote.join("a.mjpg"), b"video-a").unwrap();
        std::fs::write(remote.join("a.wav"), b"audio-a").unwrap();
        std::fs::write(remote.join("b.mjpg"), b"video-b").unwrap();
        std::fs::write(remote.join("c.wav"), b"audio-c").unwrap();

        let src = source(&root, "cam1");
        let files = DirectoryFetcher::new()
            .fetch(&src, &CancelFlag::new(), &mut |_| {})
            .unwrap();

        assert_eq!(files, vec![src.destination.join("a.mjpg")]);
        assert_eq!(std::fs::read(src.destination.join("a.wav")).unwrap(), b"audio-a");
        assert!(!src.destination.join("b.mjpg").exists());
        assert!(!src.destination.join("a.mjpg.part").exists());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_mjpeg_pairs_keep_their_names() {
        let root = temp_dir("mjpeg");
        let remote = root.join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(remote.join("game.mjpeg"), b"video").unwrap();
        std::fs::write(remote.join("game.wav"), b"audio").unwrap();
        std::fs::write(remote.join("solo.MJPEG"), b"video").unwrap();

        assert_eq!(
            complete_recordings(&remote).unwrap(),
            vec![RemoteRecording {
                base: "game".to_string(),
                video: "game.mjpeg".to_string(),
                audio: "game.wav".to_string(),
            }]
        );

        let src = source(&root, "cam1");
        let files = DirectoryFetcher::new()
            .fetch(&src, &CancelFlag::new(), &mut |_| {})
            .unwrap();
        assert_eq!(files, vec![src.destination.join("game.mjpeg")]);
        assert_eq!(std::fs::read(src.destination.join("game.wav")).unwrap(), b"audio");
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_existing_same_size_files_are_not_copied() {
        let root = temp_dir("sizes");
        let remote = root.join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(remote.join("a.mjpg"), b"1234").unwrap();
        std::fs::write(remote.join("a.wav"), b"56").unwrap();

        let src = source(&root, "cam1");
        std::fs::create_dir_all(&src.destination).unwrap();
        // Same sizes, different bytes: proves the copy was skipped.
        std::fs::write(src.destination.join("a.mjpg"), b"abcd").unwrap();
        std::fs::write(src.destination.join("a.wav"), b"ef").unwrap();

        let mut progress = 0;
        let files = DirectoryFetcher::new()
            .fetch(&src, &CancelFlag::new(), &mut |_| progress += 1)
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(progress, 0);
        assert_eq!(std::fs::read(src.destination.join("a.mjpg")).unwrap(), b"abcd");

        // A truncated local copy is replaced.
        std::fs::write(src.destination.join("a.mjpg"), b"ab").unwrap();
        DirectoryFetcher::new()
            .fetch(&src, &CancelFlag::new(), &mut |_| {})
            .unwrap();
        assert_eq!(std::fs::read(src.destination.join("a.mjpg")).unwrap(), b"1234");
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_delete_after_download() {
        let root = temp_dir("delete");
        let remote = root.join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(remote.join("a.mjpg"), b"v").unwrap();
        std::fs::write(remote.join("a.wav"), b"a").unwrap();

        let src = CameraSource {
            delete_after_download: true,
            ..source(&root, "cam1")
        };
        DirectoryFetcher::new()
            .fetch(&src, &CancelFlag::new(), &mut |_| {})
            .unwrap();
        assert!(!remote.join("a.mjpg").exists());
        assert!(src.destination.join("a.wav").exists());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_missing_remote_dir_is_unreachable() {
        let root = temp_dir("unreachable");
        let err = DirectoryFetcher::new()
            .fetch(&source(&root, "cam9"), &CancelFlag::new(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, FetchError::Unreachable { .. }));
        let camreel: CamreelError = err.into();
        assert!(camreel.to_string().contains("cam9"));
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_cancelled_fetch_leaves_no_partial_files() {
        let root = temp_dir("cancel");
        let remote = root.join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(remote.join("a.mjpg"), b"video").unwrap();
        std::fs::write(remote.join("a.wav"), b"audio").unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let src = source(&root, "cam1");
        let err = DirectoryFetcher::new()
            .fetch(&src, &cancel, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert!(!src.destination.join("a.mjpg").exists());
        assert!(!src.destination.join("a.mjpg.part").exists());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_progress_fraction_spans_recordings() {
        let progress = FetchProgress {
            file: "b.mjpg".to_string(),
            recording: 1,
            recordings: 4,
            transferred: 50,
            total: 100,
        };
        assert!((progress.fraction() - 0.375).abs() < 1e-12);
    }

    #[test]
    fn test_resolve_prefers_mount_path() {
        let cameras = CameraConfig {
            devices: vec![camreel_common::CameraDevice {
                name: "cam1".to_string(),
                address: "10.0.0.11".to_string(),
                port: 22,
                username: String::new(),
                mount_path: Some(PathBuf::from("/mnt/cam1")),
            }],
            ..CameraConfig::default()
        };
        let src = CameraSource::resolve(&cameras, "cam1", "/recordings", Path::new("/dst/cam1"));
        assert_eq!(src.remote_dir, PathBuf::from("/mnt/cam1"));
        let other = CameraSource::resolve(&cameras, "cam2", "/recordings", Path::new("/dst/cam2"));
        assert_eq!(other.remote_dir, PathBuf::from("/recordings"));
    }
}
