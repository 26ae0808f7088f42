//! Locating the audio track recorded next to a raw video.

use std::path::{Path, PathBuf};

/// Find the WAV file paired with `video`.
///
/// Lookup order: `<stem><suffix>.wav` (when `suffix` is non-empty),
/// `<stem>.wav`, then the first `<stem>*.wav` by name.
pub fn find_audio(video: &Path, suffix: &str) -> Option<PathBuf> {
    let stem = video.file_stem()?.to_string_lossy().into_owned();
    let parent = match video.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if !suffix.is_empty() {
        let candidate = parent.join(format!("{stem}{suffix}.wav"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    let exact = parent.join(format!("{stem}.wav"));
    if exact.is_file() {
        return Some(exact);
    }

    let mut prefixed: Vec<PathBuf> = std::fs::read_dir(&parent)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension().and_then(|e| e.to_str()) == Some("wav")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&stem))
        })
        .collect();
    prefixed.sort();
    prefixed.into_iter().next()
}
