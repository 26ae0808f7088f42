//! Publish collaborator: handing finished videos to an upload target.
//!
//! Authentication and the upload transport belong to the uploader; the
//! pipeline supplies a file, a title and a playlist name and gets back the
//! remote video id.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use camreel_common::CamreelError;
use camreel_transcode::publish_copy_path;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("No uploader command configured")]
    NotConfigured,

    #[error("Failed to launch uploader {program}: {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },

    #[error("Uploader exited with {exit_code:?}: {message}")]
    Rejected {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Uploader printed no video id")]
    MissingId,
}

impl From<PublishError> for CamreelError {
    fn from(err: PublishError) -> Self {
        CamreelError::publish(err.to_string())
    }
}

/// Uploads one file.
///
/// The uploader resolves playlists by name: an exact match is reused,
/// otherwise a new unlisted playlist is created.
pub trait Publisher: Send + Sync {
    /// Upload `file` titled `title`, adding it to `playlist` when the name
    /// is non-empty. Returns the remote video id.
    fn publish(&self, file: &Path, title: &str, playlist: &str) -> Result<String, PublishError>;
}

/// File to upload for a finished output: the publish copy when it exists.
pub fn upload_target(output: &Path) -> PathBuf {
    let copy = publish_copy_path(output);
    if copy.is_file() {
        copy
    } else {
        output.to_path_buf()
    }
}

/// Title to publish under; falls back to the output's file stem.
pub fn effective_title(title: &str, output: &Path) -> String {
    if title.trim().is_empty() {
        output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        title.to_string()
    }
}

/// Runs an external uploader.
///
/// The command is invoked with its configured arguments followed by the
/// file, the title and the playlist name. The last non-empty line on stdout
/// is the remote video id.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    command: Vec<String>,
}

impl CommandPublisher {
    pub fn new(command: Vec<String>) -> Result<Self, PublishError> {
        if command.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(PublishError::NotConfigured);
        }
        Ok(Self { command })
    }
}

impl Publisher for CommandPublisher {
    fn publish(&self, file: &Path, title: &str, playlist: &str) -> Result<String, PublishError> {
        let (program, fixed) = self
            .command
            .split_first()
            .ok_or(PublishError::NotConfigured)?;

        tracing::info!(file = %file.display(), title = %title, playlist = %playlist, "Publishing");
        let output = Command::new(program)
            .args(fixed)
            .arg(file)
            .arg(title)
            .arg(playlist)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| PublishError::Launch {
                program: program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostic")
                .trim()
                .to_string();
            return Err(PublishError::Rejected {
                exit_code: output.status.code(),
                message,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or(PublishError::MissingId)?
            .to_string();
        tracing::info!(file = %file.display(), remote_id = %id, "Published");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_title_defaults_to_stem() {
        let out = Path::new("/v/match_1.mp4");
        assert_eq!(effective_title("", out), "match_1");
        assert_eq!(effective_title("Final", out), "Final");
    }

    #[test]
    fn test_upload_target_prefers_publish_copy() {
        let dir = std::env::temp_dir().join(format!("camreel_publish_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let output = dir.join("game.mp4");
        std::fs::write(&output, b"v").unwrap();
        assert_eq!(upload_target(&output), output);
        std::fs::write(dir.join("game_youtube.mp4"), b"v").unwrap();
        assert_eq!(upload_target(&output), dir.join("game_youtube.mp4"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_empty_command_is_not_configured() {
        assert!(matches!(
            CommandPublisher::new(vec![]),
            Err(PublishError::NotConfigured)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_publisher_reads_last_line() {
        let publisher = CommandPublisher::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"echo "uploading $1 as $2 into $3"; echo; echo "vid-42""#.to_string(),
            "sh".to_string(),
        ])
        .unwrap();
        let id = publisher
            .publish(Path::new("/v/game.mp4"), "Game", "Season")
            .unwrap();
        assert_eq!(id, "vid-42");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_publisher_hands_playlist_name_to_uploader() {
        // Echo the playlist argument back as the id.
        let publisher = CommandPublisher::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"echo "[$3]""#.to_string(),
            "sh".to_string(),
        ])
        .unwrap();
        let id = publisher
            .publish(Path::new("/v/game.mp4"), "Game", "Season 2024")
            .unwrap();
        assert_eq!(id, "[Season 2024]");
        let id = publisher
            .publish(Path::new("/v/game.mp4"), "Game", "")
            .unwrap();
        assert_eq!(id, "[]");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_publisher_failure() {
        let publisher = CommandPublisher::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo 'quota exceeded' >&2; exit 4".to_string(),
            "sh".to_string(),
        ])
        .unwrap();
        match publisher.publish(Path::new("/v/game.mp4"), "Game", "") {
            Err(PublishError::Rejected { exit_code, message }) => {
                assert_eq!(exit_code, Some(4));
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_command_publisher_without_id() {
        let publisher = CommandPublisher::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "exit 0".to_string(),
        ])
        .unwrap();
        assert!(matches!(
            publisher.publish(Path::new("/v/a.mp4"), "A", ""),
            Err(PublishError::MissingId)
        ));
    }
}
