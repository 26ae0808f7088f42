//! Error types shared across camreel crates.

use std::path::PathBuf;

/// Top-level error type for camreel operations.
///
/// Stage-local failures are recorded on the owning job; they never cross job
/// boundaries. Cancellation travels through the same channel as
/// [`CamreelError::Cancelled`] but is not treated as a failure.
#[derive(Debug, thiserror::Error)]
pub enum CamreelError {
    #[error("Hardware encoding unavailable ({step}): {message}")]
    Probe {
        step: String,
        message: String,
        hint: Option<String>,
    },

    #[error("Fetch from {source_name} failed: {message}")]
    Fetch {
        source_name: String,
        message: String,
    },

    #[error("Frame scan of {} failed: {message}", path.display())]
    Scan { path: PathBuf, message: String },

    #[error("Transcoder exited with {}: {diagnostic}", exit_label(*exit_code))]
    EncodeProcess {
        exit_code: Option<i32>,
        diagnostic: String,
    },

    #[error("Invalid configuration field `{field}`: {message}")]
    Config { field: String, message: String },

    #[error("Publish failed: {message}")]
    Publish { message: String },

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("File not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using CamreelError.
pub type CamreelResult<T> = Result<T, CamreelError>;

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

impl CamreelError {
    pub fn probe(
        step: impl Into<String>,
        message: impl Into<String>,
        hint: Option<String>,
    ) -> Self {
        Self::Probe {
            step: step.into(),
            message: message.into(),
            hint,
        }
    }

    pub fn fetch(source_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            source_name: source_name.into(),
            message: msg.into(),
        }
    }

    pub fn scan(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Scan {
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn encode_process(exit_code: Option<i32>, diagnostic: impl Into<String>) -> Self {
        Self::EncodeProcess {
            exit_code,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn config(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: msg.into(),
        }
    }

    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish {
            message: msg.into(),
        }
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    /// Whether this value is the cooperative cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A short remediation hint for the user, where one applies.
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Probe { hint, .. } => hint.clone(),
            Self::Fetch { .. } => {
                Some("Check the camera address, credentials, and network link".to_string())
            }
            Self::Scan { .. } => Some(
                "The recording looks truncated or corrupt; re-fetch it or disable audio sync"
                    .to_string(),
            ),
            Self::EncodeProcess { .. } => Some(
                "Inspect the transcoder output above; try the software encoder (libx264)"
                    .to_string(),
            ),
            Self::Config { .. } => Some("The documented default was used instead".to_string()),
            Self::FileNotFound { .. } => Some("Remove the job or restore the file".to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_process_message_includes_tail() {
        let err = CamreelError::encode_process(Some(1), "Unknown encoder 'foo'");
        let msg = err.to_string();
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains("Unknown encoder 'foo'"));
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_cancellation_is_distinguished() {
        assert!(CamreelError::Cancelled.is_cancellation());
        assert!(!CamreelError::queue("x").is_cancellation());
    }

    #[test]
    fn test_signal_exit_label() {
        let err = CamreelError::encode_process(None, "");
        assert!(err.to_string().contains("terminated by signal"));
    }
}
