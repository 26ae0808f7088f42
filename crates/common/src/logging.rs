//! Logging and tracing initialization.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the tracing subscriber with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level. With `file` set,
/// lines are appended there instead of stderr; a file that cannot be opened
/// falls back to stderr. Returns false when a global subscriber was already
/// installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let (writer, to_file, open_error) = make_writer(config.file.as_ref());

    let installed = if config.json {
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber).is_ok()
    } else {
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(!to_file)
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber).is_ok()
    };

    if let Some((path, error)) = open_error {
        tracing::warn!(path = %path.display(), %error, "Cannot open log file, logging to stderr");
    }
    installed
}

/// Initialize logging with defaults (useful for tests and quick scripts).
pub fn init_default_logging() {
    init_logging(&LoggingConfig::default());
}

fn make_writer(
    file: Option<&PathBuf>,
) -> (BoxMakeWriter, bool, Option<(PathBuf, std::io::Error)>) {
    let Some(path) = file else {
        return (BoxMakeWriter::new(std::io::stderr), false, None);
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        let _ = std::fs::create_dir_all(dir);
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => (BoxMakeWriter::new(Arc::new(f)), true, None),
        Err(e) => (
            BoxMakeWriter::new(std::io::stderr),
            false,
            Some((path.clone(), e)),
        ),
    }
}
