//! camreel CLI: command-line interface for the recording pipeline.
//!
//! Usage:
//!   camreel run [INPUTS]...      Transcode files and folders (optionally fetch first)
//!   camreel check                Probe hardware encoding support
//!   camreel scan <FILE>          Count frames and derive the drift-corrected rate
//!   camreel plan <FILES>...      Show how multi-part recordings would be merged
//!   camreel profiles             List encoding profiles

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "camreel",
    about = "Fetch, transcode, merge, and publish camera recordings",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the standard location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue recordings and run the pipeline until the queue is idle
    Run {
        /// Recordings or folders of recordings to transcode
        inputs: Vec<PathBuf>,

        /// Fetch new recordings from every configured camera first
        #[arg(long)]
        download: bool,

        /// Restore a saved queue before adding inputs
        #[arg(long)]
        queue: Option<PathBuf>,

        /// Save the queue here when the run ends
        #[arg(long)]
        save_queue: Option<PathBuf>,

        /// Encoding profile: analysis|upload|custom
        #[arg(long)]
        profile: Option<String>,

        /// Encoder override (e.g. libx264, h264_nvenc, auto)
        #[arg(long)]
        encoder: Option<String>,

        /// Quality override (CRF / CQ)
        #[arg(long)]
        crf: Option<u8>,

        /// Re-encode outputs that already exist
        #[arg(long)]
        overwrite: bool,

        /// Correct frame-drop drift against the paired audio
        #[arg(long)]
        audio_sync: bool,

        /// Merge multi-part recordings after the batch
        #[arg(long)]
        merge: bool,

        /// Upload finished files through the configured uploader
        #[arg(long)]
        upload: bool,

        /// Publish title for queued jobs
        #[arg(long, default_value = "")]
        title: String,

        /// Playlist for queued jobs
        #[arg(long, default_value = "")]
        playlist: String,
    },

    /// Check hardware encoding support
    Check,

    /// Count frames in a raw recording and report the corrected frame rate
    Scan {
        /// Raw MJPEG recording
        path: PathBuf,

        /// Nominal frame rate (defaults to the configured rate)
        #[arg(long)]
        fps: Option<f64>,

        /// Paired audio file (defaults to the WAV next to the recording)
        #[arg(long)]
        audio: Option<PathBuf>,
    },

    /// Show merge groups for a set of recordings
    Plan {
        /// Raw recordings
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// List encoding profiles and their defaults
    Profiles,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(camreel_common::config_file_path);
    let (config, issues) = camreel_common::AppConfig::read_lenient(&config_path);

    // Initialize logging
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    camreel_common::logging::init_logging(&logging);
    for issue in &issues {
        tracing::warn!(path = %config_path.display(), "Config field invalid: {issue}");
    }

    match cli.command {
        Commands::Run {
            inputs,
            download,
            queue,
            save_queue,
            profile,
            encoder,
            crf,
            overwrite,
            audio_sync,
            merge,
            upload,
            title,
            playlist,
        } => {
            let options = commands::run::RunOptions {
                inputs,
                download,
                queue,
                save_queue,
                profile,
                encoder,
                crf,
                overwrite,
                audio_sync,
                merge,
                upload,
                title,
                playlist,
            };
            commands::run::run(config, options).await
        }
        Commands::Check => commands::check::run(&config),
        Commands::Scan { path, fps, audio } => commands::scan::run(&config, path, fps, audio),
        Commands::Plan { paths, json } => commands::plan::run(&config, paths, json),
        Commands::Profiles => commands::profiles::run(&config),
    }
}
