//! Count frames in a raw recording and derive its drift-corrected rate.

use std::io::Write;
use std::path::PathBuf;

use camreel_common::{AppConfig, CancelFlag};
use camreel_processing_core::{find_audio, DriftScanner};
use camreel_transcode::FfprobeDurationProbe;

pub fn run(
    config: &AppConfig,
    path: PathBuf,
    fps: Option<f64>,
    audio: Option<PathBuf>,
) -> anyhow::Result<()> {
    if !path.is_file() {
        anyhow::bail!("Recording not found: {}", path.display());
    }

    let nominal_fps = fps.unwrap_or(config.video.fps as f64);
    let audio = audio.or_else(|| find_audio(&path, &config.audio.audio_suffix));

    println!("Drift scan: {}", path.display());
    println!("  Nominal rate: {nominal_fps} fps");
    match &audio {
        Some(a) => println!("  Audio: {}", a.display()),
        None => println!("  Audio: none (nominal rate is kept)"),
    }

    let probe = FfprobeDurationProbe::new(&config.tools.ffprobe);
    let report = DriftScanner::with_defaults().scan(
        &path,
        audio.as_deref(),
        nominal_fps,
        &probe,
        &CancelFlag::new(),
        |p| {
            print!(
                "\r  Progress: {}% ({} frames, {}/{} bytes)  ",
                p.percent, p.frames_so_far, p.bytes_read, p.total_bytes
            );
            let _ = std::io::stdout().flush();
        },
    )?;
    println!();

    if let Some(frames) = report.frame_count {
        println!("  Frames: {frames}");
    }
    if let Some(video_secs) = report.video_secs() {
        println!("  Video duration at nominal rate: {video_secs:.2}s");
    }
    if let Some(audio_secs) = report.audio_secs {
        println!("  Audio duration: {audio_secs:.2}s");
    }
    if report.adjusted {
        println!(
            "[OK] Corrected rate: {:.4} fps (was {nominal_fps})",
            report.effective_fps
        );
    } else {
        println!("[OK] Nominal rate kept: {} fps", report.effective_fps);
    }

    Ok(())
}
