//! Check hardware encoding support.

use camreel_common::AppConfig;
use camreel_transcode::{CapabilityProber, ProbeStep};

pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    println!("camreel System Check");
    println!("{}", "=".repeat(50));
    println!("  ffmpeg:     {}", config.tools.ffmpeg.display());
    println!("  ffprobe:    {}", config.tools.ffprobe.display());
    println!("  nvidia-smi: {}", config.tools.nvidia_smi.display());
    println!();

    let report = CapabilityProber::new(config.tools.clone()).probe();

    for line in &report.details {
        println!("  {line}");
    }
    println!();

    if report.ready {
        println!("[OK] {}", report.summary);
        println!("     Encoder setting 'auto' will use hardware encoding for MP4 output.");
        return Ok(());
    }

    let step = report.failed_step.unwrap_or(ProbeStep::Hardware);
    println!(
        "[WARN] Failed at {step} of {}: {}",
        ProbeStep::ALL.len(),
        report.message.as_deref().unwrap_or(&report.summary)
    );
    if let Some(hint) = &report.hint {
        println!("       Fix: {hint}");
    }
    println!("       Encoder setting 'auto' will fall back to libx264.");

    Ok(())
}
