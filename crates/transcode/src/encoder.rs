//! Encoder selection and encoder argument construction.

use camreel_common::{EncoderSetting, OutputFormat, VideoConfig};
use serde::Serialize;

use crate::probe::{CapabilityReport, HARDWARE_ENCODER, SOFTWARE_ENCODER};

/// The encoder a job will use and its ffmpeg arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncoderChoice {
    pub encoder: String,
    /// Video codec arguments, output rate included.
    pub args: Vec<String>,
    /// Hardware acceleration is in use.
    pub hardware_used: bool,
    /// Set when `auto` wanted hardware but fell back.
    pub fallback_notice: Option<String>,
}

/// NVENC preset for an x264 preset name (`p1` fastest, `p7` best).
pub fn nvenc_preset(x264_preset: &str) -> &'static str {
    match x264_preset {
        "ultrafast" => "p1",
        "superfast" => "p2",
        "veryfast" => "p3",
        "faster" | "fast" => "p4",
        "medium" => "p5",
        "slow" => "p6",
        "slower" | "veryslow" => "p7",
        _ => "p5",
    }
}

/// Frame rate as ffmpeg expects it; fractional rates keep six decimals.
pub fn format_rate(fps: f64) -> String {
    if fps.fract() == 0.0 && fps.is_finite() {
        format!("{}", fps as u64)
    } else {
        format!("{fps:.6}")
    }
}

/// Video codec arguments for `encoder`.
///
/// `crf` is the CQ value for NVENC. Lossless x264 uses `slow` and CRF 0.
pub fn build_encoder_args(
    encoder: &str,
    preset: &str,
    crf: u8,
    lossless: bool,
    fps: f64,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-c:v".into(), encoder.into()];
    if encoder == HARDWARE_ENCODER {
        args.extend(["-preset".into(), nvenc_preset(preset).into()]);
        if lossless {
            args.extend(["-tune".into(), "lossless".into()]);
        } else {
            args.extend([
                "-tune".into(),
                "hq".into(),
                "-rc".into(),
                "vbr".into(),
                "-cq".into(),
                crf.to_string(),
                "-b:v".into(),
                "0".into(),
            ]);
        }
    } else {
        let (preset, crf) = if lossless { ("slow", 0) } else { (preset, crf) };
        args.extend([
            "-preset".into(),
            preset.into(),
            "-crf".into(),
            crf.to_string(),
        ]);
    }
    args.extend([
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-r".into(),
        format_rate(fps),
    ]);
    args
}

/// Intra-frame MJPEG arguments for AVI output.
pub fn mjpeg_args(fps: f64) -> Vec<String> {
    vec![
        "-c:v".into(),
        "mjpeg".into(),
        "-q:v".into(),
        "2".into(),
        "-r".into(),
        format_rate(fps),
    ]
}

/// Resolve at the configured nominal rate.
pub fn resolve(video: &VideoConfig, report: &CapabilityReport) -> EncoderChoice {
    resolve_with_rate(video, report, video.fps as f64)
}

/// Pick the encoder for `video` given the probe result.
///
/// `auto` uses hardware only when the report is ready; a named encoder is
/// used as given, with no fallback. The result depends on nothing but the
/// inputs.
pub fn resolve_with_rate(
    video: &VideoConfig,
    report: &CapabilityReport,
    output_fps: f64,
) -> EncoderChoice {
    if video.output_format == OutputFormat::Avi {
        return EncoderChoice {
            encoder: "mjpeg".to_string(),
            args: mjpeg_args(video.fps as f64),
            hardware_used: false,
            fallback_notice: None,
        };
    }

    let (encoder, fallback_notice) = match &video.encoder {
        EncoderSetting::Auto if report.ready => (HARDWARE_ENCODER.to_string(), None),
        EncoderSetting::Auto => (
            SOFTWARE_ENCODER.to_string(),
            Some(format!(
                "{HARDWARE_ENCODER} unavailable: {}; falling back to {SOFTWARE_ENCODER} (CPU)",
                report.summary
            )),
        ),
        EncoderSetting::Named(name) => (name.clone(), None),
    };

    EncoderChoice {
        args: build_encoder_args(&encoder, &video.preset, video.crf, video.lossless, output_fps),
        hardware_used: encoder == HARDWARE_ENCODER,
        encoder,
        fallback_notice,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeStep;

    fn ready() -> CapabilityReport {
        CapabilityReport::ready_with("RTX 3060", "560.35")
    }

    fn not_ready() -> CapabilityReport {
        CapabilityReport::failed(ProbeStep::Hardware, "No NVIDIA GPU detected", None)
    }

    #[test]
    fn test_auto_with_ready_hardware() {
        let choice = resolve(&VideoConfig::default(), &ready());
        assert_eq!(choice.encoder, "h264_nvenc");
        assert!(choice.hardware_used);
        assert!(choice.fallback_notice.is_none());
    }

    #[test]
    fn test_auto_falls_back_with_notice() {
        let choice = resolve(&VideoConfig::default(), &not_ready());
        assert_eq!(choice.encoder, "libx264");
        assert!(!choice.hardware_used);
        let notice = choice.fallback_notice.unwrap();
        assert!(notice.contains("No NVIDIA GPU detected"));
    }

    #[test]
    fn test_named_encoder_used_unconditionally() {
        let video = VideoConfig {
            encoder: EncoderSetting::Named("libx264".to_string()),
            ..VideoConfig::default()
        };
        let choice = resolve(&video, &ready());
        assert_eq!(choice.encoder, "libx264");
        assert!(choice.fallback_notice.is_none());

        let video = VideoConfig {
            encoder: EncoderSetting::Named("h264_nvenc".to_string()),
            ..VideoConfig::default()
        };
        let choice = resolve(&video, &not_ready());
        assert_eq!(choice.encoder, "h264_nvenc");
        assert!(choice.fallback_notice.is_none());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let video = VideoConfig::default();
        assert_eq!(resolve(&video, &not_ready()), resolve(&video, &not_ready()));
    }

    #[test]
    fn test_nvenc_args() {
        let args = build_encoder_args("h264_nvenc", "slow", 19, false, 25.0);
        assert_eq!(
            args.join(" "),
            "-c:v h264_nvenc -preset p6 -tune hq -rc vbr -cq 19 -b:v 0 -pix_fmt yuv420p -r 25"
        );
        let lossless = build_encoder_args("h264_nvenc", "bogus", 19, true, 24.5);
        assert_eq!(
            lossless.join(" "),
            "-c:v h264_nvenc -preset p5 -tune lossless -pix_fmt yuv420p -r 24.500000"
        );
    }

    #[test]
    fn test_x264_args() {
        let args = build_encoder_args("libx264", "fast", 23, false, 25.0);
        assert_eq!(
            args.join(" "),
            "-c:v libx264 -preset fast -crf 23 -pix_fmt yuv420p -r 25"
        );
        let lossless = build_encoder_args("libx264", "fast", 23, true, 25.0);
        assert!(lossless.join(" ").contains("-preset slow -crf 0"));
    }

    #[test]
    fn test_avi_uses_mjpeg_at_nominal_rate() {
        let video = VideoConfig {
            output_format: OutputFormat::Avi,
            ..VideoConfig::default()
        };
        let choice = resolve_with_rate(&video, &ready(), 24.1);
        assert_eq!(choice.encoder, "mjpeg");
        assert_eq!(choice.args.join(" "), "-c:v mjpeg -q:v 2 -r 25");
    }
}
