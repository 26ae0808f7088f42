//! Hardware encoder capability probing.
//!
//! Four ordered checks, stopping at the first failure:
//!
//! 1. **Hardware**: an NVIDIA GPU answers `nvidia-smi`.
//! 2. **Driver**: the driver is at least [`MIN_DRIVER_VERSION`].
//! 3. **Tool support**: `ffmpeg -encoders` lists `h264_nvenc`.
//! 4. **Test encode**: a one-frame synthetic encode succeeds.
//!
//! Probing only reads system state. The report is memoized by
//! [`CapabilityCache`] for the life of the process.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use camreel_common::{CamreelError, ToolPaths};
use serde::Serialize;

/// Hardware encoder used when the probe succeeds.
pub const HARDWARE_ENCODER: &str = "h264_nvenc";

/// Software encoder used otherwise.
pub const SOFTWARE_ENCODER: &str = "libx264";

/// Oldest driver whose NVENC API current ffmpeg builds accept.
pub const MIN_DRIVER_VERSION: (u32, u32) = (550, 54);

/// Synthetic source for the test encode. NVENC rejects frames much smaller
/// than 256x256.
const TEST_ENCODE_SOURCE: &str = "color=black:s=256x256:d=0.04:r=25";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One step of the capability diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStep {
    Hardware,
    Driver,
    ToolSupport,
    TestEncode,
}

impl ProbeStep {
    pub const ALL: [ProbeStep; 4] = [
        ProbeStep::Hardware,
        ProbeStep::Driver,
        ProbeStep::ToolSupport,
        ProbeStep::TestEncode,
    ];

    /// 1-based position in the diagnosis.
    pub fn number(self) -> usize {
        match self {
            ProbeStep::Hardware => 1,
            ProbeStep::Driver => 2,
            ProbeStep::ToolSupport => 3,
            ProbeStep::TestEncode => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProbeStep::Hardware => "GPU present",
            ProbeStep::Driver => "driver version",
            ProbeStep::ToolSupport => "ffmpeg NVENC support",
            ProbeStep::TestEncode => "test encode",
        }
    }
}

impl fmt::Display for ProbeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({})", self.number(), self.label())
    }
}

/// Outcome of a capability probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityReport {
    /// Hardware encoding is usable.
    pub ready: bool,
    pub gpu_name: Option<String>,
    pub driver_version: Option<String>,
    /// First failing step; `None` when ready.
    pub failed_step: Option<ProbeStep>,
    /// Why the failing step failed.
    pub message: Option<String>,
    /// What the user can do about it.
    pub hint: Option<String>,
    /// One-line summary for logs and notices.
    pub summary: String,
    /// Per-step diagnosis lines.
    pub details: Vec<String>,
}

impl CapabilityReport {
    /// A report for a usable GPU.
    pub fn ready_with(gpu_name: impl Into<String>, driver_version: impl Into<String>) -> Self {
        let gpu_name = gpu_name.into();
        Self {
            ready: true,
            summary: format!("GPU encoding available ({gpu_name})"),
            gpu_name: Some(gpu_name),
            driver_version: Some(driver_version.into()),
            failed_step: None,
            message: None,
            hint: None,
            details: Vec::new(),
        }
    }

    /// A report failing at `step`.
    pub fn failed(step: ProbeStep, message: impl Into<String>, hint: Option<String>) -> Self {
        let message = message.into();
        Self {
            ready: false,
            gpu_name: None,
            driver_version: None,
            failed_step: Some(step),
            summary: message.clone(),
            message: Some(message),
            hint,
            details: Vec::new(),
        }
    }

    /// Placeholder for runs whose encoder choice does not depend on the GPU
    /// (a named encoder, or AVI output).
    pub fn not_probed() -> Self {
        Self {
            ready: false,
            gpu_name: None,
            driver_version: None,
            failed_step: None,
            message: None,
            hint: None,
            summary: "hardware not probed".to_string(),
            details: Vec::new(),
        }
    }

    /// The failure as an error value, for callers that must not fall back.
    pub fn to_error(&self) -> Option<CamreelError> {
        let step = self.failed_step?;
        Some(CamreelError::probe(
            step.to_string(),
            self.message.clone().unwrap_or_default(),
            self.hint.clone(),
        ))
    }
}

/// Runs the four-step diagnosis.
#[derive(Debug, Clone)]
pub struct CapabilityProber {
    tools: ToolPaths,
    timeout: Duration,
}

impl CapabilityProber {
    pub fn new(tools: ToolPaths) -> Self {
        Self {
            tools,
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn probe(&self) -> CapabilityReport {
        let report = self.run_steps();
        if report.ready {
            tracing::info!(summary = %report.summary, "Hardware encoding available");
        } else {
            tracing::info!(
                step = ?report.failed_step,
                summary = %report.summary,
                "Hardware encoding unavailable"
            );
        }
        report
    }

    fn run_steps(&self) -> CapabilityReport {
        let mut details = Vec::new();

        // 1. GPU present
        let gpu = run_captured(
            Command::new(&self.tools.nvidia_smi).args([
                "--query-gpu=name,driver_version",
                "--format=csv,noheader,nounits",
            ]),
            self.timeout,
        )
        .filter(|o| o.status.success())
        .and_then(|o| parse_gpu_query(&String::from_utf8_lossy(&o.stdout)));
        let Some((gpu_name, driver)) = gpu else {
            details.push("✗ No NVIDIA GPU detected (nvidia-smi unavailable)".to_string());
            let mut report = CapabilityReport::failed(
                ProbeStep::Hardware,
                "No NVIDIA GPU detected, using CPU encoding",
                Some("Install an NVIDIA GPU driver that provides nvidia-smi, or select libx264".to_string()),
            );
            report.details = details;
            return report;
        };
        details.push(format!("✓ GPU detected: {gpu_name}"));
        details.push(format!("  Driver: {driver}"));

        let with_gpu = |mut report: CapabilityReport, details: Vec<String>| {
            report.gpu_name = Some(gpu_name.clone());
            report.driver_version = Some(driver.clone());
            report.details = details;
            report
        };

        // 2. Driver version
        let (min_major, min_minor) = MIN_DRIVER_VERSION;
        if !driver_supported(&driver) {
            details.push(format!(
                "✗ Driver too old: {driver} (at least {min_major}.{min_minor} required)"
            ));
            return with_gpu(
                CapabilityReport::failed(
                    ProbeStep::Driver,
                    format!(
                        "GPU present ({gpu_name}), but driver too old ({driver}, at least {min_major}.{min_minor} required)"
                    ),
                    Some(format!(
                        "Update the NVIDIA driver to {min_major}.{min_minor} or newer, e.g. `sudo apt install nvidia-driver-560`"
                    )),
                ),
                details,
            );
        }
        details.push(format!(
            "✓ Driver is recent enough (≥ {min_major}.{min_minor})"
        ));

        // 3. ffmpeg built with NVENC
        let lists_encoder = run_captured(
            Command::new(&self.tools.ffmpeg).args(["-hide_banner", "-encoders"]),
            self.timeout,
        )
        .map(|o| String::from_utf8_lossy(&o.stdout).contains(HARDWARE_ENCODER))
        .unwrap_or(false);
        if !lists_encoder {
            details.push("✗ ffmpeg was built without NVENC support".to_string());
            return with_gpu(
                CapabilityReport::failed(
                    ProbeStep::ToolSupport,
                    format!("GPU present ({gpu_name}), but ffmpeg was built without NVENC"),
                    Some("Install an ffmpeg build with NVENC support (distribution package, Snap or Flatpak)".to_string()),
                ),
                details,
            );
        }
        details.push(format!("✓ ffmpeg lists {HARDWARE_ENCODER}"));

        // 4. Test encode
        match test_encode(&self.tools.ffmpeg, HARDWARE_ENCODER, self.timeout) {
            Ok(()) => {
                details.push(format!("✓ Test encode with {HARDWARE_ENCODER} succeeded"));
                let mut report = CapabilityReport::ready_with(gpu_name.clone(), driver.clone());
                report.details = details;
                report
            }
            Err(failure) => {
                details.push(format!("✗ Test encode failed: {}", failure.message));
                with_gpu(
                    CapabilityReport::failed(
                        ProbeStep::TestEncode,
                        format!(
                            "GPU present ({gpu_name}), NVENC not usable: {}",
                            failure.message
                        ),
                        Some(failure.hint.to_string()),
                    ),
                    details,
                )
            }
        }
    }
}

/// Parse the first line of `nvidia-smi --query-gpu=name,driver_version`.
pub fn parse_gpu_query(stdout: &str) -> Option<(String, String)> {
    let line = stdout.lines().next()?;
    let mut parts = line.split(',').map(str::trim);
    let name = parts.next().filter(|s| !s.is_empty())?;
    let driver = parts.next().filter(|s| !s.is_empty())?;
    Some((name.to_string(), driver.to_string()))
}

/// Parse `535.288.01` into `(535, 288)`.
pub fn parse_driver_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map(|m| m.parse().ok()).unwrap_or(Some(0))?;
    Some((major, minor))
}

/// Whether `version` meets [`MIN_DRIVER_VERSION`].
pub fn driver_supported(version: &str) -> bool {
    parse_driver_version(version).is_some_and(|v| v >= MIN_DRIVER_VERSION)
}

/// Classified test-encode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeFailure {
    pub message: String,
    pub hint: &'static str,
}

/// Turn the stderr of a failed test encode into a cause and a hint.
pub fn classify_test_encode_failure(stderr: &str) -> EncodeFailure {
    const DRIVER_HINT: &str =
        "Update the NVIDIA driver; the installed one is older than ffmpeg's NVENC API";

    if stderr.contains("nvenc API version") {
        let message = match (
            value_after(stderr, "Required: "),
            value_after(stderr, "Found: "),
        ) {
            (Some(required), Some(found)) => {
                format!("NVENC API too old (installed: {found}, required: {required})")
            }
            _ => "NVENC API version too old".to_string(),
        };
        return EncodeFailure {
            message,
            hint: DRIVER_HINT,
        };
    }
    if stderr.contains("minimum required Nvidia driver") {
        let after = stderr
            .split_once("minimum required")
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        let message = match first_version(after) {
            Some(v) => format!("NVIDIA driver {v} or newer required"),
            None => "NVIDIA driver too old".to_string(),
        };
        return EncodeFailure {
            message,
            hint: DRIVER_HINT,
        };
    }
    if stderr.contains("Cannot load") || stderr.to_lowercase().contains("not found") {
        return EncodeFailure {
            message: "CUDA/NVENC libraries not found".to_string(),
            hint: "Install the NVIDIA encode libraries (libnvidia-encode) matching the driver",
        };
    }

    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let tail = &lines[lines.len().saturating_sub(3)..];
    EncodeFailure {
        message: if tail.is_empty() {
            "unknown error".to_string()
        } else {
            tail.join("; ")
        },
        hint: "Select libx264 or check the ffmpeg output above",
    }
}

fn value_after<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let rest = &text[text.find(marker)? + marker.len()..];
    let value = rest
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()?;
    (!value.is_empty()).then_some(value)
}

fn first_version(text: &str) -> Option<&str> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .find(|s| s.contains('.') && s.chars().next().is_some_and(|c| c.is_ascii_digit()))
}

fn test_encode(ffmpeg: &Path, encoder: &str, timeout: Duration) -> Result<(), EncodeFailure> {
    let output = run_captured(
        Command::new(ffmpeg).args([
            "-hide_banner",
            "-y",
            "-f",
            "lavfi",
            "-i",
            TEST_ENCODE_SOURCE,
            "-c:v",
            encoder,
            "-f",
            "null",
            "-",
        ]),
        timeout,
    );
    match output {
        Some(o) if o.status.success() => Ok(()),
        Some(o) => Err(classify_test_encode_failure(&String::from_utf8_lossy(
            &o.stderr,
        ))),
        None => Err(EncodeFailure {
            message: "test encode did not start or timed out".to_string(),
            hint: "Check that ffmpeg is installed and responsive",
        }),
    }
}

/// Run `cmd` to completion with captured output, killing it after `timeout`.
fn run_captured(cmd: &mut Command, timeout: Duration) -> Option<Output> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .ok()?;

    let mut stdout = child.stdout.take()?;
    let mut stderr = child.stderr.take()?;
    let out_task = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let err_task = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                tracing::warn!(program = ?cmd.get_program(), "Probe command timed out");
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(20)),
            Err(_) => return None,
        }
    };

    Some(Output {
        status,
        stdout: out_task.join().unwrap_or_default(),
        stderr: err_task.join().unwrap_or_default(),
    })
}

/// Process-lifetime memo of the capability report.
#[derive(Debug)]
pub struct CapabilityCache {
    prober: CapabilityProber,
    report: Mutex<Option<CapabilityReport>>,
}

impl CapabilityCache {
    pub fn new(prober: CapabilityProber) -> Self {
        Self {
            prober,
            report: Mutex::new(None),
        }
    }

    /// A cache that starts out holding `report`.
    pub fn preloaded(prober: CapabilityProber, report: CapabilityReport) -> Self {
        Self {
            prober,
            report: Mutex::new(Some(report)),
        }
    }

    /// The cached report, probing on first use.
    pub fn get(&self) -> CapabilityReport {
        let mut slot = match self.report.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(report) = slot.as_ref() {
            return report.clone();
        }
        let report = self.prober.probe();
        *slot = Some(report.clone());
        report
    }

    /// Forget the cached report; the next `get` probes again.
    pub fn invalidate(&self) {
        let mut slot = match self.report.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
        tracing::debug!("Capability cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_query() {
        assert_eq!(
            parse_gpu_query("NVIDIA GeForce RTX 3060, 535.288.01\n"),
            Some(("NVIDIA GeForce RTX 3060".to_string(), "535.288.01".to_string()))
        );
        assert_eq!(parse_gpu_query(""), None);
        assert_eq!(parse_gpu_query("only-name"), None);
    }

    #[test]
    fn test_driver_floor() {
        assert_eq!(parse_driver_version("535.288.01"), Some((535, 288)));
        assert!(!driver_supported("535.288.01"));
        assert!(!driver_supported("550.40"));
        assert!(driver_supported("550.54"));
        assert!(driver_supported("560.35.03"));
        assert!(driver_supported("551"));
        assert!(!driver_supported("garbage"));
    }

    #[test]
    fn test_classify_api_version() {
        let failure = classify_test_encode_failure(
            "[h264_nvenc] Driver does not support the required nvenc API version. Required: 13.0 Found: 12.1",
        );
        assert_eq!(
            failure.message,
            "NVENC API too old (installed: 12.1, required: 13.0)"
        );
    }

    #[test]
    fn test_classify_driver_and_libraries() {
        let failure = classify_test_encode_failure(
            "The minimum required Nvidia driver for nvenc is 550.54 or newer",
        );
        assert_eq!(failure.message, "NVIDIA driver 550.54 or newer required");

        let failure = classify_test_encode_failure("Cannot load libnvidia-encode.so.1");
        assert_eq!(failure.message, "CUDA/NVENC libraries not found");
    }

    #[test]
    fn test_classify_generic_tail() {
        let failure = classify_test_encode_failure("a\nb\n\nc\nd\n");
        assert_eq!(failure.message, "b; c; d");
        assert_eq!(classify_test_encode_failure("").message, "unknown error");
    }

    #[test]
    fn test_missing_nvidia_smi_fails_first_step() {
        let tools = ToolPaths {
            nvidia_smi: "/nonexistent/nvidia-smi".into(),
            ..ToolPaths::default()
        };
        let report = CapabilityProber::new(tools).probe();
        assert!(!report.ready);
        assert_eq!(report.failed_step, Some(ProbeStep::Hardware));
        assert!(report.hint.is_some());
        assert!(report.to_error().is_some());
    }
}
